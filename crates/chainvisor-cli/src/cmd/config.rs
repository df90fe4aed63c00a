use chainvisor_supervisor::SupervisorConfig;

use crate::output::{print_json, OutputFormat};

pub fn run(config: anyhow::Result<SupervisorConfig>, format: OutputFormat) -> anyhow::Result<()> {
    let config = config?;
    match format {
        OutputFormat::Text => println!("{}", config.detail_string()),
        OutputFormat::Json => print_json(&config)?,
    }
    Ok(())
}
