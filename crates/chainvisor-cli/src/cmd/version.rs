use chainvisor_supervisor::{Launcher, SupervisorConfig};
use serde::Serialize;
use tracing::{debug, warn};

use crate::output::{print_json, OutputFormat};

#[derive(Debug, Serialize)]
struct VersionInfo {
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    app: Option<String>,
}

/// Print the supervisor version and, when configured, the node binary's.
pub fn run(config: anyhow::Result<SupervisorConfig>, format: OutputFormat) -> anyhow::Result<()> {
    let app = match config {
        Ok(cfg) => {
            let launcher = Launcher::new(cfg);
            let rt = tokio::runtime::Runtime::new()?;
            match rt.block_on(launcher.binary_version()) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "could not query node binary version");
                    None
                }
            }
        }
        Err(e) => {
            debug!(error = %e, "no usable configuration, skipping node version");
            None
        }
    };

    let info = VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        app,
    };
    match format {
        OutputFormat::Json => print_json(&info)?,
        OutputFormat::Text => {
            println!("chainvisor version: {}", info.version);
            if let Some(app) = &info.app {
                println!("{app}");
            }
        }
    }
    Ok(())
}
