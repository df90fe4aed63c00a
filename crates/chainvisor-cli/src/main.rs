mod cmd;
mod output;

use chainvisor_supervisor::SupervisorConfig;
use clap::{Parser, Subcommand};
use output::OutputFormat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "chainvisor",
    about = "Run a chain node and swap its binary at coordinated upgrade halts",
    version,
    propagate_version = true
)]
struct Cli {
    /// Node home directory
    #[arg(long, global = true, env = "DAEMON_HOME")]
    home: Option<PathBuf>,

    /// Node binary name
    #[arg(long, global = true, env = "DAEMON_NAME")]
    name: Option<String>,

    /// YAML config file, used instead of the DAEMON_* variables
    #[arg(long = "config", global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node binary, passing every following argument through
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the supervisor version, and the node's when configured
    Version {
        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Validate and print the configuration
    Config {
        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = cmd::load_config(
        cli.config_file.as_deref(),
        cli.home.as_deref(),
        cli.name.as_deref(),
    );

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    init_logging(default_level, config.as_ref().ok());

    let result = match cli.command {
        Commands::Run { args } => config.and_then(|cfg| cmd::run::run(cfg, args)),
        Commands::Version { output } => cmd::version::run(config, output).map(|()| 0),
        Commands::Config { output } => cmd::config::run(config, output).map(|()| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Supervisor logs go to stderr so the node's stdout stays untouched.
fn init_logging(default_level: tracing::Level, config: Option<&SupervisorConfig>) {
    let filter = if config.is_some_and(|c| c.disable_logs) {
        tracing_subscriber::EnvFilter::new("off")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
