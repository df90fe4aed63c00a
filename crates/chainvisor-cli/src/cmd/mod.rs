pub mod config;
pub mod run;
pub mod version;

use anyhow::Context;
use chainvisor_supervisor::config::{ENV_HOME, ENV_NAME};
use chainvisor_supervisor::SupervisorConfig;
use std::path::Path;

/// Resolve the supervisor configuration: a YAML file when given, otherwise
/// the `DAEMON_*` environment with `--home` / `--name` taking precedence.
pub fn load_config(
    file: Option<&Path>,
    home: Option<&Path>,
    name: Option<&str>,
) -> anyhow::Result<SupervisorConfig> {
    if let Some(path) = file {
        return SupervisorConfig::load_yaml(path)
            .with_context(|| format!("loading {}", path.display()));
    }
    let cfg = SupervisorConfig::from_lookup(|key| match key {
        ENV_HOME => home
            .map(|h| h.display().to_string())
            .or_else(|| std::env::var(key).ok()),
        ENV_NAME => name.map(str::to_string).or_else(|| std::env::var(key).ok()),
        _ => std::env::var(key).ok(),
    })?;
    Ok(cfg)
}
