use anyhow::Context;
use chainvisor_supervisor::{Launcher, RunOutcome, SupervisorConfig};
use tracing::{debug, info};

/// Supervise the node until it exits for good. Returns the exit code to
/// leave with: the child's own, or 0 after an upgrade that is not followed
/// by a restart, or 128 + signal when stopped while no node was running.
pub fn run(config: SupervisorConfig, args: Vec<String>) -> anyhow::Result<i32> {
    debug!("{}", config.detail_string());
    let launcher = Launcher::new(config);
    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt
        .block_on(async {
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            launcher.supervise(&args, &mut stdout, &mut stderr).await
        })
        .context("supervising node")?;

    match &outcome {
        RunOutcome::Exited { code } => debug!(code, "node exited without upgrade"),
        RunOutcome::Upgraded { name, height } => {
            info!(name = %name, height, "upgrade installed, restart disabled")
        }
        RunOutcome::AwaitingUpgrade { name, height } => info!(
            name = %name,
            height,
            expected = %launcher.layout().upgrade_bin(name).display(),
            "install the upgrade binary and start again"
        ),
        RunOutcome::Interrupted { signal } => info!(signal, "stopped by signal"),
    }
    Ok(outcome.exit_code())
}
