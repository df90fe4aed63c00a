//! Hooks run after an upgrade is detected and before `current` moves.
//!
//! Two steps, both optional in effect:
//!
//! * an operator script under the chainvisor root, called with the upgrade
//!   name and height;
//! * `<upgrade binary> pre-upgrade`, which the node uses to prepare its data.
//!   Its exit code drives what happens next.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};

/// The node has no `pre-upgrade` command; the upgrade goes ahead.
pub const EXIT_NOT_IMPLEMENTED: i32 = 1;
/// Pre-upgrade failed for good; the upgrade is aborted.
pub const EXIT_FAILED: i32 = 30;
/// Pre-upgrade failed but may succeed when run again.
pub const EXIT_RETRY: i32 = 31;

/// Run the operator's script as `<script> <name> <height>` from `workdir`.
pub async fn run_custom_script(script: &Path, name: &str, height: i64, workdir: &Path) -> Result<()> {
    if !script.is_file() {
        return Err(SupervisorError::PreUpgrade {
            name: name.to_string(),
            reason: format!("custom pre-upgrade script {} does not exist", script.display()),
        });
    }

    info!(script = %script.display(), name, height, "running custom pre-upgrade script");
    let output = Command::new(script)
        .args([name.to_string(), height.to_string()])
        .current_dir(workdir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| SupervisorError::Spawn {
            binary: script.to_path_buf(),
            source,
        })?;
    debug!(stdout = %String::from_utf8_lossy(&output.stdout).trim(), "custom pre-upgrade output");

    if !output.status.success() {
        return Err(SupervisorError::PreUpgrade {
            name: name.to_string(),
            reason: format!(
                "custom script {} exited with {:?}: {}",
                script.display(),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

/// Run `<bin> pre-upgrade`, repeating it up to `max_retries` more times while
/// it exits with [`EXIT_RETRY`].
pub async fn run_preupgrade(bin: &Path, name: &str, max_retries: u32, workdir: &Path) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        debug!(binary = %bin.display(), attempt, "running pre-upgrade");
        let output = Command::new(bin)
            .arg("pre-upgrade")
            .current_dir(workdir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SupervisorError::Spawn {
                binary: bin.to_path_buf(),
                source,
            })?;

        let failed = |what: String| SupervisorError::PreUpgrade {
            name: name.to_string(),
            reason: format!("{what}: {}", String::from_utf8_lossy(&output.stderr).trim()),
        };
        match output.status.code() {
            Some(0) => {
                info!(name, attempt, "pre-upgrade succeeded");
                return Ok(());
            }
            Some(EXIT_NOT_IMPLEMENTED) => {
                info!(name, "node has no pre-upgrade command, continuing");
                return Ok(());
            }
            Some(EXIT_RETRY) if attempt <= max_retries => {
                warn!(name, attempt, max_retries, "pre-upgrade asked to be retried");
            }
            Some(EXIT_RETRY) => {
                return Err(failed(format!("still failing after {attempt} attempts")));
            }
            Some(EXIT_FAILED) => return Err(failed("node reported an unrecoverable error".into())),
            code => return Err(failed(format!("exited with {code:?}"))),
        }
    }
}
