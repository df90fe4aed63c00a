use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chainvisor_core::multierror::shared;
use chainvisor_core::{flatten_errors, paths, SharedError, SignalDescriptor};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::args::parse_skip_heights;
use crate::backup::backup_data;
use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::layout::{is_executable, Layout};
use crate::preupgrade::{run_custom_script, run_preupgrade};

pub const SIGINT: i32 = 2;
pub const SIGTERM: i32 = 15;

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The child exited and left no actionable upgrade descriptor.
    Exited { code: i32 },
    /// The child halted for `name`; `current` now points at its binary.
    Upgraded { name: String, height: i64 },
    /// The child halted for `name` but no binary for it is installed yet.
    AwaitingUpgrade { name: String, height: i64 },
    /// SIGINT or SIGTERM arrived while no node was running.
    Interrupted { signal: i32 },
}

impl RunOutcome {
    pub fn upgrade_detected(&self) -> bool {
        matches!(
            self,
            RunOutcome::Upgraded { .. } | RunOutcome::AwaitingUpgrade { .. }
        )
    }

    /// Exit code to hand back to the operator. Upgrade outcomes are not
    /// failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Exited { code } => *code,
            RunOutcome::Interrupted { signal } => 128 + signal,
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Runs the node binary selected by `current` and reacts to the upgrade
/// descriptor the node leaves behind when it halts.
pub struct Launcher {
    config: SupervisorConfig,
    layout: Layout,
}

impl Launcher {
    pub fn new(config: SupervisorConfig) -> Self {
        let layout = config.layout();
        Self { config, layout }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Launch the current binary once and block until it exits.
    ///
    /// A descriptor already on disk is resolved first: its binary is swapped
    /// in if installed, otherwise the stale binary is not launched at all.
    /// If forwarding output fails the exit is still resolved, and the
    /// `Teardown` error carries the outcome.
    pub async fn run<O, E>(&self, args: &[String], stdout: &mut O, stderr: &mut E) -> Result<RunOutcome>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        let skip_heights = parse_skip_heights(args);

        if let Some(pending) = self.layout.upgrade_info_file().read()? {
            if skip_heights.contains(&pending.height) {
                self.discard_skipped(&pending)?;
            } else {
                info!(name = %pending.name, height = pending.height, "found pending upgrade before launch");
                if let outcome @ RunOutcome::AwaitingUpgrade { .. } = self.apply_descriptor(pending).await? {
                    return Ok(outcome);
                }
            }
        }

        let bin = self.layout.current_bin()?;
        if !is_executable(&bin) {
            return Err(SupervisorError::Layout(format!(
                "no executable binary at {}",
                bin.display()
            )));
        }

        info!(binary = %bin.display(), args = ?args, "launching node");
        let mut child = Command::new(&bin)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: bin.clone(),
                source,
            })?;

        let mut child_out = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Layout("child stdout not captured".into()))?;
        let mut child_err = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::Layout("child stderr not captured".into()))?;

        let (status, out_res, err_res) = tokio::join!(
            self.wait_child(&mut child, &skip_heights),
            forward_output(&mut child_out, stdout),
            forward_output(&mut child_err, stderr),
        );
        let code = exit_code(status?);
        info!(binary = %bin.display(), code, "node exited");

        let outcome = self.resolve_exit(code, &skip_heights).await?;
        if let Some(error) = flatten_errors([out_res, err_res]) {
            error!(error = %error, outcome = ?outcome, "forwarding node output failed");
            return Err(SupervisorError::Teardown {
                error,
                outcome: Box::new(outcome),
            });
        }
        Ok(outcome)
    }

    /// Run until the node exits without requesting an upgrade, or until an
    /// upgrade is detected while restarting is disabled.
    ///
    /// While awaiting a binary that is not installed, re-checks every
    /// `poll_interval` and never relaunches the outdated binary. There is no
    /// upper bound on the wait, but SIGINT or SIGTERM ends it.
    pub async fn supervise<O, E>(
        &self,
        args: &[String],
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<RunOutcome>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        let mut signals = ShutdownListener::install()?;
        self.supervise_until(args, stdout, stderr, signals.recv())
            .await
    }

    /// [`supervise`](Self::supervise) with the shutdown trigger supplied by
    /// the caller. `shutdown` resolves to a signal number and is only
    /// watched between runs; a running node gets signals forwarded instead.
    pub async fn supervise_until<O, E, F>(
        &self,
        args: &[String],
        stdout: &mut O,
        stderr: &mut E,
        shutdown: F,
    ) -> Result<RunOutcome>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
        F: Future<Output = i32>,
    {
        tokio::pin!(shutdown);
        let mut iteration: u64 = 0;
        loop {
            iteration += 1;
            debug!(iteration, "supervisor iteration");
            let outcome = self.run(args, stdout, stderr).await?;
            if !self.config.restart_after_upgrade || !outcome.upgrade_detected() {
                return Ok(outcome);
            }

            tokio::select! {
                () = self.pause_before_restart(&outcome) => {}
                signal = &mut shutdown => {
                    info!(signal, outcome = ?outcome, "shutdown requested, not restarting node");
                    return Ok(RunOutcome::Interrupted { signal });
                }
            }
            info!(iteration, outcome = ?outcome, "restarting node");
        }
    }

    /// Run `<current binary> version` and return its trimmed output.
    pub async fn binary_version(&self) -> Result<String> {
        let bin = self.layout.current_bin()?;
        let output = Command::new(&bin)
            .arg("version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SupervisorError::Spawn {
                binary: bin.clone(),
                source,
            })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text.trim().to_string())
    }

    async fn resolve_exit(&self, code: i32, skip_heights: &[i64]) -> Result<RunOutcome> {
        let Some(descriptor) = self.layout.upgrade_info_file().read()? else {
            return Ok(RunOutcome::Exited { code });
        };
        if skip_heights.contains(&descriptor.height) {
            self.discard_skipped(&descriptor)?;
            return Ok(RunOutcome::Exited { code });
        }
        self.apply_descriptor(descriptor).await
    }

    /// Drop a descriptor whose height the node was told to skip, so a later
    /// start without the flag does not swap to it.
    fn discard_skipped(&self, descriptor: &SignalDescriptor) -> Result<()> {
        self.layout.upgrade_info_file().clear()?;
        info!(
            name = %descriptor.name,
            height = descriptor.height,
            "upgrade height is in the skip list, descriptor cleared without swapping"
        );
        Ok(())
    }

    async fn apply_descriptor(&self, descriptor: SignalDescriptor) -> Result<RunOutcome> {
        let SignalDescriptor { name, height, .. } = descriptor;
        if !self.layout.has_upgrade_binary(&name) {
            if self.config.allow_download {
                warn!(name = %name, "binary downloads are not performed, install the binary manually");
            }
            warn!(
                name = %name,
                height,
                expected = %self.layout.upgrade_bin(&name).display(),
                "upgrade binary not installed, awaiting upgrade"
            );
            return Ok(RunOutcome::AwaitingUpgrade { name, height });
        }

        self.prepare_upgrade(&name, height).await?;
        self.layout.set_current(&name)?;
        self.layout.upgrade_info_file().clear()?;
        info!(name = %name, height, "swapped to upgrade binary");
        Ok(RunOutcome::Upgraded { name, height })
    }

    /// Back up node data and run the pre-upgrade hooks. Nothing moves on disk
    /// if a step fails, so the next start retries the whole upgrade.
    async fn prepare_upgrade(&self, name: &str, height: i64) -> Result<()> {
        let home = self.layout.home();
        if self.config.unsafe_skip_backup {
            warn!(name, "data backup disabled, swapping without one");
        } else {
            backup_data(&paths::data_dir(home), self.config.backup_dir(), name).await?;
        }
        if let Some(script) = self.config.custom_preupgrade_path() {
            run_custom_script(&script, name, height, home).await?;
        }
        run_preupgrade(
            &self.layout.upgrade_bin(name),
            name,
            self.config.preupgrade_max_retries,
            home,
        )
        .await
    }

    async fn pause_before_restart(&self, outcome: &RunOutcome) {
        if let RunOutcome::AwaitingUpgrade { name, .. } = outcome {
            self.wait_for_binary(name).await;
        }
        if !self.config.restart_delay.is_zero() {
            info!(delay = ?self.config.restart_delay, "waiting before restart");
            tokio::time::sleep(self.config.restart_delay).await;
        }
    }

    async fn wait_for_binary(&self, name: &str) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.layout.has_upgrade_binary(name) {
                info!(name, "upgrade binary appeared");
                return;
            }
            debug!(name, "still awaiting upgrade binary");
        }
    }

    /// Wait for `child`, relaying SIGINT and SIGTERM to it. With a shutdown
    /// grace configured, a descriptor that shows up while the node is still
    /// running gets the node interrupted, then killed once the grace is up.
    async fn wait_child(&self, child: &mut Child, skip_heights: &[i64]) -> std::io::Result<ExitStatus> {
        let mut signals = ShutdownListener::install()?;
        let pid = child.id();
        let grace = self.config.shutdown_grace;
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                status = child.wait() => return status,
                signal = signals.recv() => send_signal(pid, signal).await,
                _ = poll.tick(), if !grace.is_zero() => {
                    if self.upgrade_pending(skip_heights) {
                        return stop_for_upgrade(child, pid, grace).await;
                    }
                }
            }
        }
    }

    fn upgrade_pending(&self, skip_heights: &[i64]) -> bool {
        match self.layout.upgrade_info_file().read() {
            Ok(Some(descriptor)) => !skip_heights.contains(&descriptor.height),
            Ok(None) => false,
            Err(e) => {
                debug!(error = %e, "upgrade descriptor not readable yet");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Child process helpers
// ---------------------------------------------------------------------------

/// SIGINT and SIGTERM as a stream. Installing it replaces the default
/// action for both signals in this process.
struct ShutdownListener {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownListener {
    fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Next signal number received.
    async fn recv(&mut self) -> i32 {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => SIGINT,
                _ = self.terminate.recv() => SIGTERM,
            }
        }
        #[cfg(not(unix))]
        {
            match tokio::signal::ctrl_c().await {
                Ok(()) => SIGINT,
                Err(_) => std::future::pending().await,
            }
        }
    }
}

/// Copy `reader` to `writer` until EOF. Once the writer fails the rest is
/// drained into a sink so the child never blocks on a full pipe.
async fn forward_output<R, W>(reader: &mut R, writer: &mut W) -> Option<SharedError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let forwarded = match tokio::io::copy(reader, writer).await {
        Ok(_) => writer.flush().await,
        Err(e) => Err(e),
    };
    let err = forwarded.err()?;
    warn!(error = %err, "cannot forward node output, discarding the rest");
    if let Err(e) = tokio::io::copy(reader, &mut tokio::io::sink()).await {
        debug!(error = %e, "draining node output failed");
    }
    Some(shared(err))
}

async fn stop_for_upgrade(child: &mut Child, pid: Option<u32>, grace: Duration) -> std::io::Result<ExitStatus> {
    info!(?grace, "upgrade descriptor found while node is running, interrupting it");
    send_signal(pid, SIGINT).await;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(?grace, "node outlived the shutdown grace, killing it");
            child.kill().await?;
            child.wait().await
        }
    }
}

async fn send_signal(pid: Option<u32>, signal: i32) {
    let Some(pid) = pid else {
        return;
    };
    let name = if signal == SIGINT { "INT" } else { "TERM" };
    #[cfg(unix)]
    {
        info!(pid, signal = name, "sending signal to node");
        match Command::new("kill")
            .args([format!("-{name}"), pid.to_string()])
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(pid, signal = name, code = ?status.code(), "kill failed"),
            Err(e) => warn!(pid, signal = name, error = %e, "kill failed"),
        }
    }
    #[cfg(not(unix))]
    warn!(pid, signal = name, "signals can only be relayed on unix");
}

/// Exit code of `status`, or 128 + signal number when the child was killed
/// by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_script(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn setup(restart: bool) -> (TempDir, Launcher) {
        setup_with(restart, |_| {})
    }

    fn setup_with(restart: bool, tweak: impl FnOnce(&mut SupervisorConfig)) -> (TempDir, Launcher) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("chainvisor")).unwrap();
        let mut cfg = SupervisorConfig::new(dir.path(), "dummyd");
        cfg.restart_after_upgrade = restart;
        cfg.poll_interval = Duration::from_millis(20);
        tweak(&mut cfg);
        (dir, Launcher::new(cfg))
    }

    /// Shell lines that leave a descriptor for `v2` at height 49.
    fn descriptor_lines(launcher: &Launcher) -> String {
        let info = launcher.layout().monitored_file();
        format!(
            r#"mkdir -p "{dir}"
printf '{{"name":"v2","info":"{{}}","height":49}}' > "{file}""#,
            dir = info.parent().unwrap().display(),
            file = info.display(),
        )
    }

    /// Genesis binary that echoes its args, leaves a descriptor for `v2` at
    /// height 49 and exits non-zero like a halted node.
    fn install_halting_genesis(launcher: &Launcher) {
        write_script(
            &launcher.layout().genesis_bin(),
            &format!(
                r#"echo "Genesis $@"
{descriptor}
echo 'UPGRADE "v2" NEEDED at height: 49: {{}}'
exit 1"#,
                descriptor = descriptor_lines(launcher),
            ),
        );
    }

    fn install_v2(launcher: &Launcher) {
        write_script(
            &launcher.layout().upgrade_bin("v2"),
            r#"[ "$1" = "pre-upgrade" ] && exit 0
echo "Chain 2 is live!"
echo "Args: $@"
echo "Finished successfully""#,
        );
    }

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    async fn run(launcher: &Launcher, a: &[&str]) -> (RunOutcome, String, String) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let outcome = launcher.run(&args(a), &mut out, &mut err).await.unwrap();
        (
            outcome,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    fn backups(home: &Path) -> Vec<String> {
        fs::read_dir(home)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("data-backup-"))
            .collect()
    }

    // -- Plain runs ---------------------------------------------------------

    #[tokio::test]
    async fn normal_exit_propagates_code() {
        let (_dir, launcher) = setup(true);
        write_script(&launcher.layout().genesis_bin(), "echo hello; echo oops >&2; exit 3");

        let (outcome, out, err) = run(&launcher, &[]).await;
        assert_eq!(outcome, RunOutcome::Exited { code: 3 });
        assert_eq!(outcome.exit_code(), 3);
        assert!(!outcome.upgrade_detected());
        assert_eq!(out, "hello\n");
        assert_eq!(err, "oops\n");
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().genesis_bin()
        );
    }

    #[tokio::test]
    async fn halt_with_installed_binary_swaps() {
        let (dir, launcher) = setup(false);
        install_halting_genesis(&launcher);
        install_v2(&launcher);

        let (outcome, out, _) = run(&launcher, &["foo", "bar", "1234"]).await;
        assert_eq!(
            outcome,
            RunOutcome::Upgraded {
                name: "v2".into(),
                height: 49
            }
        );
        assert_eq!(
            out,
            "Genesis foo bar 1234\nUPGRADE \"v2\" NEEDED at height: 49: {}\n"
        );
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().upgrade_bin("v2")
        );
        assert!(!launcher.layout().monitored_file().exists());

        let taken = backups(dir.path());
        assert_eq!(taken.len(), 1);
        assert!(taken[0].starts_with("data-backup-v2-"));
        assert!(dir.path().join(&taken[0]).join("upgrade-info.json").exists());

        let (outcome, out, _) = run(&launcher, &["second", "run", "--verbose"]).await;
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
        assert_eq!(
            out,
            "Chain 2 is live!\nArgs: second run --verbose\nFinished successfully\n"
        );
    }

    #[tokio::test]
    async fn missing_binary_awaits_without_relaunch() {
        let (_dir, launcher) = setup(false);
        install_halting_genesis(&launcher);

        let (outcome, _, _) = run(&launcher, &[]).await;
        assert_eq!(
            outcome,
            RunOutcome::AwaitingUpgrade {
                name: "v2".into(),
                height: 49
            }
        );
        assert!(outcome.upgrade_detected());
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().genesis_bin()
        );
        assert!(launcher.layout().monitored_file().exists());

        // A second run must not start the stale genesis binary again.
        let (outcome, out, _) = run(&launcher, &[]).await;
        assert!(matches!(outcome, RunOutcome::AwaitingUpgrade { .. }));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn skip_height_in_child_args_prevents_swap() {
        let (_dir, launcher) = setup(true);
        install_halting_genesis(&launcher);
        install_v2(&launcher);

        let (outcome, _, _) = run(&launcher, &["start", "--unsafe-skip-upgrades", "49"]).await;
        assert_eq!(outcome, RunOutcome::Exited { code: 1 });
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().genesis_bin()
        );
        assert!(!launcher.layout().monitored_file().exists());
    }

    #[tokio::test]
    async fn pending_descriptor_at_skip_height_is_cleared_before_launch() {
        let (_dir, launcher) = setup(true);
        install_v2(&launcher);
        write_script(&launcher.layout().genesis_bin(), "echo 'Genesis runs'");
        launcher
            .layout()
            .upgrade_info_file()
            .write(&SignalDescriptor {
                name: "v2".into(),
                info: String::new(),
                height: 49,
            })
            .unwrap();

        let (outcome, out, _) = run(&launcher, &["--unsafe-skip-upgrades=49"]).await;
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
        assert_eq!(out, "Genesis runs\n");
        assert!(!launcher.layout().monitored_file().exists());

        // Without the flag nothing is left to swap to.
        let (outcome, _, _) = run(&launcher, &[]).await;
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().genesis_bin()
        );
    }

    #[tokio::test]
    async fn missing_current_binary_is_a_layout_error() {
        let (_dir, launcher) = setup(true);
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let res = launcher.run(&args(&[]), &mut out, &mut err).await;
        assert!(matches!(res, Err(SupervisorError::Layout(_))));
    }

    #[tokio::test]
    async fn binary_version_reports_output() {
        let (_dir, launcher) = setup(true);
        write_script(&launcher.layout().genesis_bin(), r#"echo "dummyd $1 v0.1.0""#);
        assert_eq!(
            launcher.binary_version().await.unwrap(),
            "dummyd version v0.1.0"
        );
    }

    // -- Supervise loop -----------------------------------------------------

    #[tokio::test]
    async fn supervise_relaunches_after_swap() {
        let (_dir, launcher) = setup(true);
        install_halting_genesis(&launcher);
        install_v2(&launcher);

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let outcome = launcher
            .supervise(&args(&["start"]), &mut out, &mut err)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("Genesis start\n"));
        assert!(out.ends_with("Args: start\nFinished successfully\n"));
    }

    #[tokio::test]
    async fn supervise_waits_for_binary_then_continues() {
        let (_dir, launcher) = setup(true);
        install_halting_genesis(&launcher);
        let v2_bin = launcher.layout().upgrade_bin("v2");

        let installer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            write_script(&v2_bin, "echo 'Chain 2 is live!'");
        });

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            launcher.supervise(&args(&[]), &mut out, &mut err),
        )
        .await
        .expect("supervise should finish once the binary is installed")
        .unwrap();
        installer.await.unwrap();

        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches("Genesis").count(), 1);
        assert!(out.ends_with("Chain 2 is live!\n"));
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().upgrade_bin("v2")
        );
    }

    #[tokio::test]
    async fn restart_delay_is_honoured() {
        let (_dir, launcher) = setup_with(true, |cfg| cfg.restart_delay = Duration::from_millis(300));
        install_halting_genesis(&launcher);
        install_v2(&launcher);

        let start = std::time::Instant::now();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        launcher
            .supervise(&args(&[]), &mut out, &mut err)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn shutdown_while_awaiting_binary_stops_supervise() {
        let (_dir, launcher) = setup(true);
        install_halting_genesis(&launcher);

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            SIGTERM
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            launcher.supervise_until(&args(&[]), &mut out, &mut err, shutdown),
        )
        .await
        .expect("shutdown must end the wait for a binary")
        .unwrap();

        assert_eq!(outcome, RunOutcome::Interrupted { signal: SIGTERM });
        assert_eq!(outcome.exit_code(), 143);
        assert!(!outcome.upgrade_detected());
        assert!(launcher.layout().monitored_file().exists());
    }

    #[tokio::test]
    async fn shutdown_during_restart_delay_skips_relaunch() {
        let (_dir, launcher) = setup_with(true, |cfg| cfg.restart_delay = Duration::from_secs(60));
        install_halting_genesis(&launcher);
        install_v2(&launcher);

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            SIGINT
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            launcher.supervise_until(&args(&[]), &mut out, &mut err, shutdown),
        )
        .await
        .expect("shutdown must cut the restart delay short")
        .unwrap();

        assert_eq!(outcome, RunOutcome::Interrupted { signal: SIGINT });
        assert_eq!(outcome.exit_code(), 130);
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().upgrade_bin("v2")
        );
        assert!(!String::from_utf8(out).unwrap().contains("Chain 2 is live!"));
    }

    // -- Backup and pre-upgrade hooks ---------------------------------------

    #[tokio::test]
    async fn skip_backup_swaps_without_copy() {
        let (dir, launcher) = setup_with(false, |cfg| cfg.unsafe_skip_backup = true);
        install_halting_genesis(&launcher);
        install_v2(&launcher);

        let (outcome, _, _) = run(&launcher, &[]).await;
        assert!(matches!(outcome, RunOutcome::Upgraded { .. }));
        assert!(backups(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn backups_go_to_configured_dir() {
        let backup_root = TempDir::new().unwrap();
        let root = backup_root.path().to_path_buf();
        let (dir, launcher) = setup_with(false, |cfg| cfg.data_backup_dir = Some(root));
        install_halting_genesis(&launcher);
        install_v2(&launcher);

        run(&launcher, &[]).await;
        assert!(backups(dir.path()).is_empty());
        assert_eq!(backups(backup_root.path()).len(), 1);
    }

    #[tokio::test]
    async fn custom_preupgrade_script_runs_before_swap() {
        let (dir, launcher) = setup_with(false, |cfg| {
            cfg.unsafe_skip_backup = true;
            cfg.custom_preupgrade = Some("preupgrade.sh".into());
        });
        install_halting_genesis(&launcher);
        install_v2(&launcher);
        write_script(
            &dir.path().join("chainvisor/preupgrade.sh"),
            r#"touch "upgrade_name_$1_height_$2""#,
        );

        let (outcome, _, _) = run(&launcher, &[]).await;
        assert!(matches!(outcome, RunOutcome::Upgraded { .. }));
        assert!(dir.path().join("upgrade_name_v2_height_49").exists());
    }

    #[tokio::test]
    async fn missing_custom_script_blocks_the_swap() {
        let (_dir, launcher) = setup_with(false, |cfg| {
            cfg.unsafe_skip_backup = true;
            cfg.custom_preupgrade = Some("missing.sh".into());
        });
        install_halting_genesis(&launcher);
        install_v2(&launcher);

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let err = launcher
            .run(&args(&[]), &mut out, &mut err)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.sh"));
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().genesis_bin()
        );
        assert!(launcher.layout().monitored_file().exists());
    }

    #[tokio::test]
    async fn failing_preupgrade_keeps_old_binary() {
        let (_dir, launcher) = setup_with(false, |cfg| {
            cfg.unsafe_skip_backup = true;
            cfg.preupgrade_max_retries = 3;
        });
        install_halting_genesis(&launcher);
        write_script(
            &launcher.layout().upgrade_bin("v2"),
            r#"[ "$1" = "pre-upgrade" ] && exit 30
echo "Chain 2 is live!""#,
        );

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let res = launcher.run(&args(&[]), &mut out, &mut err).await;
        assert!(matches!(res, Err(SupervisorError::PreUpgrade { .. })));
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().genesis_bin()
        );
    }

    // -- Shutdown grace -----------------------------------------------------

    #[tokio::test]
    async fn node_ignoring_interrupt_is_killed_after_grace() {
        let (_dir, launcher) = setup_with(false, |cfg| {
            cfg.unsafe_skip_backup = true;
            cfg.shutdown_grace = Duration::from_millis(300);
        });
        install_v2(&launcher);
        write_script(
            &launcher.layout().genesis_bin(),
            &format!(
                r#"trap '' INT
echo "Genesis $@"
echo 'WARN Need Flush'
{descriptor}
exec sleep 30"#,
                descriptor = descriptor_lines(&launcher),
            ),
        );

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            launcher.run(&args(&["start"]), &mut out, &mut err),
        )
        .await
        .expect("node should be killed once the grace runs out")
        .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Upgraded {
                name: "v2".into(),
                height: 49
            }
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Genesis start\nWARN Need Flush\n"
        );
    }

    #[tokio::test]
    async fn interrupted_node_may_flush_within_grace() {
        let (_dir, launcher) = setup_with(false, |cfg| {
            cfg.unsafe_skip_backup = true;
            cfg.shutdown_grace = Duration::from_secs(5);
        });
        install_v2(&launcher);
        write_script(
            &launcher.layout().genesis_bin(),
            &format!(
                r#"trap 'echo Flushed; exit 0' INT
echo "Genesis $@"
echo 'WARN Need Flush'
{descriptor}
sleep 30 >/dev/null 2>&1 &
wait"#,
                descriptor = descriptor_lines(&launcher),
            ),
        );

        let start = std::time::Instant::now();
        let (outcome, out, _) = run(&launcher, &["start"]).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(outcome, RunOutcome::Upgraded { .. }));
        assert_eq!(out, "Genesis start\nWARN Need Flush\nFlushed\n");
    }

    // -- Output forwarding --------------------------------------------------

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::Error::other("disk full")))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failing_writer_does_not_block_a_chatty_node() {
        let (_dir, launcher) = setup(true);
        write_script(
            &launcher.layout().genesis_bin(),
            "head -c 1000000 /dev/zero; echo done >&2",
        );

        let (mut out, mut err) = (FailingWriter, Vec::new());
        let res = tokio::time::timeout(
            Duration::from_secs(10),
            launcher.run(&args(&[]), &mut out, &mut err),
        )
        .await
        .expect("a full stdout pipe must not stall the run");

        match res {
            Err(e @ SupervisorError::Teardown { .. }) => {
                assert!(e.to_string().contains("disk full"));
                assert_eq!(e.outcome(), Some(&RunOutcome::Exited { code: 0 }));
            }
            other => panic!("expected teardown error, got {other:?}"),
        }
        assert_eq!(err, b"done\n");
    }

    #[tokio::test]
    async fn upgrade_survives_output_forwarding_failure() {
        let (_dir, launcher) = setup(false);
        install_halting_genesis(&launcher);
        install_v2(&launcher);

        let (mut out, mut err) = (FailingWriter, FailingWriter);
        let res = launcher.run(&args(&[]), &mut out, &mut err).await;
        let e = res.unwrap_err();
        assert_eq!(
            e.outcome(),
            Some(&RunOutcome::Upgraded {
                name: "v2".into(),
                height: 49
            })
        );
        assert_eq!(
            launcher.layout().current_bin().unwrap(),
            launcher.layout().upgrade_bin("v2")
        );
        assert!(!launcher.layout().monitored_file().exists());
    }

    #[tokio::test]
    async fn forwarded_signal_reaches_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        send_signal(child.id(), SIGTERM).await;
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(status), 128 + 15);
    }
}
