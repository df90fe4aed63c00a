//! Supervisor settings read from `DAEMON_*` environment variables or a YAML file.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chainvisor_core::{flatten_errors, multierror::shared, SharedError};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigIssue, Result, SupervisorError};
use crate::layout::Layout;

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

pub const ENV_HOME: &str = "DAEMON_HOME";
pub const ENV_NAME: &str = "DAEMON_NAME";
pub const ENV_DOWNLOAD_BIN: &str = "DAEMON_ALLOW_DOWNLOAD_BINARIES";
pub const ENV_RESTART_UPGRADE: &str = "DAEMON_RESTART_AFTER_UPGRADE";
pub const ENV_RESTART_DELAY: &str = "DAEMON_RESTART_DELAY";
pub const ENV_POLL_INTERVAL: &str = "DAEMON_POLL_INTERVAL";
pub const ENV_DISABLE_RECASE: &str = "DAEMON_DISABLE_RECASE";
pub const ENV_DISABLE_LOGS: &str = "DAEMON_DISABLE_LOGS";
pub const ENV_SKIP_BACKUP: &str = "UNSAFE_SKIP_BACKUP";
pub const ENV_DATA_BACKUP_DIR: &str = "DAEMON_DATA_BACKUP_DIR";
pub const ENV_PREUPGRADE_MAX_RETRIES: &str = "DAEMON_PREUPGRADE_MAX_RETRIES";
pub const ENV_CUSTOM_PREUPGRADE: &str = "CHAINVISOR_CUSTOM_PREUPGRADE";
pub const ENV_SHUTDOWN_GRACE: &str = "DAEMON_SHUTDOWN_GRACE";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

// ---------------------------------------------------------------------------
// SupervisorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub home: PathBuf,
    pub name: String,
    #[serde(default)]
    pub allow_download: bool,
    #[serde(default = "default_true")]
    pub restart_after_upgrade: bool,
    #[serde(default, with = "duration_str")]
    pub restart_delay: Duration,
    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub disable_recase: bool,
    #[serde(default)]
    pub disable_logs: bool,
    #[serde(default)]
    pub unsafe_skip_backup: bool,
    /// Where data backups go. Defaults to `home`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub preupgrade_max_retries: u32,
    /// Script file name under the chainvisor root, run before each swap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_preupgrade: Option<String>,
    /// How long a node gets to exit after being interrupted for an upgrade
    /// before it is killed. Zero leaves shutdown to the node.
    #[serde(default, with = "duration_str")]
    pub shutdown_grace: Duration,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

impl SupervisorConfig {
    /// Config with defaults for everything but the two required values.
    pub fn new(home: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            home: home.into(),
            name: name.into(),
            allow_download: false,
            restart_after_upgrade: true,
            restart_delay: Duration::ZERO,
            poll_interval: DEFAULT_POLL_INTERVAL,
            disable_recase: false,
            disable_logs: false,
            unsafe_skip_backup: false,
            data_backup_dir: None,
            preupgrade_max_retries: 0,
            custom_preupgrade: None,
            shutdown_grace: Duration::ZERO,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build and validate a config from `lookup` (an environment stand-in).
    /// Empty values count as unset. Every problem is reported, not just the
    /// first.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut issues: Vec<ConfigIssue> = Vec::new();

        let mut cfg = Self::new(
            get(ENV_HOME).map(PathBuf::from).unwrap_or_default(),
            get(ENV_NAME).unwrap_or_default(),
        );

        let bool_vars: [(&'static str, &mut bool); 5] = [
            (ENV_DOWNLOAD_BIN, &mut cfg.allow_download),
            (ENV_RESTART_UPGRADE, &mut cfg.restart_after_upgrade),
            (ENV_DISABLE_RECASE, &mut cfg.disable_recase),
            (ENV_DISABLE_LOGS, &mut cfg.disable_logs),
            (ENV_SKIP_BACKUP, &mut cfg.unsafe_skip_backup),
        ];
        for (var, slot) in bool_vars {
            if let Some(value) = get(var) {
                match parse_bool(&value) {
                    Some(b) => *slot = b,
                    None => issues.push(ConfigIssue::InvalidBool { var, value }),
                }
            }
        }

        if let Some(value) = get(ENV_RESTART_DELAY) {
            match parse_duration(&value) {
                Some(d) if d.is_zero() => issues.push(ConfigIssue::NotPositive(ENV_RESTART_DELAY)),
                Some(d) => cfg.restart_delay = d,
                None => issues.push(ConfigIssue::InvalidDuration {
                    var: ENV_RESTART_DELAY,
                    value,
                }),
            }
        }
        if let Some(value) = get(ENV_POLL_INTERVAL) {
            match parse_duration(&value) {
                Some(d) => cfg.poll_interval = d,
                None => issues.push(ConfigIssue::InvalidDuration {
                    var: ENV_POLL_INTERVAL,
                    value,
                }),
            }
        }
        if let Some(value) = get(ENV_SHUTDOWN_GRACE) {
            match parse_duration(&value) {
                Some(d) => cfg.shutdown_grace = d,
                None => issues.push(ConfigIssue::InvalidDuration {
                    var: ENV_SHUTDOWN_GRACE,
                    value,
                }),
            }
        }
        if let Some(value) = get(ENV_PREUPGRADE_MAX_RETRIES) {
            match value.trim().parse::<u32>() {
                Ok(n) => cfg.preupgrade_max_retries = n,
                Err(_) => issues.push(ConfigIssue::InvalidNumber {
                    var: ENV_PREUPGRADE_MAX_RETRIES,
                    value,
                }),
            }
        }
        cfg.data_backup_dir = get(ENV_DATA_BACKUP_DIR).map(PathBuf::from);
        cfg.custom_preupgrade = get(ENV_CUSTOM_PREUPGRADE);

        issues.extend(cfg.issues());
        into_result(issues).map(|()| cfg)
    }

    /// Load and validate a YAML config file.
    pub fn load_yaml(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: SupervisorConfig = serde_yaml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        into_result(self.issues())
    }

    fn issues(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.home.as_os_str().is_empty() {
            issues.push(ConfigIssue::Missing(ENV_HOME));
        } else if !self.home.is_absolute() {
            issues.push(ConfigIssue::NotAbsolute {
                var: ENV_HOME,
                path: self.home.clone(),
            });
        } else if !self.home.is_dir() {
            issues.push(ConfigIssue::NotDirectory(self.home.clone()));
        } else if !self.layout().root().is_dir() {
            issues.push(ConfigIssue::NotDirectory(self.layout().root()));
        }
        if self.name.trim().is_empty() {
            issues.push(ConfigIssue::Missing(ENV_NAME));
        }
        if self.poll_interval.is_zero() {
            issues.push(ConfigIssue::NotPositive(ENV_POLL_INTERVAL));
        }
        // An unset backup dir falls back to home, which is checked above.
        if let (false, Some(dir)) = (self.unsafe_skip_backup, &self.data_backup_dir) {
            if !dir.is_absolute() {
                issues.push(ConfigIssue::NotAbsolute {
                    var: ENV_DATA_BACKUP_DIR,
                    path: dir.clone(),
                });
            } else if !dir.is_dir() {
                issues.push(ConfigIssue::NotDirectory(dir.clone()));
            }
        }
        issues
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.home, &self.name, self.disable_recase)
    }

    pub fn backup_dir(&self) -> &Path {
        self.data_backup_dir.as_deref().unwrap_or(&self.home)
    }

    /// Full path of the custom pre-upgrade script, when one is configured.
    pub fn custom_preupgrade_path(&self) -> Option<PathBuf> {
        self.custom_preupgrade
            .as_deref()
            .map(|script| self.layout().root().join(script))
    }

    /// Human-readable dump of every setting and the paths derived from them.
    pub fn detail_string(&self) -> String {
        let layout = self.layout();
        let mut s = String::new();
        let _ = writeln!(s, "Configurable Values:");
        let _ = writeln!(s, "  {ENV_HOME}: {}", self.home.display());
        let _ = writeln!(s, "  {ENV_NAME}: {}", self.name);
        let _ = writeln!(s, "  {ENV_DOWNLOAD_BIN}: {}", self.allow_download);
        let _ = writeln!(s, "  {ENV_RESTART_UPGRADE}: {}", self.restart_after_upgrade);
        let _ = writeln!(s, "  {ENV_RESTART_DELAY}: {}", format_duration(self.restart_delay));
        let _ = writeln!(s, "  {ENV_POLL_INTERVAL}: {}", format_duration(self.poll_interval));
        let _ = writeln!(s, "  {ENV_DISABLE_RECASE}: {}", self.disable_recase);
        let _ = writeln!(s, "  {ENV_DISABLE_LOGS}: {}", self.disable_logs);
        let _ = writeln!(s, "  {ENV_SKIP_BACKUP}: {}", self.unsafe_skip_backup);
        let _ = writeln!(s, "  {ENV_DATA_BACKUP_DIR}: {}", self.backup_dir().display());
        let _ = writeln!(s, "  {ENV_PREUPGRADE_MAX_RETRIES}: {}", self.preupgrade_max_retries);
        let _ = writeln!(
            s,
            "  {ENV_CUSTOM_PREUPGRADE}: {}",
            self.custom_preupgrade.as_deref().unwrap_or("")
        );
        let _ = writeln!(s, "  {ENV_SHUTDOWN_GRACE}: {}", format_duration(self.shutdown_grace));
        let _ = writeln!(s, "Derived Values:");
        let _ = writeln!(s, "  Root Dir: {}", layout.root().display());
        let _ = writeln!(s, "  Upgrade Dir: {}", layout.upgrades_dir().display());
        let _ = writeln!(s, "  Genesis Bin: {}", layout.genesis_bin().display());
        let _ = writeln!(s, "  Monitored File: {}", layout.monitored_file().display());
        let _ = write!(s, "  Data Backup Dir: {}", self.backup_dir().display());
        s
    }
}

fn into_result(issues: Vec<ConfigIssue>) -> Result<()> {
    let errs = issues.into_iter().map(|i| Some(shared(i)));
    match flatten_errors(errs) {
        Some(e) => Err(SupervisorError::Config(e)),
        None => Ok(()),
    }
}

/// Number of individual problems inside a `SupervisorError::Config`.
pub fn issue_count(err: &SharedError) -> usize {
    err.downcast_ref::<chainvisor_core::MultiError>()
        .map_or(1, |m| m.len())
}

// ---------------------------------------------------------------------------
// Value parsing
// ---------------------------------------------------------------------------

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Parse `<integer><unit>` with unit one of `ms`, `s`, `m`, `h`. A bare `0`
/// is accepted.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value == "0" {
        return Some(Duration::ZERO);
    }
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = value.split_at(split);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms != 0 && ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid duration {raw:?}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn home() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("chainvisor")).unwrap();
        dir
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(vars: &HashMap<String, String>) -> Result<SupervisorConfig> {
        SupervisorConfig::from_lookup(|k| vars.get(k).cloned())
    }

    fn config_err(res: Result<SupervisorConfig>) -> SharedError {
        match res {
            Err(SupervisorError::Config(e)) => e,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn minimal_env_uses_defaults() {
        let dir = home();
        let home_str = dir.path().to_str().unwrap();
        let cfg = load(&env(&[(ENV_HOME, home_str), (ENV_NAME, "simd")])).unwrap();
        assert_eq!(cfg.name, "simd");
        assert!(cfg.restart_after_upgrade);
        assert!(!cfg.allow_download);
        assert_eq!(cfg.poll_interval, Duration::from_millis(300));
        assert_eq!(cfg.restart_delay, Duration::ZERO);
        assert!(!cfg.unsafe_skip_backup);
        assert_eq!(cfg.backup_dir(), dir.path());
        assert_eq!(cfg.preupgrade_max_retries, 0);
        assert_eq!(cfg.custom_preupgrade_path(), None);
        assert_eq!(cfg.shutdown_grace, Duration::ZERO);
    }

    #[test]
    fn full_env_is_parsed() {
        let dir = home();
        let home_str = dir.path().to_str().unwrap();
        let cfg = load(&env(&[
            (ENV_HOME, home_str),
            (ENV_NAME, "simd"),
            (ENV_DOWNLOAD_BIN, "TRUE"),
            (ENV_RESTART_UPGRADE, "False"),
            (ENV_RESTART_DELAY, "600ms"),
            (ENV_POLL_INTERVAL, "2s"),
            (ENV_DISABLE_RECASE, "true"),
            (ENV_DISABLE_LOGS, ""),
            (ENV_SKIP_BACKUP, "true"),
            (ENV_DATA_BACKUP_DIR, "relative/is/fine/when/skipping"),
            (ENV_PREUPGRADE_MAX_RETRIES, "3"),
            (ENV_CUSTOM_PREUPGRADE, "preupgrade.sh"),
            (ENV_SHUTDOWN_GRACE, "2s"),
        ]))
        .unwrap();
        assert!(cfg.allow_download);
        assert!(!cfg.restart_after_upgrade);
        assert_eq!(cfg.restart_delay, Duration::from_millis(600));
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert!(cfg.disable_recase);
        assert!(!cfg.disable_logs);
        assert!(cfg.unsafe_skip_backup);
        assert_eq!(cfg.preupgrade_max_retries, 3);
        assert_eq!(
            cfg.custom_preupgrade_path(),
            Some(dir.path().join("chainvisor/preupgrade.sh"))
        );
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(2));
    }

    #[test]
    fn missing_required_values_are_all_reported() {
        let err = config_err(load(&env(&[])));
        assert_eq!(issue_count(&err), 2);
        let msg = err.to_string();
        assert!(msg.contains("DAEMON_HOME is not set"));
        assert!(msg.contains("DAEMON_NAME is not set"));
    }

    #[test]
    fn every_bad_value_is_collected() {
        let dir = home();
        let home_str = dir.path().to_str().unwrap();
        let err = config_err(load(&env(&[
            (ENV_HOME, home_str),
            (ENV_NAME, "simd"),
            (ENV_DOWNLOAD_BIN, "bad"),
            (ENV_RESTART_UPGRADE, "yes"),
            (ENV_RESTART_DELAY, "0"),
            (ENV_POLL_INTERVAL, "soon"),
            (ENV_SKIP_BACKUP, "maybe"),
            (ENV_PREUPGRADE_MAX_RETRIES, "-1"),
            (ENV_SHUTDOWN_GRACE, "later"),
            (ENV_DATA_BACKUP_DIR, "relative"),
        ])));
        assert_eq!(issue_count(&err), 8);
        assert!(err.to_string().starts_with("8 errors: 1: "));
    }

    #[test]
    fn single_problem_is_not_wrapped() {
        let dir = home();
        let home_str = dir.path().to_str().unwrap();
        let err = config_err(load(&env(&[
            (ENV_HOME, home_str),
            (ENV_NAME, "simd"),
            (ENV_POLL_INTERVAL, "0"),
        ])));
        assert_eq!(issue_count(&err), 1);
        assert_eq!(
            err.downcast_ref::<ConfigIssue>(),
            Some(&ConfigIssue::NotPositive(ENV_POLL_INTERVAL))
        );
    }

    #[test]
    fn home_must_be_absolute_with_root_dir() {
        let err = config_err(load(&env(&[(ENV_HOME, "relative/home"), (ENV_NAME, "simd")])));
        assert!(err.to_string().contains("absolute"));

        let bare = TempDir::new().unwrap();
        let err = config_err(load(&env(&[
            (ENV_HOME, bare.path().to_str().unwrap()),
            (ENV_NAME, "simd"),
        ])));
        assert!(err.to_string().contains("chainvisor"));
    }

    #[test]
    fn backup_dir_is_checked_unless_backups_are_skipped() {
        let dir = home();
        let home_str = dir.path().to_str().unwrap();
        for bad in ["relative/backups", "/no/such/backup/dir"] {
            let err = config_err(load(&env(&[
                (ENV_HOME, home_str),
                (ENV_NAME, "simd"),
                (ENV_DATA_BACKUP_DIR, bad),
            ])));
            assert_eq!(issue_count(&err), 1, "{bad}");
        }

        let cfg = load(&env(&[
            (ENV_HOME, home_str),
            (ENV_NAME, "simd"),
            (ENV_SKIP_BACKUP, "true"),
            (ENV_DATA_BACKUP_DIR, "/no/such/backup/dir"),
        ]))
        .unwrap();
        assert!(cfg.unsafe_skip_backup);

        let backups = TempDir::new().unwrap();
        let cfg = load(&env(&[
            (ENV_HOME, home_str),
            (ENV_NAME, "simd"),
            (ENV_DATA_BACKUP_DIR, backups.path().to_str().unwrap()),
        ]))
        .unwrap();
        assert_eq!(cfg.backup_dir(), backups.path());
    }

    #[test]
    fn detail_string_lists_values_and_paths() {
        let mut cfg = SupervisorConfig::new("/home", "test-name");
        cfg.allow_download = true;
        cfg.poll_interval = Duration::from_millis(406);
        cfg.preupgrade_max_retries = 8;
        let s = cfg.detail_string();
        for piece in [
            "Configurable Values:",
            "DAEMON_HOME: /home",
            "DAEMON_NAME: test-name",
            "DAEMON_ALLOW_DOWNLOAD_BINARIES: true",
            "DAEMON_RESTART_AFTER_UPGRADE: true",
            "DAEMON_POLL_INTERVAL: 406ms",
            "Derived Values:",
            "Root Dir: /home/chainvisor",
            "Upgrade Dir: /home/chainvisor/upgrades",
            "Genesis Bin: /home/chainvisor/upgrades/genesis/bin/test-name",
            "UNSAFE_SKIP_BACKUP: false",
            "DAEMON_DATA_BACKUP_DIR: /home",
            "DAEMON_PREUPGRADE_MAX_RETRIES: 8",
            "DAEMON_SHUTDOWN_GRACE: 0ms",
            "Monitored File: /home/data/upgrade-info.json",
            "Data Backup Dir: /home",
        ] {
            assert!(s.contains(piece), "missing {piece:?} in\n{s}");
        }
    }

    #[test]
    fn yaml_file_is_validated() {
        let dir = home();
        let path = dir.path().join("chainvisor.yaml");
        let yaml = format!(
            "home: {}\nname: simd\npoll_interval: 1s\nrestart_after_upgrade: false\n",
            dir.path().display()
        );
        std::fs::write(&path, yaml).unwrap();
        let cfg = SupervisorConfig::load_yaml(&path).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert!(!cfg.restart_after_upgrade);

        std::fs::write(&path, "home: /definitely/not/here\nname: \"\"\n").unwrap();
        let err = match SupervisorConfig::load_yaml(&path) {
            Err(SupervisorError::Config(e)) => e,
            other => panic!("expected config error, got {other:?}"),
        };
        assert_eq!(issue_count(&err), 2);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("303ms"), Some(Duration::from_millis(303)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("ms"), None);
        assert_eq!(format_duration(Duration::from_secs(2)), "2s");
        assert_eq!(format_duration(Duration::ZERO), "0ms");
    }
}
