//! On-disk layout under the node home.
//!
//! ```text
//! <home>/
//!   chainvisor/
//!     current -> upgrades/<active>        (absent: genesis)
//!     upgrades/
//!       genesis/bin/<name>
//!       <upgrade>/bin/<name>
//!   data/upgrade-info.json
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chainvisor_core::{paths, UpgradeInfoFile};
use tracing::info;

use crate::error::{Result, SupervisorError};

pub const ROOT_DIR: &str = "chainvisor";
pub const UPGRADES_DIR: &str = "upgrades";
pub const GENESIS_DIR: &str = "genesis";
pub const CURRENT_LINK: &str = "current";
pub const BIN_DIR: &str = "bin";

const CURRENT_TMP: &str = "current.tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    home: PathBuf,
    name: String,
    disable_recase: bool,
}

impl Layout {
    pub fn new(home: impl Into<PathBuf>, name: impl Into<String>, disable_recase: bool) -> Self {
        Self {
            home: home.into(),
            name: name.into(),
            disable_recase,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn binary_name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> PathBuf {
        self.home.join(ROOT_DIR)
    }

    pub fn upgrades_dir(&self) -> PathBuf {
        self.root().join(UPGRADES_DIR)
    }

    pub fn genesis_dir(&self) -> PathBuf {
        self.upgrades_dir().join(GENESIS_DIR)
    }

    pub fn genesis_bin(&self) -> PathBuf {
        self.genesis_dir().join(BIN_DIR).join(&self.name)
    }

    /// Directory for `upgrade`, lowercased unless recasing is disabled and
    /// escaped so the name stays a single path component.
    pub fn upgrade_dir(&self, upgrade: &str) -> PathBuf {
        let name = if self.disable_recase {
            upgrade.to_string()
        } else {
            upgrade.to_lowercase()
        };
        self.upgrades_dir().join(escape_path_segment(&name))
    }

    pub fn upgrade_bin(&self, upgrade: &str) -> PathBuf {
        self.upgrade_dir(upgrade).join(BIN_DIR).join(&self.name)
    }

    pub fn current_link(&self) -> PathBuf {
        self.root().join(CURRENT_LINK)
    }

    pub fn monitored_file(&self) -> PathBuf {
        paths::upgrade_info_path(&self.home)
    }

    pub fn upgrade_info_file(&self) -> UpgradeInfoFile {
        UpgradeInfoFile::in_home(&self.home)
    }

    /// The active upgrade directory. A missing `current` link means genesis.
    pub fn current_dir(&self) -> Result<PathBuf> {
        let link = self.current_link();
        match fs::read_link(&link) {
            Ok(target) if target.is_absolute() => Ok(target),
            Ok(target) => Ok(self.root().join(target)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(self.genesis_dir()),
            Err(e) => Err(SupervisorError::Layout(format!(
                "cannot read {}: {e}",
                link.display()
            ))),
        }
    }

    pub fn current_bin(&self) -> Result<PathBuf> {
        Ok(self.current_dir()?.join(BIN_DIR).join(&self.name))
    }

    /// True when a runnable binary for `upgrade` has been installed.
    pub fn has_upgrade_binary(&self, upgrade: &str) -> bool {
        is_executable(&self.upgrade_bin(upgrade))
    }

    /// Atomically repoint `current` at `upgrade`. A temporary link is created
    /// beside `current` and renamed over it.
    pub fn set_current(&self, upgrade: &str) -> Result<PathBuf> {
        let bin = self.upgrade_bin(upgrade);
        if !is_executable(&bin) {
            return Err(SupervisorError::Layout(format!(
                "no executable binary for upgrade {upgrade:?} at {}",
                bin.display()
            )));
        }
        let target = self.upgrade_dir(upgrade);
        let tmp = self.root().join(CURRENT_TMP);
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        symlink_dir(&target, &tmp)?;
        fs::rename(&tmp, self.current_link())?;
        info!(upgrade, target = %target.display(), "current now points at upgrade");
        Ok(target)
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9-_.~]`.
pub fn escape_path_segment(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    // "." and ".." are unreserved but would still walk the tree.
    match out.as_str() {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => out,
    }
}

/// A regular file with at least one execute bit. Symlinks are followed.
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn symlink_dir(target: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (target, link);
        Err(SupervisorError::Layout(
            "the current link requires symlink support".into(),
        ))
    }
}
