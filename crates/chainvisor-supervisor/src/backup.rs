//! Copies of the node's data directory taken before a binary swap.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{Result, SupervisorError};

/// Directory name of the backup taken for `upgrade` at `at`.
pub fn backup_dir_name(upgrade: &str, at: DateTime<Utc>) -> String {
    format!(
        "data-backup-{}-{}",
        upgrade.to_lowercase(),
        at.format("%Y%m%dT%H%M%SZ")
    )
}

/// Copy `data_dir` into a fresh `data-backup-*` directory under
/// `backup_root` and return its path. The copy runs on the blocking pool.
pub async fn backup_data(data_dir: &Path, backup_root: &Path, upgrade: &str) -> Result<PathBuf> {
    let dest = backup_root.join(backup_dir_name(upgrade, Utc::now()));
    info!(from = %data_dir.display(), to = %dest.display(), "backing up node data");

    let (src, dst) = (data_dir.to_path_buf(), dest.clone());
    let copied = tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
        .await
        .map_err(io::Error::other)
        .and_then(|res| res);
    copied.map_err(|source| SupervisorError::Backup {
        dest: dest.clone(),
        source,
    })?;

    info!(to = %dest.display(), "data backup complete");
    Ok(dest)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)?;
        if metadata.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
            continue;
        }

        #[cfg(unix)]
        if metadata.file_type().is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&src_path)?, &dst_path)?;
            continue;
        }

        fs::copy(&src_path, &dst_path)?;
    }
    Ok(())
}
