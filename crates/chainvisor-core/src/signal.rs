//! The upgrade descriptor handed from the halted node to its supervisor.
//!
//! Wire format (one JSON object, written atomically):
//! ```text
//! {"name": "<upgrade name>", "info": "<operator hint>", "height": <i64>}
//! ```
//! The halted node is the only writer and the supervisor reads it only
//! after the node has exited, so no locking is involved.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoordinatorError, Result};
use crate::paths;
use crate::plan::Plan;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    pub name: String,
    #[serde(default)]
    pub info: String,
    pub height: i64,
}

impl SignalDescriptor {
    /// Descriptor for `plan` halting at `height` (the current block, which
    /// for a time-triggered plan is the first block past the deadline).
    pub fn for_plan(plan: &Plan, height: i64) -> Self {
        Self {
            name: plan.name.clone(),
            info: plan.info.clone(),
            height,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoordinatorError::InvalidSignal("name cannot be empty".into()));
        }
        if self.height <= 0 {
            return Err(CoordinatorError::InvalidSignal(format!(
                "height must be greater than 0, got {}",
                self.height
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// UpgradeInfoFile
// ---------------------------------------------------------------------------

/// Handle on the descriptor file at a fixed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeInfoFile {
    path: PathBuf,
}

impl UpgradeInfoFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<home>/data/upgrade-info.json`
    pub fn in_home(home: &Path) -> Self {
        Self::new(paths::upgrade_info_path(home))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn write(&self, descriptor: &SignalDescriptor) -> Result<()> {
        let data = serde_json::to_vec(descriptor)?;
        crate::io::atomic_write(&self.path, &data)
    }

    /// Read and validate the descriptor. A missing file means no upgrade is
    /// pending and yields `None`.
    pub fn read(&self) -> Result<Option<SignalDescriptor>> {
        let data = match std::fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let descriptor: SignalDescriptor = serde_json::from_slice(&data)?;
        descriptor.validate()?;
        Ok(Some(descriptor))
    }

    /// Remove the descriptor. Returns true if one was present.
    pub fn clear(&self) -> Result<bool> {
        crate::io::remove_if_exists(&self.path)
    }
}
