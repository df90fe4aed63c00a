//! Off-chain half of chainvisor.
//!
//! The [`Launcher`] runs the node binary that `current` points at, forwards
//! its output, and once it exits looks for the upgrade descriptor the node's
//! coordinator writes when it halts. If the named upgrade's binary is
//! installed, `current` is repointed and the node restarted; if not, the
//! supervisor waits instead of relaunching the outdated binary. Before a swap
//! the node's data is backed up and the pre-upgrade hooks run.

pub mod args;
pub mod backup;
pub mod config;
pub mod error;
pub mod launcher;
pub mod layout;
pub mod preupgrade;

pub use config::SupervisorConfig;
pub use error::{ConfigIssue, Result, SupervisorError};
pub use launcher::{Launcher, RunOutcome};
pub use layout::Layout;
