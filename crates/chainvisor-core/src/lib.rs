//! On-chain half of chainvisor.
//!
//! The [`Coordinator`] is invoked once per block by the host. It schedules
//! upgrades by height or time, halts at the scheduled point when the running
//! binary has no handler for the upgrade, and records completed upgrades so
//! a name can never be applied twice. At the halt point it leaves an
//! `upgrade-info.json` descriptor for the off-chain supervisor.

pub mod coordinator;
pub mod error;
pub mod io;
pub mod multierror;
pub mod paths;
pub mod plan;
pub mod signal;
pub mod store;

pub use coordinator::{AppliedUpgrade, Coordinator, Halt, HaltReason, Handler, TickOutcome};
pub use error::{CoordinatorError, HandlerError, Result};
pub use multierror::{flatten_errors, MultiError, SharedError};
pub use plan::{BlockHeader, Plan, VersionMap};
pub use signal::{SignalDescriptor, UpgradeInfoFile};
pub use store::{MemoryStore, PlanStore, PrefixStore, RedbStore};
