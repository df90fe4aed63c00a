//! The per-block upgrade state machine.
//!
//! # States
//!
//! ```text
//! Idle ──schedule──▶ Pending ──height/time reached──▶ Due
//!   ▲                  │                               │
//!   └──────cancel──────┴───────────────────────────────┤
//!                                                      ├─ skip height ──▶ Done (handler not run)
//!                                                      ├─ handler     ──▶ Done
//!                                                      └─ no handler  ──▶ Halted
//! ```
//!
//! `Halted` is terminal for the running process. The supervisor installs the
//! next binary, and that binary's first tick at the same height finds a
//! handler and moves the plan to `Done`.
//!
//! `tick` reads nothing but the store, the in-memory handler registry and
//! the header it is given, so every node reaches the same outcome for the
//! same block.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{CoordinatorError, HandlerError, Result};
use crate::paths::{
    done_key, APP_VERSION_KEY, LAST_APPLIED_KEY, PLAN_KEY, STORE_PREFIX, VERSION_MAP_KEY,
};
use crate::plan::{BlockHeader, Plan, VersionMap};
use crate::signal::{SignalDescriptor, UpgradeInfoFile};
use crate::store::{PlanStore, PrefixStore};

/// A state migration for one named upgrade. Receives the stored module
/// version map and returns the updated one.
pub type Handler = Box<
    dyn Fn(&BlockHeader, &Plan, VersionMap) -> std::result::Result<VersionMap, HandlerError>
        + Send
        + Sync,
>;

// ---------------------------------------------------------------------------
// Tick results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The plan is due and this binary cannot apply it.
    UpgradeRequired,
    /// This binary carries a handler for a plan that is not yet due.
    BinaryAhead,
}

/// A deliberate stop. The host must terminate the process; this is not a
/// crash and must not be retried in-process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt {
    pub name: String,
    pub height: i64,
    pub info: String,
    pub reason: HaltReason,
}

impl Halt {
    pub fn into_error(self) -> CoordinatorError {
        match self.reason {
            HaltReason::UpgradeRequired => CoordinatorError::UpgradeRequired {
                name: self.name,
                height: self.height,
                info: self.info,
            },
            HaltReason::BinaryAhead => CoordinatorError::BinaryAhead(self.name),
        }
    }
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().into_error())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    NoOp,
    Applied(String),
    Skipped(String),
    Halted(Halt),
}

impl TickOutcome {
    /// Convert a halt into an error so a host can simply `?` the result.
    pub fn into_result(self) -> Result<TickOutcome> {
        match self {
            TickOutcome::Halted(halt) => Err(halt.into_error()),
            other => Ok(other),
        }
    }
}

/// The most recent upgrade whose handler actually ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedUpgrade {
    pub name: String,
    pub height: i64,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator<S: PlanStore> {
    store: PrefixStore<S>,
    signal: UpgradeInfoFile,
    handlers: BTreeMap<String, Handler>,
    skip_heights: BTreeSet<i64>,
    downgrade_verified: bool,
    halted_at: Option<(String, i64)>,
}

impl<S: PlanStore> Coordinator<S> {
    /// Build a coordinator over `store`. All keys are written under the
    /// `upgrade/` prefix.
    pub fn new(store: S, signal: UpgradeInfoFile) -> Self {
        Self {
            store: PrefixStore::new(store, STORE_PREFIX),
            signal,
            handlers: BTreeMap::new(),
            skip_heights: BTreeSet::new(),
            downgrade_verified: false,
            halted_at: None,
        }
    }

    pub fn store(&self) -> &S {
        self.store.inner()
    }

    pub fn into_store(self) -> S {
        self.store.into_inner()
    }

    pub fn signal_file(&self) -> &UpgradeInfoFile {
        &self.signal
    }

    // -----------------------------------------------------------------------
    // Handler registry and skip heights (process-local, never persisted)
    // -----------------------------------------------------------------------

    /// Register the migration for `name`. A handler must be registered even
    /// when the upgrade needs no migration; use one that returns the map
    /// unchanged.
    pub fn register_handler<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&BlockHeader, &Plan, VersionMap) -> std::result::Result<VersionMap, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        debug!(name = %name, "registered upgrade handler");
        self.handlers.insert(name, Box::new(handler));
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Heights at which a due plan is cleared without running its handler.
    ///
    /// Meant for replaying history past upgrades whose migrations are baked
    /// into the state being synced. Nothing stops an operator from listing a
    /// live upgrade height here, which would skip that migration on this node
    /// only and fork it from the network.
    pub fn set_skip_heights(&mut self, heights: impl IntoIterator<Item = i64>) {
        self.skip_heights = heights.into_iter().collect();
        if !self.skip_heights.is_empty() {
            warn!(heights = ?self.skip_heights, "upgrade skip heights configured");
        }
    }

    pub fn is_skip_height(&self, height: i64) -> bool {
        self.skip_heights.contains(&height)
    }

    // -----------------------------------------------------------------------
    // Schedule / cancel / query
    // -----------------------------------------------------------------------

    /// Schedule `plan`, replacing any pending plan.
    pub fn schedule(&mut self, header: &BlockHeader, plan: Plan) -> Result<()> {
        plan.validate_basic()?;
        if !plan.is_future(header) {
            return Err(CoordinatorError::InvalidPlan(format!(
                "upgrade cannot be scheduled in the past (current height {})",
                header.height
            )));
        }
        if self.done_height(&plan.name)?.is_some() {
            return Err(CoordinatorError::AlreadyDone(plan.name));
        }

        if let Some(old) = self.current()? {
            warn!(old = %old.name, new = %plan.name, "replacing pending upgrade plan");
        }
        self.put_json(PLAN_KEY, &plan)?;
        info!(plan = %plan, "scheduled upgrade");
        Ok(())
    }

    /// Drop the pending plan, if any.
    pub fn cancel(&mut self) -> Result<()> {
        if let Some(plan) = self.current()? {
            self.store.delete(PLAN_KEY)?;
            info!(name = %plan.name, "cancelled upgrade plan");
        }
        Ok(())
    }

    pub fn current(&self) -> Result<Option<Plan>> {
        self.get_json(PLAN_KEY)
    }

    /// Height at which `name` was applied or skipped.
    pub fn done_height(&self, name: &str) -> Result<Option<i64>> {
        self.get_json(&done_key(name))
    }

    pub fn last_applied(&self) -> Result<Option<AppliedUpgrade>> {
        self.get_json(LAST_APPLIED_KEY)
    }

    pub fn version_map(&self) -> Result<VersionMap> {
        Ok(self.get_json(VERSION_MAP_KEY)?.unwrap_or_default())
    }

    /// Seed the module version map, e.g. from genesis.
    pub fn set_version_map(&mut self, versions: &VersionMap) -> Result<()> {
        self.put_json(VERSION_MAP_KEY, versions)
    }

    pub fn app_version(&self) -> Result<u64> {
        Ok(self.get_json(APP_VERSION_KEY)?.unwrap_or(0))
    }

    /// The descriptor currently on disk, if a previous run halted.
    pub fn read_signal(&self) -> Result<Option<SignalDescriptor>> {
        self.signal.read()
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Evaluate the pending plan against `header`. Call exactly once per
    /// block, before any other state transition.
    ///
    /// `Err` is returned for store failures, a failed migration and a
    /// detected downgrade; all of them are fatal for the node. A
    /// [`TickOutcome::Halted`] is equally fatal but expected.
    pub fn tick(&mut self, header: &BlockHeader) -> Result<TickOutcome> {
        let plan = self.current()?;

        if !self.downgrade_verified {
            self.downgrade_verified = true;
            self.verify_binary(header, plan.as_ref())?;
        }

        let Some(plan) = plan else {
            return Ok(TickOutcome::NoOp);
        };

        if let Some((name, height)) = &self.halted_at {
            if *name == plan.name && *height == header.height {
                warn!(name = %name, height, "already halted at this height");
                return Ok(TickOutcome::NoOp);
            }
        }

        if !plan.is_due(header) {
            if self.has_handler(&plan.name) {
                error!(
                    name = %plan.name,
                    height = header.height,
                    "binary carries a handler for an upgrade that is not due yet"
                );
                return Ok(self.halt(&plan, header, HaltReason::BinaryAhead));
            }
            return Ok(TickOutcome::NoOp);
        }

        if self.is_skip_height(header.height) {
            info!(name = %plan.name, height = header.height, "skipping upgrade at skip height");
            self.set_done(&plan.name, header.height)?;
            self.store.delete(PLAN_KEY)?;
            return Ok(TickOutcome::Skipped(plan.name));
        }

        if self.has_handler(&plan.name) {
            self.apply(header, &plan)?;
            return Ok(TickOutcome::Applied(plan.name));
        }

        let descriptor = SignalDescriptor::for_plan(&plan, header.height);
        self.signal.write(&descriptor)?;
        error!(
            name = %plan.name,
            height = header.height,
            info = %plan.info,
            file = %self.signal.path().display(),
            "upgrade needed, halting"
        );
        Ok(self.halt(&plan, header, HaltReason::UpgradeRequired))
    }

    fn halt(&mut self, plan: &Plan, header: &BlockHeader, reason: HaltReason) -> TickOutcome {
        self.halted_at = Some((plan.name.clone(), header.height));
        TickOutcome::Halted(Halt {
            name: plan.name.clone(),
            height: header.height,
            info: plan.info.clone(),
            reason,
        })
    }

    /// Run the handler and record the result. Nothing is written unless the
    /// handler succeeds.
    fn apply(&mut self, header: &BlockHeader, plan: &Plan) -> Result<()> {
        let versions = self.version_map()?;
        let updated = {
            let handler = self.handlers.get(&plan.name).ok_or_else(|| {
                CoordinatorError::InvalidPlan(format!("no handler for {}", plan.name))
            })?;
            handler(header, plan, versions).map_err(|source| CoordinatorError::Migration {
                name: plan.name.clone(),
                height: header.height,
                source,
            })?
        };

        self.set_version_map(&updated)?;
        let app_version = self.app_version()? + 1;
        self.put_json(APP_VERSION_KEY, &app_version)?;
        self.store.delete(PLAN_KEY)?;
        self.set_done(&plan.name, header.height)?;
        self.put_json(
            LAST_APPLIED_KEY,
            &AppliedUpgrade {
                name: plan.name.clone(),
                height: header.height,
            },
        )?;
        if self.signal.clear()? {
            debug!(file = %self.signal.path().display(), "removed upgrade info");
        }
        info!(name = %plan.name, height = header.height, app_version, "applied upgrade");
        Ok(())
    }

    /// Refuse to run a binary older than the chain state: the last applied
    /// upgrade must have a handler here, unless this binary is about to apply
    /// the due plan itself.
    fn verify_binary(&self, header: &BlockHeader, plan: Option<&Plan>) -> Result<()> {
        let applying_now = plan
            .map(|p| p.is_due(header) && !self.is_skip_height(header.height))
            .unwrap_or(false);
        if applying_now {
            return Ok(());
        }
        let Some(last) = self.last_applied()? else {
            return Ok(());
        };
        if self.has_handler(&last.name) {
            return Ok(());
        }
        error!(name = %last.name, "handler for last applied upgrade is missing");
        Err(CoordinatorError::Downgrade {
            name: last.name,
            app_version: self.app_version()?,
        })
    }

    fn set_done(&mut self, name: &str, height: i64) -> Result<()> {
        debug!(name, height, "setting done");
        self.put_json(&done_key(name), &height)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.set(key, &bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
