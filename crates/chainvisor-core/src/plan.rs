//! Upgrade plans and the block header they are evaluated against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoordinatorError, Result};

/// Module name → consensus version. Ordered so that every node serializes
/// it identically.
pub type VersionMap = BTreeMap<String, u64>;

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

/// The (height, time) pair the host hands to the coordinator each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: i64,
    pub time: DateTime<Utc>,
}

impl BlockHeader {
    pub fn new(height: i64, time: DateTime<Utc>) -> Self {
        Self { height, time }
    }

    /// Header at `height` with the Unix epoch as block time. Handy for
    /// purely height-triggered flows.
    pub fn at_height(height: i64) -> Self {
        Self {
            height,
            time: DateTime::<Utc>::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A named upgrade trigger. Exactly one of `height` / `time` is set on a
/// valid plan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Opaque operator hint, carried through to the upgrade descriptor.
    #[serde(default)]
    pub info: String,
}

impl Plan {
    pub fn at_height(name: impl Into<String>, height: i64) -> Self {
        Self {
            name: name.into(),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn at_time(name: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            time: Some(time),
            ..Default::default()
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    /// Stateless checks: non-empty name and exactly one positive trigger.
    pub fn validate_basic(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoordinatorError::InvalidPlan("name cannot be empty".into()));
        }
        match (self.height, self.time) {
            (Some(_), Some(_)) => Err(CoordinatorError::InvalidPlan(
                "only one of height or time may be set".into(),
            )),
            (None, None) => Err(CoordinatorError::InvalidPlan(
                "one of height or time must be set".into(),
            )),
            (Some(h), None) if h <= 0 => Err(CoordinatorError::InvalidPlan(format!(
                "height must be greater than 0, got {h}"
            ))),
            _ => Ok(()),
        }
    }

    /// True when the trigger lies strictly after `header`.
    pub fn is_future(&self, header: &BlockHeader) -> bool {
        match (self.height, self.time) {
            (Some(h), None) => h > header.height,
            (None, Some(t)) => t > header.time,
            _ => false,
        }
    }

    /// True once the trigger has been reached. A height plan never looks at
    /// the block time.
    pub fn is_due(&self, header: &BlockHeader) -> bool {
        match (self.height, self.time) {
            (Some(h), None) => header.height >= h,
            (None, Some(t)) => header.time >= t,
            _ => false,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.height, self.time) {
            (Some(h), _) => write!(f, "upgrade \"{}\" at height {h}", self.name),
            (None, Some(t)) => write!(f, "upgrade \"{}\" at time {}", self.name, t.to_rfc3339()),
            (None, None) => write!(f, "upgrade \"{}\" (no trigger)", self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
