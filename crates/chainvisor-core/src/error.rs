use thiserror::Error;

/// Error type a migration handler may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid upgrade plan: {0}")]
    InvalidPlan(String),

    #[error("upgrade with name {0} has already been completed")]
    AlreadyDone(String),

    #[error("UPGRADE \"{name}\" NEEDED at height: {height}: {info}")]
    UpgradeRequired {
        name: String,
        height: i64,
        info: String,
    },

    #[error(
        "BINARY UPDATED BEFORE TRIGGER! UPGRADE \"{0}\" - in binary but not executed on chain. Downgrade your binary"
    )]
    BinaryAhead(String),

    #[error("upgrade handler for \"{name}\" failed at height {height}")]
    Migration {
        name: String,
        height: i64,
        #[source]
        source: HandlerError,
    },

    #[error("wrong app version {app_version}, upgrade handler is missing for {name} upgrade plan")]
    Downgrade { name: String, app_version: u64 },

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid upgrade info: {0}")]
    InvalidSignal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// True for the two deliberate halts: the host must terminate the
    /// process, but neither one is a defect in this node.
    pub fn is_halt(&self) -> bool {
        matches!(
            self,
            CoordinatorError::UpgradeRequired { .. } | CoordinatorError::BinaryAhead(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
