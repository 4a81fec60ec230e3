//! Error types for the coordination core
//!
//! The taxonomy mirrors the protocol: transport failures and remote business
//! rejections arrive through the messenger while clearance failures are
//! local, and business callers of `create_group`/`join_group` only ever see
//! the single public [`TransactionError`].

use thiserror::Error;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Protocol step at which a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStep {
    CreateGroup,
    JoinGroup,
    NotifyGroup,
}

impl std::fmt::Display for ProtocolStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolStep::CreateGroup => write!(f, "create-group"),
            ProtocolStep::JoinGroup => write!(f, "join-group"),
            ProtocolStep::NotifyGroup => write!(f, "notify-group"),
        }
    }
}

/// Transport-level messaging failure domain
///
/// These are not retried inside this core; the watchdog layer bounds how long
/// a unit can be left waiting on a lost message.
#[derive(Debug, Error, Clone)]
pub enum MessageError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("send timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    #[error("{0}")]
    Message(String),
}

impl MessageError {
    pub fn connection(detail: impl Into<String>) -> Self {
        Self::Connection(detail.into())
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn channel_closed(detail: impl Into<String>) -> Self {
        Self::ChannelClosed(detail.into())
    }
}

impl From<String> for MessageError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for MessageError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

/// Remote business rejection domain
///
/// `UserRollback` is an explicit rollback request from business code; it
/// always forces the decided state to `0`, overriding any stale hint.
#[derive(Debug, Error, Clone)]
pub enum BusinessError {
    #[error("rejected by remote: {0}")]
    Rejected(String),
    #[error("rollback requested: {0}")]
    UserRollback(String),
    #[error("group deadline exceeded (budget {max_ms}ms)")]
    DeadlineExceeded { max_ms: u64 },
    #[error("{0}")]
    Message(String),
}

impl BusinessError {
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self::Rejected(detail.into())
    }

    pub fn user_rollback(detail: impl Into<String>) -> Self {
        Self::UserRollback(detail.into())
    }

    pub fn deadline_exceeded(max_ms: u64) -> Self {
        Self::DeadlineExceeded { max_ms }
    }

    /// Returns true if this rejection carries explicit rollback intent
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::UserRollback(_))
    }
}

impl From<String> for BusinessError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for BusinessError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

/// Error type of the messenger seam
#[derive(Debug, Error, Clone)]
pub enum MessengerError {
    #[error("messaging failure: {0}")]
    Transport(#[from] MessageError),
    #[error("business rejection: {0}")]
    Rejected(#[from] BusinessError),
}

/// Durable pending-log failure domain
#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl From<String> for LogError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for LogError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

/// Local compensation failure raised by a clearance service
///
/// `need_compensation` distinguishes the two outcomes the core cares about:
/// `true` means the side effect did not apply and the durable pending entry
/// must be retained for a later re-drive; `false` means the failure is final
/// and the entry can be released. Unknown errors default to final so that
/// nothing retries forever without being asked to.
#[derive(Debug, Error, Clone)]
#[error("clearance failed for {group_id}/{unit_id}: {detail}")]
pub struct ClearanceError {
    pub group_id: String,
    pub unit_id: String,
    pub detail: String,
    pub need_compensation: bool,
}

impl ClearanceError {
    /// A failure that must be re-driven later; the pending entry is retained
    pub fn retryable(
        group_id: impl Into<String>,
        unit_id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            unit_id: unit_id.into(),
            detail: detail.into(),
            need_compensation: true,
        }
    }

    /// A final failure; the pending entry is released
    pub fn terminal(
        group_id: impl Into<String>,
        unit_id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            unit_id: unit_id.into(),
            detail: detail.into(),
            need_compensation: false,
        }
    }
}

/// Main error surfaced to business callers
///
/// Only `create_group` and `join_group` return this; `notify_group` absorbs
/// all failures by contract.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("messaging failure during {step}: {source}")]
    Messaging {
        step: ProtocolStep,
        #[source]
        source: MessageError,
    },

    #[error("business rejection during {step}: {source}")]
    Business {
        step: ProtocolStep,
        #[source]
        source: BusinessError,
    },

    #[error("pending log failure during {step}: {source}")]
    Log {
        step: ProtocolStep,
        #[source]
        source: LogError,
    },
}

impl TransactionError {
    pub fn messaging(step: ProtocolStep, source: MessageError) -> Self {
        Self::Messaging { step, source }
    }

    pub fn business(step: ProtocolStep, source: BusinessError) -> Self {
        Self::Business { step, source }
    }

    pub fn log(step: ProtocolStep, source: LogError) -> Self {
        Self::Log { step, source }
    }

    /// Step at which the failure occurred
    pub fn step(&self) -> ProtocolStep {
        match self {
            Self::Messaging { step, .. } | Self::Business { step, .. } | Self::Log { step, .. } => {
                *step
            }
        }
    }

    /// Returns true if the underlying cause carries explicit rollback intent
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::Business { source, .. } if source.is_rollback())
    }
}
