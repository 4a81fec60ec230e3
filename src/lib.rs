#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Cohort
//!
//! Cohort coordinates best-effort distributed transactions across services.
//! Units of work register under a shared group and later learn the group's
//! commit-or-rollback decision; a per-unit clearance service then applies or
//! compensates the local effects.
//!
//! ## Features
//!
//! - **Create / join / notify protocol**: an initiating unit opens a group
//!   that any number of units join; each settles once notified
//! - **Messenger authority**: the group decision is made exactly once, at the
//!   messenger; local hints are only proposals
//! - **At-least-once settlement**: a durable pending ledger plus a background
//!   sweeper converge every unit even across crashes and lost messages
//! - **Duplicate-safe cleanup**: an atomic per-unit settled guard makes
//!   redelivered or racing notifications harmless
//! - **Deadline enforcement**: a whole-group deadline and a per-unit watchdog
//!   turn silence into forced rollback
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use cohort::{
//!     ClearanceError, ClearanceRegistry, ClearanceService, GroupCoordinator, LocalMessenger,
//!     LogReporter, MemoryPendingLog, STATE_COMMIT,
//! };
//!
//! struct OrderClearance;
//!
//! #[async_trait]
//! impl ClearanceService for OrderClearance {
//!     async fn clear(
//!         &self,
//!         group_id: &str,
//!         state: i32,
//!         unit_id: &str,
//!         _unit_type: &str,
//!     ) -> Result<(), ClearanceError> {
//!         println!("clearing {group_id}/{unit_id} with state {state}");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> cohort::Result<()> {
//!     let services = ClearanceRegistry::new();
//!     services.register("order", Arc::new(OrderClearance));
//!
//!     let coordinator = Arc::new(GroupCoordinator::new(
//!         Arc::new(LocalMessenger::new()),
//!         services,
//!         Arc::new(MemoryPendingLog::new()),
//!         Arc::new(LogReporter),
//!     ));
//!     coordinator.spawn_expiry_checker();
//!
//!     coordinator
//!         .create_group("order-77", "unit-a", serde_json::json!({"sku": 42}), "order")
//!         .await?;
//!     coordinator
//!         .join_group("order-77", "unit-b", "order", serde_json::Value::Null)
//!         .await?;
//!
//!     coordinator
//!         .notify_group("order-77", "unit-a", "order", STATE_COMMIT)
//!         .await;
//!     coordinator
//!         .notify_group("order-77", "unit-b", "order", STATE_COMMIT)
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`coordinator`]: the create / join / notify protocol surface
//! - [`clearance`]: service registry and the settle-once cleanup funnel
//! - [`context`]: node-local group state and whole-group deadlines
//! - [`watchdog`]: per-unit silence deadlines
//! - [`pending_log`]: durable ledger of units awaiting cleanup
//! - [`sweeper`]: background re-drive of aged ledger entries
//! - [`messenger`]: transport seam plus an in-process implementation
//! - [`recovery`]: maps each protocol failure to its compensation
//! - [`reporter`]: diagnostic reports for undeliverable commit decisions
//! - [`state`]: unit keys, pending records, state constants
//! - [`error`]: error types and the crate [`Result`] alias
//!
//! ## Configuration
//!
//! Key knobs, all overridable through the config structs:
//!
//! | Knob | Default | Description |
//! |------|---------|-------------|
//! | `max_group_time_ms` | `60000` | Whole-group deadline |
//! | `watchdog.max_wait_ms` | `30000` | Per-unit silence window |
//! | `watchdog.check_interval_ms` | `1000` | Expiry scan period |
//! | `clearance.settled_ttl_ms` | `600000` | Settled-mark retention |
//! | `sweeper.sweep_interval_ms` | `30000` | Ledger sweep period |
//! | `sweeper.min_age_ms` | `60000` | Entry age before re-drive |

// Deny .unwrap() in production code to prevent panics while a unit's group
// state is still in flight. Test code is exempt via #[cfg(test)].
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod clearance;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod messenger;
pub mod pending_log;
pub mod recovery;
pub mod reporter;
pub mod state;
pub mod sweeper;
pub mod watchdog;

// Re-export the protocol surface
pub use coordinator::{CoordinatorConfig, GroupCoordinator};
pub use sweeper::{PendingSweeper, SweeperConfig};

// Re-export clearance types
pub use clearance::{
    ClearanceConfig, ClearanceManager, ClearanceRegistry, ClearanceService,
    ClearanceStatsSnapshot,
};

// Re-export error types
pub use error::{
    BusinessError, ClearanceError, LogError, MessageError, MessengerError, ProtocolStep, Result,
    TransactionError,
};

// Re-export transport and ledger seams
pub use messenger::{LocalMessenger, Messenger};
pub use pending_log::{FilePendingLog, MemoryPendingLog, PendingLog};

// Re-export bookkeeping types
pub use context::NodeContext;
pub use recovery::RecoveryHandler;
pub use reporter::{ChannelReporter, FailureReporter, LogReporter, ReportKind, StateReport};
pub use state::{is_commit, PendingUnit, UnitKey, STATE_COMMIT, STATE_ROLLBACK};
pub use watchdog::{ExpiredUnit, Watchdog, WatchdogConfig, WatchdogStatsSnapshot};
