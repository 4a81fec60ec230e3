//! Fire-and-forget diagnostics for failures that are swallowed by contract
//!
//! `notify_group` never surfaces errors, so the only out-of-band signal that
//! a delivery failed is a [`StateReport`]. Reporters must never fail and must
//! not block the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Kind of diagnostic report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    /// A notify round-trip failed in transit while the caller still hinted
    /// commit; the unit was settled locally on the hint and the pending
    /// entry retained for reconciliation
    NotifyDeliveryFailed,
}

/// A single diagnostic report about a unit's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateReport {
    pub report_id: Uuid,
    pub group_id: String,
    pub unit_id: String,
    pub kind: ReportKind,
    /// Wire state involved (hinted or decided)
    pub state: i32,
    pub note: String,
    pub reported_at: DateTime<Utc>,
}

impl StateReport {
    pub fn notify_delivery_failed(
        group_id: impl Into<String>,
        unit_id: impl Into<String>,
        state: i32,
        note: impl Into<String>,
    ) -> Self {
        Self {
            report_id: Uuid::new_v4(),
            group_id: group_id.into(),
            unit_id: unit_id.into(),
            kind: ReportKind::NotifyDeliveryFailed,
            state,
            note: note.into(),
            reported_at: Utc::now(),
        }
    }
}

/// Diagnostics sink; implementations must never fail or block meaningfully
pub trait FailureReporter: Send + Sync {
    fn report_state(&self, report: StateReport);
}

/// Reporter that emits each report as a structured warning
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl FailureReporter for LogReporter {
    fn report_state(&self, report: StateReport) {
        warn!(
            report_id = %report.report_id,
            group_id = %report.group_id,
            unit_id = %report.unit_id,
            kind = ?report.kind,
            state = report.state,
            note = %report.note,
            "Transaction state reported"
        );
    }
}

/// Reporter that hands reports to a bounded channel for out-of-band handling
///
/// Reports are dropped with a warning when the channel is full or the
/// receiver is gone; diagnostics never back-pressure the protocol path.
#[derive(Debug)]
pub struct ChannelReporter {
    tx: mpsc::Sender<StateReport>,
}

impl ChannelReporter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StateReport>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl FailureReporter for ChannelReporter {
    fn report_state(&self, report: StateReport) {
        if let Err(err) = self.tx.try_send(report) {
            warn!(error = %err, "Dropping state report");
        }
    }
}
