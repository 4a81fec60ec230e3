//! Maps protocol-step failures to recovery actions
//!
//! An explicit table rather than a generic retry loop. Create-time failures
//! are pure pass-through (nothing to undo yet); a join rejection self-cleans
//! with rollback before surfacing; every notify-time failure settles locally
//! without reaching the caller.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clearance::ClearanceManager;
use crate::error::{
    BusinessError, LogError, MessageError, MessengerError, ProtocolStep, TransactionError,
};
use crate::reporter::{FailureReporter, StateReport};
use crate::state::{is_commit, STATE_ROLLBACK};

pub struct RecoveryHandler {
    clearance: Arc<ClearanceManager>,
    reporter: Arc<dyn FailureReporter>,
}

impl RecoveryHandler {
    pub fn new(clearance: Arc<ClearanceManager>, reporter: Arc<dyn FailureReporter>) -> Self {
        Self {
            clearance,
            reporter,
        }
    }

    /// Group creation failed; nothing has joined, so nothing is unwound
    pub fn on_create_failure(&self, group_id: &str, err: MessengerError) -> TransactionError {
        match err {
            MessengerError::Transport(source) => {
                warn!(group_id, error = %source, "Group creation failed in transit");
                TransactionError::messaging(ProtocolStep::CreateGroup, source)
            }
            MessengerError::Rejected(source) => {
                warn!(group_id, error = %source, "Group creation rejected");
                TransactionError::business(ProtocolStep::CreateGroup, source)
            }
        }
    }

    /// The join never became durable on the remote side; pass through
    pub fn on_join_transport_failure(
        &self,
        group_id: &str,
        unit_id: &str,
        source: MessageError,
    ) -> TransactionError {
        warn!(group_id, unit_id, error = %source, "Join failed in transit");
        TransactionError::messaging(ProtocolStep::JoinGroup, source)
    }

    /// The remote rejected the join; the local side self-cleans with rollback
    /// before the wrapped cause is surfaced
    pub async fn on_join_rejected(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        source: BusinessError,
    ) -> TransactionError {
        warn!(group_id, unit_id, error = %source, "Join rejected; rolling back local unit");
        self.rollback_quietly(group_id, unit_id, unit_type).await;
        TransactionError::business(ProtocolStep::JoinGroup, source)
    }

    /// The join went through but its trace never became durable; self-clean
    /// like a rejection so no joined unit is left without a ledger entry
    pub async fn on_join_trace_failure(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        source: LogError,
    ) -> TransactionError {
        warn!(group_id, unit_id, error = %source, "Join trace failed; rolling back local unit");
        self.rollback_quietly(group_id, unit_id, unit_type).await;
        TransactionError::log(ProtocolStep::JoinGroup, source)
    }

    /// A business rejection at notify time always settles as rollback
    pub async fn on_notify_rejected(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        source: BusinessError,
    ) {
        if source.is_rollback() {
            debug!(group_id, unit_id, "Rollback requested at notify");
        } else {
            warn!(group_id, unit_id, error = %source, "Notify rejected; forcing rollback");
        }
        self.rollback_quietly(group_id, unit_id, unit_type).await;
    }

    /// The notify never reached the authority
    ///
    /// With a rollback hint this settles exactly like a rejection. With a
    /// commit hint the unit is settled on the hint through the log-retaining
    /// path and a diagnostic report is emitted; the retained entry is the
    /// handle for later reconciliation.
    pub async fn on_notify_transport_failure(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        hinted_state: i32,
        source: MessageError,
    ) {
        if !is_commit(hinted_state) {
            warn!(
                group_id,
                unit_id,
                error = %source,
                "Notify failed in transit; settling hinted rollback"
            );
            self.rollback_quietly(group_id, unit_id, unit_type).await;
            return;
        }

        warn!(
            group_id,
            unit_id,
            hinted_state,
            error = %source,
            "Notify failed in transit; settling on hint, pending entry retained"
        );
        if let Err(err) = self
            .clearance
            .clean_without_log(group_id, unit_id, unit_type, hinted_state)
            .await
        {
            warn!(group_id, unit_id, error = %err, "Cleanup on hinted state failed");
        }
        self.reporter.report_state(StateReport::notify_delivery_failed(
            group_id,
            unit_id,
            hinted_state,
            source.to_string(),
        ));
    }

    async fn rollback_quietly(&self, group_id: &str, unit_id: &str, unit_type: &str) {
        if let Err(err) = self
            .clearance
            .clean(group_id, unit_id, unit_type, STATE_ROLLBACK)
            .await
        {
            warn!(group_id, unit_id, error = %err, "Rollback cleanup failed");
        }
    }
}
