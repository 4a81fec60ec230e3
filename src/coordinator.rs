//! Group coordinator: the protocol surface business code calls
//!
//! A group is created once and joined by any number of units; a later notify
//! lands the decided state on each of them. The coordinator wires the
//! node-local bookkeeping, the watchdog, the durable pending ledger, and the
//! clearance funnel together, and owns the background expiry checker that
//! turns watchdog silence into forced rollbacks.
//!
//! Failure policy in one line: `create_group` and `join_group` surface a
//! [`TransactionError`] (join self-cleans first when the remote rejected it);
//! `notify_group` never fails: every outcome is settled locally and at worst
//! observable through logs, diagnostic reports, and the pending ledger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::clearance::{ClearanceConfig, ClearanceManager, ClearanceRegistry};
use crate::context::{NodeContext, DEFAULT_MAX_GROUP_TIME_MS};
use crate::error::{
    BusinessError, LogError, MessengerError, ProtocolStep, Result, TransactionError,
};
use crate::messenger::Messenger;
use crate::pending_log::PendingLog;
use crate::recovery::RecoveryHandler;
use crate::reporter::FailureReporter;
use crate::state::{PendingUnit, STATE_ROLLBACK};
use crate::watchdog::{Watchdog, WatchdogConfig};

/// Top-level configuration for a [`GroupCoordinator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Whole-group deadline in milliseconds
    pub max_group_time_ms: u64,
    pub watchdog: WatchdogConfig,
    pub clearance: ClearanceConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_group_time_ms: DEFAULT_MAX_GROUP_TIME_MS,
            watchdog: WatchdogConfig::default(),
            clearance: ClearanceConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_group_time_ms(mut self, max_group_time_ms: u64) -> Self {
        self.max_group_time_ms = max_group_time_ms;
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_clearance(mut self, clearance: ClearanceConfig) -> Self {
        self.clearance = clearance;
        self
    }
}

/// Coordinates group lifecycle for every unit on this node
pub struct GroupCoordinator {
    messenger: Arc<dyn Messenger>,
    log: Arc<dyn PendingLog>,
    context: Arc<NodeContext>,
    watchdog: Arc<Watchdog>,
    clearance: Arc<ClearanceManager>,
    recovery: RecoveryHandler,
    shutdown: Arc<AtomicBool>,
    expiry_notify: Arc<Notify>,
}

impl GroupCoordinator {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        services: ClearanceRegistry,
        log: Arc<dyn PendingLog>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self::with_config(
            messenger,
            services,
            log,
            reporter,
            CoordinatorConfig::default(),
        )
    }

    pub fn with_config(
        messenger: Arc<dyn Messenger>,
        services: ClearanceRegistry,
        log: Arc<dyn PendingLog>,
        reporter: Arc<dyn FailureReporter>,
        config: CoordinatorConfig,
    ) -> Self {
        let context = Arc::new(NodeContext::new(config.max_group_time_ms));
        let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));
        let clearance = Arc::new(ClearanceManager::with_config(
            services,
            Arc::clone(&context),
            Arc::clone(&watchdog),
            Arc::clone(&log),
            config.clearance.clone(),
        ));
        let recovery = RecoveryHandler::new(Arc::clone(&clearance), reporter);
        info!(
            max_group_time_ms = config.max_group_time_ms,
            max_wait_ms = config.watchdog.max_wait_ms,
            "Group coordinator initialized"
        );
        Self {
            messenger,
            log,
            context,
            watchdog,
            clearance,
            recovery,
            shutdown: Arc::new(AtomicBool::new(false)),
            expiry_notify: Arc::new(Notify::new()),
        }
    }

    /// Register a new group and trace the initiating unit
    ///
    /// No compensation is attempted on failure: nothing has committed to
    /// anything yet, so both transport failures and remote rejections are
    /// wrapped and returned as-is.
    pub async fn create_group(
        &self,
        group_id: &str,
        unit_id: &str,
        info: serde_json::Value,
        unit_type: &str,
    ) -> Result<()> {
        debug!(group_id, unit_id, unit_type, "Creating group");
        if let Err(err) = self.messenger.create_group(group_id).await {
            return Err(self.recovery.on_create_failure(group_id, err));
        }

        self.context.begin_group(group_id);
        let unit = PendingUnit::new(group_id, unit_id, unit_type, info);
        if let Err(err) = self.log.trace(&unit) {
            // Nothing to unwind; the group exists remotely but no unit joined.
            warn!(group_id, unit_id, error = %err, "Initiator trace failed");
            return Err(TransactionError::log(ProtocolStep::CreateGroup, err));
        }

        info!(group_id, unit_id, "Group created");
        Ok(())
    }

    /// Join a unit into an existing group
    ///
    /// Carries the locally-known group state on the join message; on success
    /// the watchdog is armed and the pending entry becomes durable.
    pub async fn join_group(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        info: serde_json::Value,
    ) -> Result<()> {
        let local_state = self.context.group_state(group_id);
        debug!(group_id, unit_id, unit_type, local_state, "Joining group");

        match self
            .messenger
            .join_group(group_id, unit_id, unit_type, local_state)
            .await
        {
            Ok(()) => {}
            Err(MessengerError::Transport(err)) => {
                return Err(self
                    .recovery
                    .on_join_transport_failure(group_id, unit_id, err));
            }
            Err(MessengerError::Rejected(err)) => {
                return Err(self
                    .recovery
                    .on_join_rejected(group_id, unit_id, unit_type, err)
                    .await);
            }
        }

        self.context.begin_group(group_id);
        self.watchdog.start(group_id, unit_id, unit_type);
        let unit = PendingUnit::new(group_id, unit_id, unit_type, info);
        if let Err(err) = self.log.trace(&unit) {
            return Err(self
                .recovery
                .on_join_trace_failure(group_id, unit_id, unit_type, err)
                .await);
        }

        info!(group_id, unit_id, unit_type, "Unit joined group");
        Ok(())
    }

    /// Resolve the group decision and clean the unit; never fails
    ///
    /// `state_hint` is this caller's view; the messenger's answer is
    /// authoritative. When the whole-group deadline already passed, the
    /// round-trip is skipped entirely and the unit settles as rollback.
    pub async fn notify_group(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        state_hint: i32,
    ) {
        if self.context.deadline_exceeded(group_id) {
            debug!(
                group_id,
                unit_id, "Group deadline exceeded; skipping notify round-trip"
            );
            let err = BusinessError::deadline_exceeded(self.context.max_group_time_ms());
            self.recovery
                .on_notify_rejected(group_id, unit_id, unit_type, err)
                .await;
            return;
        }

        match self.messenger.notify_group(group_id, state_hint).await {
            Ok(decided) => {
                if decided != state_hint {
                    debug!(group_id, unit_id, state_hint, decided, "Hint overridden");
                }
                if let Err(err) = self
                    .clearance
                    .clean(group_id, unit_id, unit_type, decided)
                    .await
                {
                    warn!(group_id, unit_id, error = %err, "Cleanup after notify failed");
                }
            }
            Err(MessengerError::Rejected(err)) => {
                self.recovery
                    .on_notify_rejected(group_id, unit_id, unit_type, err)
                    .await;
            }
            Err(MessengerError::Transport(err)) => {
                self.recovery
                    .on_notify_transport_failure(group_id, unit_id, unit_type, state_hint, err)
                    .await;
            }
        }
    }

    /// Force rollback for every unit whose watchdog deadline passed
    ///
    /// Drains expired entries and cleans each with state `0`; also evicts
    /// aged settled marks. Returns how many units expired.
    pub async fn check_expired_units(&self) -> usize {
        let expired = self.watchdog.take_expired(Instant::now());
        let count = expired.len();
        for unit in expired {
            warn!(
                group_id = %unit.key.group_id,
                unit_id = %unit.key.unit_id,
                "Watchdog expired; forcing rollback"
            );
            #[cfg(feature = "metrics")]
            counter!("cohort_watchdog_expired_total").increment(1);
            if let Err(err) = self
                .clearance
                .clean(
                    &unit.key.group_id,
                    &unit.key.unit_id,
                    &unit.unit_type,
                    STATE_ROLLBACK,
                )
                .await
            {
                warn!(
                    group_id = %unit.key.group_id,
                    unit_id = %unit.key.unit_id,
                    error = %err,
                    "Forced rollback failed"
                );
            }
        }
        self.clearance.purge_settled();
        count
    }

    /// Spawn the background task that scans for expired watchdog deadlines
    pub fn spawn_expiry_checker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let interval_ms = coordinator.watchdog.config().check_interval_ms.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms, "Watchdog expiry checker started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = coordinator.expiry_notify.notified() => {}
                }
                if coordinator.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let expired = coordinator.check_expired_units().await;
                if expired > 0 {
                    debug!(expired, "Forced rollback of expired units");
                }
            }
            info!("Watchdog expiry checker stopped");
        })
    }

    /// Wake the expiry checker immediately
    pub fn trigger_expiry_check(&self) {
        self.expiry_notify.notify_one();
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.expiry_notify.notify_waiters();
        info!("Group coordinator shut down");
    }

    /// All units currently awaiting cleanup in the durable ledger
    pub fn pending_units(&self) -> std::result::Result<Vec<PendingUnit>, LogError> {
        self.log.pending()
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn clearance(&self) -> &ClearanceManager {
        &self.clearance
    }

    pub fn armed_units(&self) -> usize {
        self.watchdog.armed_units()
    }

    pub fn tracked_groups(&self) -> usize {
        self.context.tracked_groups()
    }
}
