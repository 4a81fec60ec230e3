//! Background recovery of orphaned pending entries
//!
//! Entries survive in the ledger when cleanup failed retryably or the
//! process died mid-protocol. The sweeper periodically re-drives aged
//! entries through the normal notify path; the messenger answers with the
//! group's actual decision, so a group that committed before the crash
//! still settles as commit here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::coordinator::GroupCoordinator;
use crate::state::STATE_ROLLBACK;

/// Default interval between sweeps: 30 seconds
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Default minimum entry age before the sweeper touches it: 60 seconds
///
/// Young entries usually belong to in-flight protocol runs; sweeping them
/// early would only race the caller's own notify.
pub const DEFAULT_MIN_AGE_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    pub sweep_interval_ms: u64,
    pub min_age_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            min_age_ms: DEFAULT_MIN_AGE_MS,
        }
    }
}

impl SweeperConfig {
    pub fn with_sweep_interval_ms(mut self, sweep_interval_ms: u64) -> Self {
        self.sweep_interval_ms = sweep_interval_ms;
        self
    }

    pub fn with_min_age_ms(mut self, min_age_ms: u64) -> Self {
        self.min_age_ms = min_age_ms;
        self
    }
}

/// Re-drives aged pending-ledger entries until they settle
pub struct PendingSweeper {
    coordinator: Arc<GroupCoordinator>,
    config: SweeperConfig,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    swept: AtomicU64,
}

impl PendingSweeper {
    pub fn new(coordinator: Arc<GroupCoordinator>) -> Self {
        Self::with_config(coordinator, SweeperConfig::default())
    }

    pub fn with_config(coordinator: Arc<GroupCoordinator>, config: SweeperConfig) -> Self {
        Self {
            coordinator,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            swept: AtomicU64::new(0),
        }
    }

    /// Run a single sweep; returns how many entries were re-driven
    ///
    /// The rollback hint is only a proposal. The messenger holds the group's
    /// decision and overrides the hint for groups that already committed.
    pub async fn sweep_once(&self) -> usize {
        let units = match self.coordinator.pending_units() {
            Ok(units) => units,
            Err(err) => {
                warn!(error = %err, "Sweep skipped; pending ledger unreadable");
                return 0;
            }
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let min_age = self.config.min_age_ms as i64;
        let mut driven = 0;
        for unit in units {
            if unit.age_ms(now_ms) < min_age {
                continue;
            }
            debug!(
                group_id = %unit.group_id,
                unit_id = %unit.unit_id,
                age_ms = unit.age_ms(now_ms),
                "Re-driving pending unit"
            );
            self.coordinator
                .notify_group(&unit.group_id, &unit.unit_id, &unit.unit_type, STATE_ROLLBACK)
                .await;
            driven += 1;
        }

        if driven > 0 {
            self.swept.fetch_add(driven as u64, Ordering::Relaxed);
            #[cfg(feature = "metrics")]
            counter!("cohort_sweeper_redriven_total").increment(driven as u64);
            info!(driven, "Sweep re-drove pending units");
        }
        driven
    }

    /// Spawn the periodic sweep loop
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sweeper = Arc::clone(self);
        let interval_ms = sweeper.config.sweep_interval_ms.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_ms,
                min_age_ms = sweeper.config.min_age_ms,
                "Pending sweeper started"
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = sweeper.wake.notified() => {}
                }
                if sweeper.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                sweeper.sweep_once().await;
            }
            info!("Pending sweeper stopped");
        })
    }

    /// Wake the sweep loop immediately
    pub fn trigger_sweep(&self) {
        self.wake.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Total units re-driven since construction
    pub fn swept_total(&self) -> u64 {
        self.swept.load(Ordering::Relaxed)
    }
}
