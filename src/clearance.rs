//! Clearance: apply the decided outcome to a unit, then release everything
//!
//! `ClearanceManager::clean` is the single funnel every cleanup path goes
//! through, whether notify-driven, watchdog-forced, join-rejection
//! self-clean, or a sweeper re-drive. It guarantees three things:
//!
//! 1. The per-unit side effect (`ClearanceService::clear`) runs at most once
//!    with a single final state value, even when callers race. A per-unit
//!    settled guard claims the unit before the service is invoked; a second
//!    caller observes the claim and skips straight to teardown.
//! 2. Node-local bookkeeping (`NodeContext`, watchdog deadline) is released
//!    on every attempt, whether clearance succeeded, failed, or was skipped.
//! 3. The durable pending entry is removed only when the outcome is final.
//!    A failure flagged `need_compensation` releases the claim and retains
//!    the entry for a later re-drive; unknown failures are final.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::context::NodeContext;
use crate::error::ClearanceError;
use crate::pending_log::PendingLog;
use crate::state::{is_commit, UnitKey};
use crate::watchdog::Watchdog;

/// Default lifetime of a settled mark, in milliseconds
///
/// Settled marks keep redelivered notifies idempotent; the TTL bounds the
/// guard map instead of letting it grow with every completed unit.
pub const DEFAULT_SETTLED_TTL_MS: u64 = 600_000;

/// Configuration for the clearance layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearanceConfig {
    /// Lifetime of a settled mark, in milliseconds
    pub settled_ttl_ms: u64,
}

impl Default for ClearanceConfig {
    fn default() -> Self {
        Self {
            settled_ttl_ms: DEFAULT_SETTLED_TTL_MS,
        }
    }
}

impl ClearanceConfig {
    pub fn with_settled_ttl_ms(mut self, settled_ttl_ms: u64) -> Self {
        self.settled_ttl_ms = settled_ttl_ms;
        self
    }
}

/// Applies the decided outcome of a group to one unit's local resources
///
/// Implementations are registered per unit type. The core shields them from
/// duplicate invocation within the settled window, but a service should still
/// tolerate redelivery beyond it, as with any at-least-once pipeline.
#[async_trait]
pub trait ClearanceService: Send + Sync {
    /// Apply `state` (`0` = rollback, non-zero = commit) for the unit
    ///
    /// Returning a [`ClearanceError`] with `need_compensation` set keeps the
    /// durable pending entry so the outcome can be re-driven later.
    async fn clear(
        &self,
        group_id: &str,
        state: i32,
        unit_id: &str,
        unit_type: &str,
    ) -> Result<(), ClearanceError>;
}

/// Registry of clearance services keyed by unit type
#[derive(Default)]
pub struct ClearanceRegistry {
    services: DashMap<String, Arc<dyn ClearanceService>>,
}

impl ClearanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, unit_type: impl Into<String>, service: Arc<dyn ClearanceService>) {
        let unit_type = unit_type.into();
        info!(unit_type, "Clearance service registered");
        self.services.insert(unit_type, service);
    }

    pub fn resolve(&self, unit_type: &str) -> Option<Arc<dyn ClearanceService>> {
        self.services
            .get(unit_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.services
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettleMark {
    InFlight,
    Settled { state: i32, at: Instant },
}

enum ClaimOutcome {
    Claimed,
    SettlingElsewhere,
    AlreadySettled,
}

/// Counters for clearance activity
#[derive(Debug, Default)]
pub struct ClearanceStats {
    commits: AtomicU64,
    rollbacks: AtomicU64,
    retained: AtomicU64,
    duplicates: AtomicU64,
    terminal_failures: AtomicU64,
}

impl ClearanceStats {
    pub fn snapshot(&self) -> ClearanceStatsSnapshot {
        ClearanceStatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            retained: self.retained.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ClearanceStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearanceStatsSnapshot {
    pub commits: u64,
    pub rollbacks: u64,
    pub retained: u64,
    pub duplicates: u64,
    pub terminal_failures: u64,
}

/// Orchestrates a single unit's cleanup
pub struct ClearanceManager {
    registry: ClearanceRegistry,
    context: Arc<NodeContext>,
    watchdog: Arc<Watchdog>,
    log: Arc<dyn PendingLog>,
    settled: DashMap<UnitKey, SettleMark>,
    config: ClearanceConfig,
    stats: ClearanceStats,
}

impl ClearanceManager {
    pub fn new(
        registry: ClearanceRegistry,
        context: Arc<NodeContext>,
        watchdog: Arc<Watchdog>,
        log: Arc<dyn PendingLog>,
    ) -> Self {
        Self::with_config(registry, context, watchdog, log, ClearanceConfig::default())
    }

    pub fn with_config(
        registry: ClearanceRegistry,
        context: Arc<NodeContext>,
        watchdog: Arc<Watchdog>,
        log: Arc<dyn PendingLog>,
        config: ClearanceConfig,
    ) -> Self {
        Self {
            registry,
            context,
            watchdog,
            log,
            settled: DashMap::new(),
            config,
            stats: ClearanceStats::default(),
        }
    }

    pub fn registry(&self) -> &ClearanceRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &ClearanceStats {
        &self.stats
    }

    /// Clean one unit with the decided state, releasing the pending entry
    /// when the outcome is final
    pub async fn clean(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        state: i32,
    ) -> Result<(), ClearanceError> {
        self.clean_inner(group_id, unit_id, unit_type, state, true)
            .await
    }

    /// Clean one unit without touching the pending log
    ///
    /// Used where removing the durable entry would be misleading: the notify
    /// delivery already failed once, so the entry stays as the handle for
    /// reconciliation. A later `clean` that observes the settled mark
    /// releases the entry.
    pub async fn clean_without_log(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        state: i32,
    ) -> Result<(), ClearanceError> {
        self.clean_inner(group_id, unit_id, unit_type, state, false)
            .await
    }

    async fn clean_inner(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        state: i32,
        clear_log: bool,
    ) -> Result<(), ClearanceError> {
        let key = UnitKey::new(group_id, unit_id);

        match self.try_claim(&key, state) {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadySettled => {
                // The outcome is final; a caller with delivery confirmation
                // may release an entry an earlier unconfirmed clean kept.
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                self.teardown(group_id, unit_id);
                if clear_log {
                    self.clear_log_entry(group_id, unit_id);
                }
                return Ok(());
            }
            ClaimOutcome::SettlingElsewhere => {
                // A racing attempt holds the claim; its outcome decides what
                // happens to the pending entry.
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                self.teardown(group_id, unit_id);
                return Ok(());
            }
        }

        let outcome = match self.registry.resolve(unit_type) {
            Some(service) => service.clear(group_id, state, unit_id, unit_type).await,
            None => Err(ClearanceError::retryable(
                group_id,
                unit_id,
                format!("no clearance service registered for unit type '{unit_type}'"),
            )),
        };

        // Teardown runs on every attempt, before the outcome is examined.
        self.teardown(group_id, unit_id);

        match outcome {
            Ok(()) => {
                self.mark_settled(&key, state);
                if clear_log {
                    self.clear_log_entry(group_id, unit_id);
                }
                if is_commit(state) {
                    self.stats.commits.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "metrics")]
                    counter!("cohort_clearance_commits_total").increment(1);
                } else {
                    self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "metrics")]
                    counter!("cohort_clearance_rollbacks_total").increment(1);
                }
                info!(group_id, unit_id, unit_type, state, "Unit cleared");
                Ok(())
            }
            Err(err) if err.need_compensation => {
                // The side effect did not apply; release the claim so a
                // re-drive can try again, and keep the pending entry.
                self.settled.remove(&key);
                self.stats.retained.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                counter!("cohort_clearance_retained_total").increment(1);
                warn!(
                    group_id,
                    unit_id,
                    unit_type,
                    state,
                    error = %err,
                    "Clearance failed; pending entry retained for re-drive"
                );
                Err(err)
            }
            Err(err) => {
                self.mark_settled(&key, state);
                if clear_log {
                    self.clear_log_entry(group_id, unit_id);
                }
                self.stats.terminal_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    group_id,
                    unit_id,
                    unit_type,
                    state,
                    error = %err,
                    "Clearance failed terminally; pending entry released"
                );
                Err(err)
            }
        }
    }

    /// Atomically claim the unit for this cleanup attempt
    fn try_claim(&self, key: &UnitKey, state: i32) -> ClaimOutcome {
        use dashmap::mapref::entry::Entry;
        match self.settled.entry(key.clone()) {
            Entry::Occupied(occupied) => match occupied.get() {
                SettleMark::InFlight => ClaimOutcome::SettlingElsewhere,
                SettleMark::Settled {
                    state: settled_state,
                    ..
                } => {
                    if *settled_state != state {
                        warn!(
                            unit = %key,
                            settled_state = *settled_state,
                            requested = state,
                            "Duplicate cleanup with divergent state ignored"
                        );
                    } else {
                        debug!(unit = %key, state, "Unit already settled; cleanup skipped");
                    }
                    ClaimOutcome::AlreadySettled
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(SettleMark::InFlight);
                ClaimOutcome::Claimed
            }
        }
    }

    fn mark_settled(&self, key: &UnitKey, state: i32) {
        self.settled.insert(
            key.clone(),
            SettleMark::Settled {
                state,
                at: Instant::now(),
            },
        );
    }

    fn teardown(&self, group_id: &str, unit_id: &str) {
        self.context.clear_group(group_id);
        self.watchdog.stop(group_id, unit_id);
    }

    fn clear_log_entry(&self, group_id: &str, unit_id: &str) {
        if let Err(err) = self.log.clear(group_id, unit_id) {
            warn!(group_id, unit_id, error = %err, "Failed to remove pending entry");
        }
    }

    /// Evict settled marks older than the configured TTL; returns the count
    pub fn purge_settled(&self) -> usize {
        let ttl = Duration::from_millis(self.config.settled_ttl_ms);
        // New settles can land in already-swept shards while retain walks the
        // map, so the count comes from the eviction closure, not a
        // before/after length diff.
        let mut purged = 0;
        self.settled.retain(|_, mark| match mark {
            SettleMark::InFlight => true,
            SettleMark::Settled { at, .. } => {
                if at.elapsed() < ttl {
                    true
                } else {
                    purged += 1;
                    false
                }
            }
        });
        purged
    }

    pub fn settled_units(&self) -> usize {
        self.settled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending_log::MemoryPendingLog;
    use crate::state::{PendingUnit, STATE_COMMIT, STATE_ROLLBACK};
    use crate::watchdog::WatchdogConfig;
    use parking_lot::Mutex;

    struct RecordingService {
        calls: Mutex<Vec<(String, String, i32)>>,
    }

    impl RecordingService {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String, i32)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ClearanceService for RecordingService {
        async fn clear(
            &self,
            group_id: &str,
            state: i32,
            unit_id: &str,
            _unit_type: &str,
        ) -> Result<(), ClearanceError> {
            self.calls
                .lock()
                .push((group_id.to_string(), unit_id.to_string(), state));
            Ok(())
        }
    }

    struct FailingService {
        retryable: bool,
    }

    #[async_trait]
    impl ClearanceService for FailingService {
        async fn clear(
            &self,
            group_id: &str,
            _state: i32,
            unit_id: &str,
            _unit_type: &str,
        ) -> Result<(), ClearanceError> {
            if self.retryable {
                Err(ClearanceError::retryable(group_id, unit_id, "db down"))
            } else {
                Err(ClearanceError::terminal(group_id, unit_id, "row gone"))
            }
        }
    }

    struct Fixture {
        manager: ClearanceManager,
        context: Arc<NodeContext>,
        watchdog: Arc<Watchdog>,
        log: Arc<MemoryPendingLog>,
    }

    fn setup(service: Arc<dyn ClearanceService>) -> Fixture {
        let registry = ClearanceRegistry::new();
        registry.register("mysql", service);
        let context = Arc::new(NodeContext::default());
        let watchdog = Arc::new(Watchdog::new(WatchdogConfig::default()));
        let log = Arc::new(MemoryPendingLog::new());
        let manager = ClearanceManager::new(
            registry,
            Arc::clone(&context),
            Arc::clone(&watchdog),
            log.clone() as Arc<dyn PendingLog>,
        );
        Fixture {
            manager,
            context,
            watchdog,
            log,
        }
    }

    fn seed_unit(fixture: &Fixture, group_id: &str, unit_id: &str) {
        fixture.context.begin_group(group_id);
        fixture.watchdog.start(group_id, unit_id, "mysql");
        fixture
            .log
            .trace(&PendingUnit::new(
                group_id,
                unit_id,
                "mysql",
                serde_json::Value::Null,
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn test_clean_success_releases_everything() {
        let service = RecordingService::new();
        let fixture = setup(service.clone());
        seed_unit(&fixture, "G1", "U1");

        fixture
            .manager
            .clean("G1", "U1", "mysql", STATE_COMMIT)
            .await
            .unwrap();

        assert_eq!(
            service.calls(),
            vec![("G1".to_string(), "U1".to_string(), STATE_COMMIT)]
        );
        assert!(fixture.log.is_empty());
        assert_eq!(fixture.context.tracked_groups(), 0);
        assert_eq!(fixture.watchdog.armed_units(), 0);
        assert_eq!(fixture.manager.stats().snapshot().commits, 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_retains_entry_and_claim() {
        let fixture = setup(Arc::new(FailingService { retryable: true }));
        seed_unit(&fixture, "G1", "U1");

        let err = fixture
            .manager
            .clean("G1", "U1", "mysql", STATE_ROLLBACK)
            .await
            .unwrap_err();
        assert!(err.need_compensation);

        // Entry retained, bookkeeping still torn down.
        assert!(fixture.log.contains("G1", "U1"));
        assert_eq!(fixture.context.tracked_groups(), 0);
        assert_eq!(fixture.watchdog.armed_units(), 0);

        // Claim released: a re-drive reaches the service again.
        let err = fixture
            .manager
            .clean("G1", "U1", "mysql", STATE_ROLLBACK)
            .await
            .unwrap_err();
        assert!(err.need_compensation);
        assert_eq!(fixture.manager.stats().snapshot().retained, 2);
        assert_eq!(fixture.manager.stats().snapshot().duplicates, 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_releases_entry() {
        let fixture = setup(Arc::new(FailingService { retryable: false }));
        seed_unit(&fixture, "G1", "U1");

        let err = fixture
            .manager
            .clean("G1", "U1", "mysql", STATE_COMMIT)
            .await
            .unwrap_err();
        assert!(!err.need_compensation);
        assert!(fixture.log.is_empty());
        assert_eq!(fixture.manager.stats().snapshot().terminal_failures, 1);
    }

    #[tokio::test]
    async fn test_second_clean_is_a_noop() {
        let service = RecordingService::new();
        let fixture = setup(service.clone());
        seed_unit(&fixture, "G1", "U1");

        fixture
            .manager
            .clean("G1", "U1", "mysql", STATE_COMMIT)
            .await
            .unwrap();
        fixture
            .manager
            .clean("G1", "U1", "mysql", STATE_ROLLBACK)
            .await
            .unwrap();

        assert_eq!(service.calls().len(), 1);
        assert_eq!(fixture.manager.stats().snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_retryable() {
        let service = RecordingService::new();
        let fixture = setup(service.clone());
        seed_unit(&fixture, "G1", "U1");

        let err = fixture
            .manager
            .clean("G1", "U1", "redis", STATE_COMMIT)
            .await
            .unwrap_err();
        assert!(err.need_compensation);
        assert!(service.calls().is_empty());
        assert!(fixture.log.contains("G1", "U1"));
    }

    #[tokio::test]
    async fn test_clean_without_log_keeps_entry() {
        let service = RecordingService::new();
        let fixture = setup(service.clone());
        seed_unit(&fixture, "G1", "U1");

        fixture
            .manager
            .clean_without_log("G1", "U1", "mysql", STATE_COMMIT)
            .await
            .unwrap();

        assert_eq!(service.calls().len(), 1);
        assert!(fixture.log.contains("G1", "U1"));
        assert_eq!(fixture.watchdog.armed_units(), 0);
    }

    #[tokio::test]
    async fn test_confirmed_clean_releases_retained_entry() {
        let service = RecordingService::new();
        let fixture = setup(service.clone());
        seed_unit(&fixture, "G1", "U1");

        fixture
            .manager
            .clean_without_log("G1", "U1", "mysql", STATE_COMMIT)
            .await
            .unwrap();
        assert!(fixture.log.contains("G1", "U1"));

        // The unit is already settled, so the service is not re-invoked, but
        // a confirmed clean may now release the durable entry.
        fixture
            .manager
            .clean("G1", "U1", "mysql", STATE_COMMIT)
            .await
            .unwrap();
        assert_eq!(service.calls().len(), 1);
        assert!(fixture.log.is_empty());
    }

    #[tokio::test]
    async fn test_purge_settled_with_zero_ttl() {
        let service = RecordingService::new();
        let registry = ClearanceRegistry::new();
        registry.register("mysql", service.clone());
        let manager = ClearanceManager::with_config(
            registry,
            Arc::new(NodeContext::default()),
            Arc::new(Watchdog::new(WatchdogConfig::default())),
            Arc::new(MemoryPendingLog::new()),
            ClearanceConfig::default().with_settled_ttl_ms(0),
        );

        manager
            .clean("G1", "U1", "mysql", STATE_COMMIT)
            .await
            .unwrap();
        assert_eq!(manager.settled_units(), 1);
        assert_eq!(manager.purge_settled(), 1);
        assert_eq!(manager.settled_units(), 0);

        // Beyond the settled window the guard no longer dedups.
        manager
            .clean("G1", "U1", "mysql", STATE_COMMIT)
            .await
            .unwrap();
        assert_eq!(service.calls().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_purge_settled_racing_new_settles() {
        let registry = ClearanceRegistry::new();
        registry.register("mysql", RecordingService::new());
        let manager = Arc::new(ClearanceManager::with_config(
            registry,
            Arc::new(NodeContext::default()),
            Arc::new(Watchdog::new(WatchdogConfig::default())),
            Arc::new(MemoryPendingLog::new()),
            ClearanceConfig::default().with_settled_ttl_ms(0),
        ));

        // Zero TTL makes every mark evictable the moment it lands, so each
        // purge pass overlaps the settles still arriving from the other task.
        let settler = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for i in 0..400 {
                    manager
                        .clean(&format!("G{i}"), &format!("U{i}"), "mysql", STATE_COMMIT)
                        .await
                        .unwrap();
                }
            })
        };

        let mut purged = 0;
        while !settler.is_finished() {
            purged += manager.purge_settled();
            tokio::task::yield_now().await;
        }
        settler.await.unwrap();
        purged += manager.purge_settled();

        // Every settle is evicted exactly once across the passes.
        assert_eq!(purged, 400);
        assert_eq!(manager.settled_units(), 0);
    }

    #[test]
    fn test_registry_lists_registered_types() {
        let registry = ClearanceRegistry::new();
        assert!(registry.is_empty());

        registry.register("mysql", RecordingService::new());
        registry.register("redis", RecordingService::new());

        let mut types = registry.registered_types();
        types.sort();
        assert_eq!(types, vec!["mysql", "redis"]);
        assert_eq!(registry.len(), 2);
    }
}
