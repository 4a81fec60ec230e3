//! Per-unit watchdog: absence of a decision is rollback
//!
//! A joined unit arms a deadline here. If no decision arrives before it, the
//! coordinator's expiry checker drains the entry and forces a rollback clean,
//! bounding how long a participant can be left prepared when the notify
//! message is lost. The registry itself is passive; the owning coordinator
//! drives the scans.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::UnitKey;

/// Default maximum wait for a decision after join, in milliseconds
pub const DEFAULT_MAX_WAIT_MS: u64 = 30_000;

/// Default interval between expiry scans, in milliseconds
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 1_000;

/// Configuration for the watchdog layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Maximum wait for a decision after join, in milliseconds
    pub max_wait_ms: u64,
    /// Interval between expiry scans, in milliseconds
    pub check_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
        }
    }
}

impl WatchdogConfig {
    pub fn with_max_wait_ms(mut self, max_wait_ms: u64) -> Self {
        self.max_wait_ms = max_wait_ms;
        self
    }

    pub fn with_check_interval_ms(mut self, check_interval_ms: u64) -> Self {
        self.check_interval_ms = check_interval_ms;
        self
    }
}

#[derive(Debug, Clone)]
struct ArmedEntry {
    unit_type: String,
    deadline: Instant,
}

/// An expired deadline drained from the registry
#[derive(Debug, Clone)]
pub struct ExpiredUnit {
    pub key: UnitKey,
    pub unit_type: String,
}

/// Counters for watchdog activity
#[derive(Debug, Default)]
pub struct WatchdogStats {
    armed: AtomicU64,
    stopped: AtomicU64,
    expired: AtomicU64,
}

impl WatchdogStats {
    fn record_armed(&self) {
        self.armed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WatchdogStatsSnapshot {
        WatchdogStatsSnapshot {
            armed: self.armed.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`WatchdogStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogStatsSnapshot {
    pub armed: u64,
    pub stopped: u64,
    pub expired: u64,
}

/// Deadline registry for joined units
///
/// `start` and `stop` are idempotent: re-arming an already-armed unit resets
/// its deadline (at-least-once join retries must not shorten or leak timers),
/// and cancelling an entry that already fired or never existed is a no-op.
#[derive(Debug, Default)]
pub struct Watchdog {
    entries: DashMap<UnitKey, ArmedEntry>,
    config: WatchdogConfig,
    stats: WatchdogStats,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            stats: WatchdogStats::default(),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Arm (or re-arm) the deadline for a unit
    pub fn start(&self, group_id: &str, unit_id: &str, unit_type: &str) {
        let key = UnitKey::new(group_id, unit_id);
        let deadline = Instant::now() + Duration::from_millis(self.config.max_wait_ms);
        self.entries.insert(
            key,
            ArmedEntry {
                unit_type: unit_type.to_string(),
                deadline,
            },
        );
        self.stats.record_armed();
        debug!(group_id, unit_id, unit_type, "Watchdog armed");
    }

    /// Cancel the deadline for a unit; returns true if an entry was armed
    pub fn stop(&self, group_id: &str, unit_id: &str) -> bool {
        let key = UnitKey::new(group_id, unit_id);
        if self.entries.remove(&key).is_some() {
            self.stats.record_stopped();
            debug!(group_id, unit_id, "Watchdog stopped");
            true
        } else {
            false
        }
    }

    /// Remove and return every entry whose deadline passed
    ///
    /// Two-pass: collect due keys first, then remove each, so a racing second
    /// scan cannot return the same unit twice.
    pub fn take_expired(&self, now: Instant) -> Vec<ExpiredUnit> {
        let due: Vec<UnitKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for key in due {
            if let Some((key, entry)) = self.entries.remove(&key) {
                self.stats.record_expired();
                expired.push(ExpiredUnit {
                    key,
                    unit_type: entry.unit_type,
                });
            }
        }
        expired
    }

    pub fn is_armed(&self, group_id: &str, unit_id: &str) -> bool {
        self.entries
            .contains_key(&UnitKey::new(group_id, unit_id))
    }

    pub fn armed_units(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> &WatchdogStats {
        &self.stats
    }
}
