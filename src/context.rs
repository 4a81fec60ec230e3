//! Per-node bookkeeping of in-flight transaction groups
//!
//! An explicit registry object with a defined lifecycle: created with the
//! coordinator, entries dropped on `clear_group`. The deadline tracked here
//! is the coarse whole-group budget, distinct from the per-unit watchdog
//! window; it short-circuits `notify_group` before any network I/O.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::state::STATE_COMMIT;

/// Default whole-group deadline in milliseconds
pub const DEFAULT_MAX_GROUP_TIME_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy)]
struct GroupEntry {
    state: i32,
    started_at: Instant,
}

/// Locally-known state of every group this node participates in
#[derive(Debug)]
pub struct NodeContext {
    groups: DashMap<String, GroupEntry>,
    max_group_time: Duration,
}

impl NodeContext {
    pub fn new(max_group_time_ms: u64) -> Self {
        Self {
            groups: DashMap::new(),
            max_group_time: Duration::from_millis(max_group_time_ms),
        }
    }

    /// Record that this node started participating in a group
    ///
    /// Idempotent: a second call keeps the original start instant, so retried
    /// joins do not stretch the deadline.
    pub fn begin_group(&self, group_id: &str) {
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupEntry {
                state: STATE_COMMIT,
                started_at: Instant::now(),
            });
    }

    /// Locally-known state carried on the join message
    ///
    /// Defaults to commit-intent when the group is unknown.
    pub fn group_state(&self, group_id: &str) -> i32 {
        self.groups
            .get(group_id)
            .map(|entry| entry.state)
            .unwrap_or(STATE_COMMIT)
    }

    /// Mark local intent for a group, typically rollback
    ///
    /// Starts tracking the group if it was unknown.
    pub fn set_group_state(&self, group_id: &str, state: i32) {
        let mut entry = self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupEntry {
                state,
                started_at: Instant::now(),
            });
        entry.state = state;
        debug!(group_id, state, "Group state recorded");
    }

    /// Drop all bookkeeping for a group; safe to call repeatedly
    pub fn clear_group(&self, group_id: &str) {
        if self.groups.remove(group_id).is_some() {
            debug!(group_id, "Group bookkeeping cleared");
        }
    }

    /// Whether the group exceeded its whole-group deadline
    ///
    /// Unknown groups are not expired.
    pub fn deadline_exceeded(&self, group_id: &str) -> bool {
        self.groups
            .get(group_id)
            .map(|entry| entry.started_at.elapsed() > self.max_group_time)
            .unwrap_or(false)
    }

    pub fn max_group_time_ms(&self) -> u64 {
        self.max_group_time.as_millis() as u64
    }

    pub fn tracked_groups(&self) -> usize {
        self.groups.len()
    }
}

impl Default for NodeContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_GROUP_TIME_MS)
    }
}
