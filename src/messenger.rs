//! Messaging seam between this node and the group authority
//!
//! Delivery is at-least-once: duplicate creates, joins, and notifies are all
//! legal and must converge. `notify_group` returns the authoritative decided
//! state; the messenger, not the caller, has final say on the outcome.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{BusinessError, MessengerError};

/// Reliable group messaging
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Register a new group with the authority
    async fn create_group(&self, group_id: &str) -> Result<(), MessengerError>;

    /// Register a unit as a member of a group, carrying the locally-known
    /// state at join time
    async fn join_group(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        local_state: i32,
    ) -> Result<(), MessengerError>;

    /// Resolve the group decision, offering `hinted_state` as this caller's
    /// view; the returned state is authoritative and may differ from the hint
    async fn notify_group(&self, group_id: &str, hinted_state: i32)
        -> Result<i32, MessengerError>;
}

#[derive(Debug, Default)]
struct LocalGroup {
    units: Vec<(String, String, i32)>,
    decided: Option<i32>,
}

/// In-process messenger with decide-once semantics
///
/// Serves embedded deployments and tests: the first notify fixes the group
/// decision and every later notify returns that same state regardless of its
/// hint. Duplicate creates and joins are idempotent; joining an unknown group
/// is a business rejection.
#[derive(Debug, Default)]
pub struct LocalMessenger {
    groups: DashMap<String, LocalGroup>,
}

impl LocalMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decision recorded for a group, if any
    pub fn decided_state(&self, group_id: &str) -> Option<i32> {
        self.groups.get(group_id).and_then(|group| group.decided)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[async_trait]
impl Messenger for LocalMessenger {
    async fn create_group(&self, group_id: &str) -> Result<(), MessengerError> {
        self.groups.entry(group_id.to_string()).or_default();
        debug!(group_id, "Group registered");
        Ok(())
    }

    async fn join_group(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        local_state: i32,
    ) -> Result<(), MessengerError> {
        let mut group = self.groups.get_mut(group_id).ok_or_else(|| {
            MessengerError::Rejected(BusinessError::rejected(format!(
                "unknown group {group_id}"
            )))
        })?;
        if !group.units.iter().any(|(id, _, _)| id == unit_id) {
            group
                .units
                .push((unit_id.to_string(), unit_type.to_string(), local_state));
        }
        debug!(group_id, unit_id, unit_type, local_state, "Unit joined");
        Ok(())
    }

    async fn notify_group(
        &self,
        group_id: &str,
        hinted_state: i32,
    ) -> Result<i32, MessengerError> {
        let mut group = self.groups.get_mut(group_id).ok_or_else(|| {
            MessengerError::Rejected(BusinessError::rejected(format!(
                "unknown group {group_id}"
            )))
        })?;
        let decided = *group.decided.get_or_insert(hinted_state);
        debug!(group_id, hinted_state, decided, "Group decision resolved");
        Ok(decided)
    }
}
