//! Core data model: wire state convention and unit identity
//!
//! State values follow the loose integer convention of the wire protocol:
//! `0` always means rollback and any non-zero value means commit (`1` by
//! convention). Values are preserved exactly as received so mixed-version
//! peers keep agreeing on their meaning.

use serde::{Deserialize, Serialize};

/// Wire state value for a rollback decision
pub const STATE_ROLLBACK: i32 = 0;

/// Conventional wire state value for a commit decision
pub const STATE_COMMIT: i32 = 1;

/// Returns true if a wire state value means commit
///
/// Any non-zero value is a commit; only `0` is rollback.
pub fn is_commit(state: i32) -> bool {
    state != STATE_ROLLBACK
}

/// Identity of one participating unit within a group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitKey {
    pub group_id: String,
    pub unit_id: String,
}

impl UnitKey {
    pub fn new(group_id: impl Into<String>, unit_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            unit_id: unit_id.into(),
        }
    }
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group_id, self.unit_id)
    }
}

/// Durable record of a unit awaiting cleanup
///
/// Written when a unit joins its group (and for the initiating unit at group
/// creation) and removed only once clearance is accepted as final. The `info`
/// payload is opaque to the core: it is stored for audit and recovery
/// tooling, never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUnit {
    pub group_id: String,
    pub unit_id: String,
    pub unit_type: String,
    #[serde(default)]
    pub info: serde_json::Value,
    /// Epoch millis at which the unit was traced
    pub logged_at_ms: i64,
}

impl PendingUnit {
    pub fn new(
        group_id: impl Into<String>,
        unit_id: impl Into<String>,
        unit_type: impl Into<String>,
        info: serde_json::Value,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            unit_id: unit_id.into(),
            unit_type: unit_type.into(),
            info,
            logged_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::new(self.group_id.clone(), self.unit_id.clone())
    }

    /// Age of this record relative to `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.logged_at_ms
    }
}
