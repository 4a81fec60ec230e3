//! Shared fixtures for coordinator integration tests
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```
//!
//! Provides:
//!
//! - `RecordingClearance`: clearance service that records every call
//! - `FlakyClearance`: fails retryably N times, then succeeds
//! - `FailingClearance`: always fails, retryable or terminal
//! - `ScriptedMessenger`: in-process messenger with one-shot fault injection
//! - `FailingLog`: pending ledger whose writes can be switched off
//! - `Fixture`: a fully wired coordinator plus handles to all the doubles

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use cohort::{
    ClearanceError, ClearanceRegistry, ClearanceService, CoordinatorConfig, GroupCoordinator,
    LocalMessenger, LogError, LogReporter, MemoryPendingLog, Messenger, MessengerError,
    PendingLog, PendingUnit,
};

/// Unit type every fixture registers a clearance service under
pub const UNIT_TYPE: &str = "mysql";

/// Initialize test logging
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("cohort=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Clearance service doubles
// ============================================================================

/// One recorded invocation of a clearance service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearCall {
    pub group_id: String,
    pub unit_id: String,
    pub unit_type: String,
    pub state: i32,
}

/// Clearance service that records every call and always succeeds
#[derive(Default)]
pub struct RecordingClearance {
    calls: Mutex<Vec<ClearCall>>,
}

impl RecordingClearance {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ClearCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn last_state(&self) -> Option<i32> {
        self.calls.lock().last().map(|call| call.state)
    }
}

#[async_trait]
impl ClearanceService for RecordingClearance {
    async fn clear(
        &self,
        group_id: &str,
        state: i32,
        unit_id: &str,
        unit_type: &str,
    ) -> Result<(), ClearanceError> {
        self.calls.lock().push(ClearCall {
            group_id: group_id.to_string(),
            unit_id: unit_id.to_string(),
            unit_type: unit_type.to_string(),
            state,
        });
        Ok(())
    }
}

/// Clearance service that fails retryably `failures` times, then succeeds
pub struct FlakyClearance {
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyClearance {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClearanceService for FlakyClearance {
    async fn clear(
        &self,
        group_id: &str,
        _state: i32,
        unit_id: &str,
        _unit_type: &str,
    ) -> Result<(), ClearanceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(ClearanceError::retryable(
                group_id,
                unit_id,
                "resource busy",
            ));
        }
        Ok(())
    }
}

/// Clearance service that always fails
pub struct FailingClearance {
    retryable: bool,
    attempts: AtomicUsize,
}

impl FailingClearance {
    pub fn retryable() -> Arc<Self> {
        Arc::new(Self {
            retryable: true,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn terminal() -> Arc<Self> {
        Arc::new(Self {
            retryable: false,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClearanceService for FailingClearance {
    async fn clear(
        &self,
        group_id: &str,
        _state: i32,
        unit_id: &str,
        _unit_type: &str,
    ) -> Result<(), ClearanceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.retryable {
            Err(ClearanceError::retryable(group_id, unit_id, "still locked"))
        } else {
            Err(ClearanceError::terminal(group_id, unit_id, "row deleted"))
        }
    }
}

// ============================================================================
// Messenger with fault injection
// ============================================================================

/// In-process messenger with one-shot fault injection per operation
///
/// Each injected error fires exactly once; the following call falls through
/// to the real `LocalMessenger`, which keeps the group decision authoritative
/// across retries.
pub struct ScriptedMessenger {
    inner: LocalMessenger,
    next_create_error: Mutex<Option<MessengerError>>,
    next_join_error: Mutex<Option<MessengerError>>,
    next_notify_error: Mutex<Option<MessengerError>>,
    joined_states: Mutex<Vec<i32>>,
    notify_calls: AtomicUsize,
}

impl ScriptedMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalMessenger::new(),
            next_create_error: Mutex::new(None),
            next_join_error: Mutex::new(None),
            next_notify_error: Mutex::new(None),
            joined_states: Mutex::new(Vec::new()),
            notify_calls: AtomicUsize::new(0),
        })
    }

    pub fn fail_next_create(&self, err: MessengerError) {
        *self.next_create_error.lock() = Some(err);
    }

    pub fn fail_next_join(&self, err: MessengerError) {
        *self.next_join_error.lock() = Some(err);
    }

    pub fn fail_next_notify(&self, err: MessengerError) {
        *self.next_notify_error.lock() = Some(err);
    }

    pub fn notify_calls(&self) -> usize {
        self.notify_calls.load(Ordering::SeqCst)
    }

    /// `local_state` values seen on join messages, in arrival order
    pub fn joined_states(&self) -> Vec<i32> {
        self.joined_states.lock().clone()
    }

    /// Decision recorded at the authority, if any
    pub fn decided_state(&self, group_id: &str) -> Option<i32> {
        self.inner.decided_state(group_id)
    }
}

#[async_trait]
impl Messenger for ScriptedMessenger {
    async fn create_group(&self, group_id: &str) -> Result<(), MessengerError> {
        if let Some(err) = self.next_create_error.lock().take() {
            return Err(err);
        }
        self.inner.create_group(group_id).await
    }

    async fn join_group(
        &self,
        group_id: &str,
        unit_id: &str,
        unit_type: &str,
        local_state: i32,
    ) -> Result<(), MessengerError> {
        self.joined_states.lock().push(local_state);
        if let Some(err) = self.next_join_error.lock().take() {
            return Err(err);
        }
        self.inner
            .join_group(group_id, unit_id, unit_type, local_state)
            .await
    }

    async fn notify_group(
        &self,
        group_id: &str,
        hinted_state: i32,
    ) -> Result<i32, MessengerError> {
        self.notify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.next_notify_error.lock().take() {
            return Err(err);
        }
        self.inner.notify_group(group_id, hinted_state).await
    }
}

// ============================================================================
// Pending ledger with switchable write failures
// ============================================================================

/// In-memory ledger whose `trace` calls can be made to fail on demand
pub struct FailingLog {
    inner: MemoryPendingLog,
    fail_trace: AtomicBool,
}

impl FailingLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryPendingLog::new(),
            fail_trace: AtomicBool::new(false),
        })
    }

    pub fn fail_traces(&self, fail: bool) {
        self.fail_trace.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, group_id: &str, unit_id: &str) -> bool {
        self.inner.contains(group_id, unit_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl PendingLog for FailingLog {
    fn trace(&self, unit: &PendingUnit) -> Result<(), LogError> {
        if self.fail_trace.load(Ordering::SeqCst) {
            return Err(LogError::from("ledger unavailable"));
        }
        self.inner.trace(unit)
    }

    fn clear(&self, group_id: &str, unit_id: &str) -> Result<(), LogError> {
        self.inner.clear(group_id, unit_id)
    }

    fn pending(&self) -> Result<Vec<PendingUnit>, LogError> {
        self.inner.pending()
    }
}

// ============================================================================
// Wired fixture
// ============================================================================

/// A coordinator wired to controllable doubles
pub struct Fixture {
    pub coordinator: Arc<GroupCoordinator>,
    pub messenger: Arc<ScriptedMessenger>,
    pub log: Arc<MemoryPendingLog>,
    pub service: Arc<RecordingClearance>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        init_logging();
        let messenger = ScriptedMessenger::new();
        let log = Arc::new(MemoryPendingLog::new());
        let service = RecordingClearance::new();

        let services = ClearanceRegistry::new();
        services.register(UNIT_TYPE, service.clone());

        let coordinator = Arc::new(GroupCoordinator::with_config(
            messenger.clone(),
            services,
            log.clone(),
            Arc::new(LogReporter),
            config,
        ));

        Fixture {
            coordinator,
            messenger,
            log,
            service,
        }
    }

    /// Create a group and join one member unit, the usual two-party setup
    pub async fn seed_group(&self, group_id: &str) {
        self.coordinator
            .create_group(
                group_id,
                "unit-a",
                serde_json::json!({"op": "debit"}),
                UNIT_TYPE,
            )
            .await
            .expect("create_group failed");
        self.coordinator
            .join_group(
                group_id,
                "unit-b",
                UNIT_TYPE,
                serde_json::json!({"op": "credit"}),
            )
            .await
            .expect("join_group failed");
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}
