//! Rotation run records.
//!
//! A [`RotationRun`] is created for every invocation against one rule, has
//! steps appended strictly in order, and is frozen once it reaches a terminal
//! status. It is the unit of audit logging.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::credentials::{ConnectionString, KeySlot};
use crate::error::{ClientError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

/// States of the per-rule rotation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RotationState {
    Idle,
    Locked,
    RegeneratingPrimary,
    PrimaryRegenerated,
    WritingSecret,
    SecretWritten,
    AwaitingGrace,
    RegeneratingSecondary,
    WritingSecondarySecret,
    Completed,
    Failed,
}

impl RotationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RotationState::Completed | RotationState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepName {
    RegeneratePrimary,
    UpdateSecretPrimary,
    WaitGrace,
    RegenerateSecondary,
    UpdateSecretSecondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationStep {
    pub name: StepName,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// Another run holds the lease for this rule.
    ConcurrentRotationInProgress,
    PermissionDenied,
    NotFound,
    /// Transient failures outlasted the retry budget before any mutation.
    TransientExhausted,
    InvalidRequest,
    /// The backend key changed but the secret store does not hold it.
    PartialRotation,
    /// The lease expired while the run was waiting.
    LockLost,
    Unknown,
}

impl FailureReason {
    /// Reason for a failure that happened before any backend mutation.
    pub fn from_client_error(err: &ClientError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => FailureReason::NotFound,
            ErrorKind::Permission => FailureReason::PermissionDenied,
            ErrorKind::Transient => FailureReason::TransientExhausted,
            ErrorKind::Invalid => FailureReason::InvalidRequest,
            ErrorKind::Unknown => FailureReason::Unknown,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Timer,
    Manual,
}

/// A regenerated credential that never reached the secret store.
///
/// Carried on a failed run so the audit record can hand it to whoever
/// performs emergency recovery.
#[derive(Debug, Clone)]
pub struct RecoveryValue {
    pub slot: KeySlot,
    pub secret_name: String,
    pub connection_string: ConnectionString,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationRun {
    pub rotation_id: Uuid,
    pub rule_name: String,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub state: RotationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<RotationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
    pub steps: Vec<RotationStep>,
    /// Never serialized with the run; only the audit record exposes it.
    #[serde(skip)]
    pub recovery: Option<RecoveryValue>,
}

impl RotationRun {
    pub fn new(rule_name: &str, trigger: TriggerSource) -> Self {
        Self {
            rotation_id: Uuid::new_v4(),
            rule_name: rule_name.to_string(),
            trigger,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Pending,
            state: RotationState::Idle,
            failed_in: None,
            failure: None,
            failure_detail: None,
            steps: Vec::new(),
            recovery: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Move to the next state of the machine.
    pub fn advance(&mut self, next: RotationState) {
        debug_assert!(!self.is_terminal(), "run {} is already terminal", self.rotation_id);
        if self.is_terminal() {
            return;
        }
        tracing::debug!(
            rotation_id = %self.rotation_id,
            rule = %self.rule_name,
            from = ?self.state,
            to = ?next,
            "rotation state transition"
        );
        self.state = next;
        if next == RotationState::Locked {
            self.status = RunStatus::Running;
        }
    }

    /// Append a finished step.
    pub fn record(
        &mut self,
        name: StepName,
        started_at: DateTime<Utc>,
        outcome: StepOutcome,
        detail: Option<String>,
    ) {
        if self.is_terminal() {
            return;
        }
        self.steps.push(RotationStep {
            name,
            started_at,
            completed_at: Utc::now(),
            outcome,
            detail,
        });
    }

    /// Terminate the run in `Failed`.
    pub fn fail(&mut self, reason: FailureReason, detail: String, recovery: Option<RecoveryValue>) {
        if self.is_terminal() {
            return;
        }
        self.failed_in = Some(self.state);
        self.state = RotationState::Failed;
        self.status = RunStatus::Failed;
        self.failure = Some(reason);
        self.failure_detail = Some(detail);
        self.recovery = recovery;
        self.ended_at = Some(Utc::now());
    }

    /// Terminate the run in `Succeeded`.
    pub fn complete(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.state = RotationState::Completed;
        self.status = RunStatus::Succeeded;
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}
