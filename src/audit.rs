//! Audit records for rotation runs.
//!
//! Every terminal run is emitted exactly once as an [`AuditRecord`]. After each
//! successful key regeneration a [`CredentialCheckpoint`] is emitted before the
//! value is written anywhere, so a process that dies mid-write still leaves
//! the only copy of the new credential in the audit trail.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::credentials::{ConnectionString, KeySlot};
use crate::rotation::{FailureReason, RotationRun, RotationState, RotationStep, RunStatus, TriggerSource};

/// Tracing target all audit output is written to.
pub const AUDIT_TARGET: &str = "audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    pub slot: KeySlot,
    pub secret_name: String,
    /// Raw connection string that never reached the secret store.
    pub connection_string: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub rotation_id: Uuid,
    pub rule_name: String,
    pub trigger: TriggerSource,
    pub status: RunStatus,
    pub severity: Severity,
    pub final_state: RotationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<RotationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub steps: Vec<RotationStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryRecord>,
}

impl AuditRecord {
    pub fn from_run(run: &RotationRun) -> Self {
        let severity = match (run.status, run.failure) {
            (_, Some(FailureReason::PartialRotation)) => Severity::Critical,
            (RunStatus::Failed, _) => Severity::Warning,
            _ => Severity::Info,
        };

        Self {
            rotation_id: run.rotation_id,
            rule_name: run.rule_name.clone(),
            trigger: run.trigger,
            status: run.status,
            severity,
            final_state: run.state,
            failed_in: run.failed_in,
            failure: run.failure,
            failure_detail: run.failure_detail.clone(),
            started_at: run.started_at,
            ended_at: run.ended_at,
            duration_seconds: run.duration_seconds(),
            steps: run.steps.clone(),
            recovery: run.recovery.as_ref().map(|r| RecoveryRecord {
                slot: r.slot,
                secret_name: r.secret_name.clone(),
                connection_string: r.connection_string.expose().to_string(),
            }),
        }
    }
}

/// A freshly regenerated credential, recorded before it is propagated.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialCheckpoint {
    pub rotation_id: Uuid,
    pub rule_name: String,
    pub slot: KeySlot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    pub regenerated_at: DateTime<Utc>,
    pub connection_string: String,
}

impl CredentialCheckpoint {
    pub fn new(
        rotation_id: Uuid,
        rule_name: &str,
        slot: KeySlot,
        secret_name: Option<&str>,
        value: &ConnectionString,
    ) -> Self {
        Self {
            rotation_id,
            rule_name: rule_name.to_string(),
            slot,
            secret_name: secret_name.map(str::to_string),
            regenerated_at: Utc::now(),
            connection_string: value.expose().to_string(),
        }
    }
}

/// Destination for audit output.
pub trait AuditSink: Send + Sync {
    fn emit(&self, record: &AuditRecord);

    fn checkpoint(&self, checkpoint: &CredentialCheckpoint);
}

/// Writes audit output as JSON on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, record: &AuditRecord) {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                // Still surface the value by hand if the record itself will not serialize.
                error!(
                    target: AUDIT_TARGET,
                    rotation_id = %record.rotation_id,
                    rule = %record.rule_name,
                    recovery = ?record.recovery.as_ref().map(|r| &r.connection_string),
                    "failed to serialize audit record: {}", e
                );
                return;
            }
        };

        match record.severity {
            Severity::Critical => error!(
                target: AUDIT_TARGET,
                rotation_id = %record.rotation_id,
                rule = %record.rule_name,
                "PARTIAL ROTATION, manual recovery required: {}", json
            ),
            Severity::Warning => warn!(
                target: AUDIT_TARGET,
                rotation_id = %record.rotation_id,
                rule = %record.rule_name,
                "rotation failed: {}", json
            ),
            Severity::Info => info!(
                target: AUDIT_TARGET,
                rotation_id = %record.rotation_id,
                rule = %record.rule_name,
                "rotation completed: {}", json
            ),
        }
    }

    fn checkpoint(&self, checkpoint: &CredentialCheckpoint) {
        match serde_json::to_string(checkpoint) {
            Ok(json) => info!(
                target: AUDIT_TARGET,
                rotation_id = %checkpoint.rotation_id,
                rule = %checkpoint.rule_name,
                slot = %checkpoint.slot,
                "credential regenerated: {}", json
            ),
            Err(e) => error!(
                target: AUDIT_TARGET,
                rotation_id = %checkpoint.rotation_id,
                rule = %checkpoint.rule_name,
                connection_string = %checkpoint.connection_string,
                "failed to serialize credential checkpoint: {}", e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::RecoveryValue;

    #[test]
    fn test_partial_rotation_record_carries_raw_value() {
        let mut run = RotationRun::new("FunctionAppAccess", TriggerSource::Timer);
        run.advance(RotationState::Locked);
        run.advance(RotationState::WritingSecret);
        run.fail(
            FailureReason::PartialRotation,
            "write failed".into(),
            Some(RecoveryValue {
                slot: KeySlot::Primary,
                secret_name: "sb-fa".into(),
                connection_string: ConnectionString::new("SharedAccessKey=new-key"),
            }),
        );

        let record = AuditRecord::from_run(&run);
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.failed_in, Some(RotationState::WritingSecret));

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("SharedAccessKey=new-key"));
    }

    #[test]
    fn test_successful_record_is_info() {
        let mut run = RotationRun::new("ReadOnlyAccess", TriggerSource::Manual);
        run.advance(RotationState::Locked);
        run.complete();

        let record = AuditRecord::from_run(&run);
        assert_eq!(record.severity, Severity::Info);
        assert!(record.recovery.is_none());
        assert_eq!(record.final_state, RotationState::Completed);
    }

    #[test]
    fn test_checkpoint_serializes_value() {
        let checkpoint = CredentialCheckpoint::new(
            Uuid::new_v4(),
            "r",
            KeySlot::Primary,
            Some("s"),
            &ConnectionString::new("SharedAccessKey=abc"),
        );
        let json = serde_json::to_string(&checkpoint).unwrap();
        assert!(json.contains("SharedAccessKey=abc"));
        assert!(json.contains("\"slot\":\"primary\""));
    }
}
