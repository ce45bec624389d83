use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::retry::{retry_transient, Attempted, RetryPolicy};
use super::run::{
    FailureReason, RecoveryValue, RotationRun, RotationState, StepName, StepOutcome, TriggerSource,
};
use crate::audit::{AuditRecord, AuditSink, CredentialCheckpoint};
use crate::backends::SecretStore;
use crate::config::{AuthorizationRuleSpec, RotationConfig};
use crate::credentials::{ConnectionString, CredentialBackend, KeySlot};
use crate::error::{ClientError, ErrorKind, LockError};
use crate::lock::{LockToken, RotationLock};

/// Timing and retry knobs for a rotation run.
#[derive(Debug, Clone)]
pub struct RotationSettings {
    /// Wait between the primary write and touching the secondary slot.
    pub grace_period: Duration,
    /// Wait between a regeneration and the matching secret write.
    pub propagation_delay: Duration,
    pub secret_expiry_days: u32,
    pub lock_ttl: Duration,
    /// Deadline for each individual backend or store call.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            propagation_delay: Duration::from_secs(30),
            secret_expiry_days: 30,
            lock_ttl: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl RotationSettings {
    pub fn from_config(config: &RotationConfig) -> Self {
        Self {
            grace_period: Duration::from_secs(config.grace_period_seconds),
            propagation_delay: Duration::from_secs(config.propagation_delay_seconds),
            secret_expiry_days: config.secret_expiry_days,
            lock_ttl: Duration::from_secs(config.lock_ttl_seconds),
            call_timeout: Duration::from_secs(config.call_timeout_seconds),
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
        }
    }

    /// Longest a retried backend or store call can run. The lease is only
    /// refreshed between calls, so it must outlive this.
    pub fn max_call_window(&self) -> Duration {
        self.call_timeout
            .saturating_mul(self.retry.max_attempts.max(1))
            .saturating_add(self.retry.max_total_backoff())
    }

    /// How often a held lease is refreshed during waits.
    pub fn refresh_interval(&self) -> Duration {
        (self.lock_ttl / 3).max(Duration::from_millis(1))
    }
}

/// Where a regenerated key is written, and how the write is recorded.
struct WriteTarget<'a> {
    slot: KeySlot,
    secret_name: &'a str,
    step: StepName,
    writing: RotationState,
}

/// Drives authorization rules through the rotation state machine.
pub struct Orchestrator {
    backend: Arc<dyn CredentialBackend>,
    store: Arc<dyn SecretStore>,
    lock: Arc<dyn RotationLock>,
    audit: Arc<dyn AuditSink>,
    settings: RotationSettings,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn CredentialBackend>,
        store: Arc<dyn SecretStore>,
        lock: Arc<dyn RotationLock>,
        audit: Arc<dyn AuditSink>,
        settings: RotationSettings,
    ) -> Self {
        Self {
            backend,
            store,
            lock,
            audit,
            settings,
        }
    }

    pub fn settings(&self) -> &RotationSettings {
        &self.settings
    }

    /// Run one complete rotation for `rule`.
    ///
    /// Always returns a terminal run. The lease is released and the audit
    /// record emitted before this returns, whatever the outcome.
    pub async fn rotate(&self, rule: &AuthorizationRuleSpec, trigger: TriggerSource) -> RotationRun {
        let mut run = RotationRun::new(&rule.rule_name, trigger);
        info!(
            rotation_id = %run.rotation_id,
            rule = %rule.rule_name,
            ?trigger,
            "Starting rotation"
        );

        let token = match self.lock.acquire(&rule.rule_name, self.settings.lock_ttl).await {
            Ok(token) => token,
            Err(e) => {
                let reason = match e {
                    LockError::AlreadyLocked { .. } => FailureReason::ConcurrentRotationInProgress,
                    _ => FailureReason::Unknown,
                };
                run.fail(reason, e.to_string(), None);
                self.finish(&run);
                return run;
            }
        };
        run.advance(RotationState::Locked);

        self.execute(rule, &token, &mut run).await;

        if let Err(e) = self.lock.release(&rule.rule_name, &token).await {
            warn!(
                rotation_id = %run.rotation_id,
                rule = %rule.rule_name,
                "Failed to release rotation lease: {}", e
            );
        }

        self.finish(&run);
        run
    }

    async fn execute(&self, rule: &AuthorizationRuleSpec, token: &LockToken, run: &mut RotationRun) {
        let rule_name = rule.rule_name.as_str();

        // Nothing has changed yet, so every failure here is clean.
        run.advance(RotationState::RegeneratingPrimary);
        let started_at = Utc::now();
        let attempted = self.regenerate(rule_name, KeySlot::Primary).await;
        let primary = match attempted.result {
            Ok(value) => {
                run.record(
                    StepName::RegeneratePrimary,
                    started_at,
                    StepOutcome::Ok,
                    attempts_detail(attempted.attempts),
                );
                value
            }
            Err(e) => {
                run.record(StepName::RegeneratePrimary, started_at, StepOutcome::Error, Some(e.to_string()));
                error!(rotation_id = %run.rotation_id, rule = rule_name, "Primary key regeneration failed: {}", e);
                run.fail(FailureReason::from_client_error(&e), e.to_string(), None);
                return;
            }
        };
        run.advance(RotationState::PrimaryRegenerated);
        self.checkpoint(run, KeySlot::Primary, Some(&rule.secret_name), &primary);

        let written = self
            .propagate(
                run,
                token,
                WriteTarget {
                    slot: KeySlot::Primary,
                    secret_name: &rule.secret_name,
                    step: StepName::UpdateSecretPrimary,
                    writing: RotationState::WritingSecret,
                },
                primary,
            )
            .await;
        if !written {
            return;
        }
        run.advance(RotationState::SecretWritten);

        run.advance(RotationState::AwaitingGrace);
        let started_at = Utc::now();
        info!(
            rotation_id = %run.rotation_id,
            rule = rule_name,
            grace_period = ?self.settings.grace_period,
            "Waiting for consumers to pick up the new primary key"
        );
        if let Err(e) = self.hold(rule_name, token, self.settings.grace_period).await {
            run.record(StepName::WaitGrace, started_at, StepOutcome::Error, Some(e.to_string()));
            error!(rotation_id = %run.rotation_id, rule = rule_name, "Lease lost during grace period: {}", e);
            run.fail(FailureReason::LockLost, e.to_string(), None);
            return;
        }
        run.record(StepName::WaitGrace, started_at, StepOutcome::Ok, None);

        run.advance(RotationState::RegeneratingSecondary);
        let started_at = Utc::now();
        let attempted = self.regenerate(rule_name, KeySlot::Secondary).await;
        let secondary = match attempted.result {
            Ok(value) => {
                run.record(
                    StepName::RegenerateSecondary,
                    started_at,
                    StepOutcome::Ok,
                    attempts_detail(attempted.attempts),
                );
                value
            }
            Err(e) => {
                run.record(StepName::RegenerateSecondary, started_at, StepOutcome::Error, Some(e.to_string()));
                error!(rotation_id = %run.rotation_id, rule = rule_name, "Secondary key regeneration failed: {}", e);
                // The primary is already live; an unclear secondary outcome still needs a human.
                let reason = match e.kind() {
                    ErrorKind::Permission => FailureReason::PermissionDenied,
                    ErrorKind::NotFound => FailureReason::NotFound,
                    _ => FailureReason::PartialRotation,
                };
                run.fail(reason, e.to_string(), None);
                return;
            }
        };
        self.checkpoint(run, KeySlot::Secondary, rule.secondary_secret_name.as_deref(), &secondary);

        match rule.secondary_secret_name.as_deref() {
            Some(secret_name) => {
                let written = self
                    .propagate(
                        run,
                        token,
                        WriteTarget {
                            slot: KeySlot::Secondary,
                            secret_name,
                            step: StepName::UpdateSecretSecondary,
                            writing: RotationState::WritingSecondarySecret,
                        },
                        secondary,
                    )
                    .await;
                if !written {
                    return;
                }
            }
            None => {
                info!(
                    rotation_id = %run.rotation_id,
                    rule = rule_name,
                    "No secret mapped for the secondary key, rotated for freshness only"
                );
            }
        }

        run.complete();
    }

    /// Wait out the propagation delay, then write `value` with retries.
    ///
    /// Returns `false` once the run has been failed. Any failure here leaves
    /// the backend ahead of the store, so the value travels with the run.
    async fn propagate(
        &self,
        run: &mut RotationRun,
        token: &LockToken,
        target: WriteTarget<'_>,
        value: ConnectionString,
    ) -> bool {
        let WriteTarget {
            slot,
            secret_name,
            step,
            writing,
        } = target;
        let rule_name = run.rule_name.clone();
        let started_at = Utc::now();
        let recovery = |value: ConnectionString| RecoveryValue {
            slot,
            secret_name: secret_name.to_string(),
            connection_string: value,
        };

        if let Err(e) = self.hold(&rule_name, token, self.settings.propagation_delay).await {
            let detail = format!("lease lost before writing {}: {}", secret_name, e);
            run.record(step, started_at, StepOutcome::Error, Some(detail.clone()));
            error!(rotation_id = %run.rotation_id, rule = %rule_name, %slot, "{}", detail);
            run.fail(FailureReason::PartialRotation, detail, Some(recovery(value)));
            return false;
        }

        run.advance(writing);
        let expires_at = Utc::now() + chrono::Duration::days(i64::from(self.settings.secret_expiry_days));
        let raw = value.expose();
        let store = &self.store;
        let attempted = retry_transient(&self.settings.retry, "write_secret", move || {
            self.bounded("write_secret", store.write_secret(secret_name, raw, expires_at))
        })
        .await;

        match attempted.result {
            Ok(()) => {
                info!(
                    rotation_id = %run.rotation_id,
                    rule = %rule_name,
                    %slot,
                    secret = secret_name,
                    %expires_at,
                    "Secret updated"
                );
                run.record(step, started_at, StepOutcome::Ok, attempts_detail(attempted.attempts));
                true
            }
            Err(e) => {
                let detail = format!(
                    "writing {} failed after {} attempt(s): {}",
                    secret_name, attempted.attempts, e
                );
                run.record(step, started_at, StepOutcome::Error, Some(detail.clone()));
                error!(
                    rotation_id = %run.rotation_id,
                    rule = %rule_name,
                    %slot,
                    "Secret store is out of sync with the live key: {}", detail
                );
                run.fail(FailureReason::PartialRotation, detail, Some(recovery(value)));
                false
            }
        }
    }

    async fn regenerate(&self, rule_name: &str, slot: KeySlot) -> Attempted<ConnectionString> {
        let backend = &self.backend;
        retry_transient(&self.settings.retry, "regenerate_key", move || {
            self.bounded("regenerate_key", backend.regenerate_key(rule_name, slot))
        })
        .await
    }

    /// Apply the per-call deadline. A call that overruns counts as transient.
    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Transient(format!(
                "{} timed out after {:?}",
                operation, self.settings.call_timeout
            ))),
        }
    }

    /// Sleep for `wait` while keeping the lease alive.
    async fn hold(&self, rule_name: &str, token: &LockToken, wait: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + wait;
        loop {
            self.lock.refresh(rule_name, token, self.settings.lock_ttl).await?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep((deadline - now).min(self.settings.refresh_interval())).await;
        }
    }

    fn checkpoint(&self, run: &RotationRun, slot: KeySlot, secret_name: Option<&str>, value: &ConnectionString) {
        self.audit.checkpoint(&CredentialCheckpoint::new(
            run.rotation_id,
            &run.rule_name,
            slot,
            secret_name,
            value,
        ));
    }

    fn finish(&self, run: &RotationRun) {
        self.audit.emit(&AuditRecord::from_run(run));

        if run.succeeded() {
            info!(
                rotation_id = %run.rotation_id,
                rule = %run.rule_name,
                duration_seconds = run.duration_seconds(),
                "Rotation completed"
            );
        } else {
            error!(
                rotation_id = %run.rotation_id,
                rule = %run.rule_name,
                failure = ?run.failure,
                failed_in = ?run.failed_in,
                "Rotation failed: {}",
                run.failure_detail.as_deref().unwrap_or("no detail")
            );
        }
    }
}

fn attempts_detail(attempts: u32) -> Option<String> {
    (attempts > 1).then(|| format!("succeeded after {} attempts", attempts))
}
