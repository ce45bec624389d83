//! In-memory collaborators for driving the orchestrator end to end.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use servicebus_key_rotator::audit::{AuditRecord, AuditSink, CredentialCheckpoint};
use servicebus_key_rotator::backends::{validate_write, SecretStore};
use servicebus_key_rotator::lock::InMemoryRotationLock;
use servicebus_key_rotator::rotation::{Orchestrator, RetryPolicy, RotationSettings};
use servicebus_key_rotator::{ClientError, ConnectionString, CredentialBackend, KeySlot};

/// Service Bus namespace whose keys live in memory.
#[derive(Default)]
pub struct FakeServiceBus {
    calls: Mutex<Vec<(String, KeySlot)>>,
    scripted: Mutex<HashMap<(String, KeySlot), VecDeque<ClientError>>>,
    live: Mutex<HashMap<(String, KeySlot), String>>,
    generation: AtomicU64,
    probe_error: Mutex<Option<ClientError>>,
}

impl FakeServiceBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next regeneration of `rule`/`slot` fail with `err`.
    pub fn fail_next(&self, rule: &str, slot: KeySlot, err: ClientError) {
        self.scripted
            .lock()
            .unwrap()
            .entry((rule.to_string(), slot))
            .or_default()
            .push_back(err);
    }

    pub fn fail_probe(&self, err: ClientError) {
        *self.probe_error.lock().unwrap() = Some(err);
    }

    /// Every regeneration attempt, failed ones included, in call order.
    pub fn calls(&self) -> Vec<(String, KeySlot)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, rule: &str) -> usize {
        self.calls().iter().filter(|(r, _)| r == rule).count()
    }

    pub fn calls_for_slot(&self, rule: &str, slot: KeySlot) -> usize {
        self.calls()
            .iter()
            .filter(|(r, s)| r == rule && *s == slot)
            .count()
    }

    /// Connection string for the key currently live in `rule`/`slot`.
    pub fn live_connection_string(&self, rule: &str, slot: KeySlot) -> Option<String> {
        self.live
            .lock()
            .unwrap()
            .get(&(rule.to_string(), slot))
            .cloned()
    }
}

#[async_trait::async_trait]
impl CredentialBackend for FakeServiceBus {
    async fn regenerate_key(&self, rule_name: &str, slot: KeySlot) -> Result<ConnectionString, ClientError> {
        self.calls.lock().unwrap().push((rule_name.to_string(), slot));

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&(rule_name.to_string(), slot))
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let value = format!(
            "Endpoint=sb://sb-test.servicebus.windows.net/;SharedAccessKeyName={};SharedAccessKey={}-key-{}",
            rule_name, slot, generation
        );
        self.live
            .lock()
            .unwrap()
            .insert((rule_name.to_string(), slot), value.clone());
        Ok(ConnectionString::new(value))
    }

    async fn probe(&self) -> Result<(), ClientError> {
        self.probe_error.lock().unwrap().clone().map_or(Ok(()), Err)
    }

    fn backend_type(&self) -> &'static str {
        "fake-service-bus"
    }
}

/// Secret store backed by a map, with per-secret scripted write failures.
#[derive(Default)]
pub struct FakeStore {
    secrets: Mutex<HashMap<String, String>>,
    write_failures: Mutex<HashMap<String, VecDeque<ClientError>>>,
    writes: AtomicU32,
    probe_error: Mutex<Option<ClientError>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` writes to `name` fail with `err`.
    pub fn fail_writes(&self, name: &str, times: usize, err: ClientError) {
        let mut failures = self.write_failures.lock().unwrap();
        let queue = failures.entry(name.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    pub fn fail_probe(&self, err: ClientError) {
        *self.probe_error.lock().unwrap() = Some(err);
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.secrets.lock().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.secrets.lock().unwrap().len()
    }

    /// Write attempts, failed ones included.
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SecretStore for FakeStore {
    async fn write_secret(&self, name: &str, value: &str, expires_at: DateTime<Utc>) -> Result<(), ClientError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        validate_write(name, value, expires_at)?;

        let scripted = self
            .write_failures
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        self.secrets
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn read_secret(&self, name: &str) -> Result<String, ClientError> {
        self.get(name)
            .ok_or_else(|| ClientError::NotFound(format!("secret '{}'", name)))
    }

    async fn probe(&self) -> Result<(), ClientError> {
        self.probe_error.lock().unwrap().clone().map_or(Ok(()), Err)
    }

    fn store_type(&self) -> &'static str {
        "fake-store"
    }
}

#[derive(Default)]
pub struct CapturingAudit {
    records: Mutex<Vec<AuditRecord>>,
    checkpoints: Mutex<Vec<CredentialCheckpoint>>,
}

impl CapturingAudit {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn checkpoints(&self) -> Vec<CredentialCheckpoint> {
        self.checkpoints.lock().unwrap().clone()
    }
}

impl AuditSink for CapturingAudit {
    fn emit(&self, record: &AuditRecord) {
        self.records.lock().unwrap().push(record.clone());
    }

    fn checkpoint(&self, checkpoint: &CredentialCheckpoint) {
        self.checkpoints.lock().unwrap().push(checkpoint.clone());
    }
}

/// Millisecond-scale timings so full runs finish quickly.
pub fn fast_settings() -> RotationSettings {
    RotationSettings {
        grace_period: Duration::from_millis(20),
        propagation_delay: Duration::from_millis(2),
        secret_expiry_days: 30,
        lock_ttl: Duration::from_millis(300),
        call_timeout: Duration::from_millis(500),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    }
}

pub struct Harness {
    pub backend: Arc<FakeServiceBus>,
    pub store: Arc<FakeStore>,
    pub lock: Arc<InMemoryRotationLock>,
    pub audit: Arc<CapturingAudit>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: RotationSettings) -> Self {
        let backend = Arc::new(FakeServiceBus::new());
        let store = Arc::new(FakeStore::new());
        let lock = Arc::new(InMemoryRotationLock::new());
        let audit = Arc::new(CapturingAudit::default());
        let orchestrator = Arc::new(Orchestrator::new(
            backend.clone(),
            store.clone(),
            lock.clone(),
            audit.clone(),
            settings,
        ));

        Self {
            backend,
            store,
            lock,
            audit,
            orchestrator,
        }
    }
}
