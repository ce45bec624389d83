//! Dependency health probes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::backends::SecretStore;
use crate::credentials::CredentialBackend;
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub service_bus: ComponentStatus,
    pub key_vault: ComponentStatus,
    pub overall: OverallStatus,
    pub checked_at: DateTime<Utc>,
    /// Probe error text keyed by component name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.overall == OverallStatus::Healthy
    }
}

/// Probes the credential backend and the secret store. Takes no locks and
/// writes nothing.
pub struct HealthReporter {
    backend: Arc<dyn CredentialBackend>,
    store: Arc<dyn SecretStore>,
    probe_timeout: Duration,
}

impl HealthReporter {
    pub fn new(backend: Arc<dyn CredentialBackend>, store: Arc<dyn SecretStore>, probe_timeout: Duration) -> Self {
        Self {
            backend,
            store,
            probe_timeout,
        }
    }

    pub async fn check(&self) -> HealthSnapshot {
        let (service_bus, key_vault) = tokio::join!(
            self.probe(self.backend.probe(), "service bus"),
            self.probe(self.store.probe(), "secret store"),
        );

        let mut errors = BTreeMap::new();
        let service_bus = component("service_bus", service_bus, &mut errors);
        let key_vault = component("key_vault", key_vault, &mut errors);
        let overall = if errors.is_empty() {
            OverallStatus::Healthy
        } else {
            OverallStatus::Degraded
        };

        HealthSnapshot {
            service_bus,
            key_vault,
            overall,
            checked_at: Utc::now(),
            errors,
        }
    }

    async fn probe<F>(&self, call: F, what: &str) -> Result<(), ClientError>
    where
        F: std::future::Future<Output = Result<(), ClientError>>,
    {
        tokio::time::timeout(self.probe_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(ClientError::Transient(format!(
                    "{} probe timed out after {:?}",
                    what, self.probe_timeout
                )))
            })
    }
}

fn component(
    name: &str,
    result: Result<(), ClientError>,
    errors: &mut BTreeMap<String, String>,
) -> ComponentStatus {
    match result {
        Ok(()) => ComponentStatus::Healthy,
        Err(e) => {
            warn!(component = name, "Health probe failed: {}", e);
            errors.insert(name.to_string(), e.to_string());
            ComponentStatus::Degraded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ConnectionString, KeySlot};

    struct Probe(Option<ClientError>);

    #[async_trait::async_trait]
    impl CredentialBackend for Probe {
        async fn regenerate_key(&self, _: &str, _: KeySlot) -> Result<ConnectionString, ClientError> {
            panic!("health checks must not regenerate keys")
        }

        async fn probe(&self) -> Result<(), ClientError> {
            self.0.clone().map_or(Ok(()), Err)
        }

        fn backend_type(&self) -> &'static str {
            "probe"
        }
    }

    #[async_trait::async_trait]
    impl SecretStore for Probe {
        async fn write_secret(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<(), ClientError> {
            panic!("health checks must not write secrets")
        }

        async fn read_secret(&self, _: &str) -> Result<String, ClientError> {
            panic!("unused")
        }

        async fn probe(&self) -> Result<(), ClientError> {
            self.0.clone().map_or(Ok(()), Err)
        }

        fn store_type(&self) -> &'static str {
            "probe"
        }
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let reporter = HealthReporter::new(Arc::new(Probe(None)), Arc::new(Probe(None)), Duration::from_secs(1));
        let snapshot = reporter.check().await;
        assert!(snapshot.is_healthy());
        assert!(snapshot.errors.is_empty());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["overall"], "healthy");
        assert!(json.get("errors").is_none());
    }

    #[tokio::test]
    async fn test_store_failure_degrades() {
        let reporter = HealthReporter::new(
            Arc::new(Probe(None)),
            Arc::new(Probe(Some(ClientError::Permission("vault says no".into())))),
            Duration::from_secs(1),
        );
        let snapshot = reporter.check().await;
        assert_eq!(snapshot.service_bus, ComponentStatus::Healthy);
        assert_eq!(snapshot.key_vault, ComponentStatus::Degraded);
        assert_eq!(snapshot.overall, OverallStatus::Degraded);
        assert!(snapshot.errors["key_vault"].contains("vault says no"));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["service_bus"], "healthy");
        assert_eq!(json["key_vault"], "degraded");
        assert_eq!(json["overall"], "degraded");
    }
}
