use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::credential_backend::{ConnectionString, CredentialBackend, KeySlot};
use crate::auth::{TokenProvider, MANAGEMENT_RESOURCE};
use crate::error::ClientError;

const API_VERSION: &str = "2021-11-01";

/// Azure Service Bus management-plane client
pub struct ServiceBusClient {
    client: Client,
    token: Arc<dyn TokenProvider>,
    management_endpoint: String,
    subscription_id: String,
    resource_group: String,
    namespace: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessKeys {
    primary_connection_string: Option<String>,
    secondary_connection_string: Option<String>,
}

impl ServiceBusClient {
    /// Create a new Service Bus client
    pub fn new(
        token: Arc<dyn TokenProvider>,
        management_endpoint: &str,
        subscription_id: &str,
        resource_group: &str,
        namespace: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Unknown(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token,
            management_endpoint: management_endpoint.trim_end_matches('/').to_string(),
            subscription_id: subscription_id.to_string(),
            resource_group: resource_group.to_string(),
            namespace: namespace.to_string(),
        })
    }

    pub(crate) fn namespace_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ServiceBus/namespaces/{}",
            self.management_endpoint, self.subscription_id, self.resource_group, self.namespace
        )
    }

    pub(crate) fn regenerate_url(&self, rule_name: &str) -> String {
        format!(
            "{}/authorizationRules/{}/regenerateKeys?api-version={}",
            self.namespace_url(),
            rule_name,
            API_VERSION
        )
    }
}

#[async_trait::async_trait]
impl CredentialBackend for ServiceBusClient {
    async fn regenerate_key(
        &self,
        rule_name: &str,
        slot: KeySlot,
    ) -> Result<ConnectionString, ClientError> {
        let context = format!("regenerate {} key for rule '{}'", slot, rule_name);
        let url = self.regenerate_url(rule_name);
        debug!("Regenerating key at: {}", url);

        let token = self.token.token(MANAGEMENT_RESOURCE).await?;
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "keyType": slot.key_type() }))
            .send()
            .await
            .map_err(|e| ClientError::from_transport(&context, e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(ClientError::from_status(status, &context, &body));
        }

        let keys: AccessKeys = response
            .json()
            .await
            .map_err(|e| ClientError::from_transport(&context, e))?;

        let connection_string = match slot {
            KeySlot::Primary => keys.primary_connection_string,
            KeySlot::Secondary => keys.secondary_connection_string,
        }
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ClientError::Unknown(format!("{}: response carried no {} connection string", context, slot))
        })?;

        info!("Regenerated {} key for rule {} on {}", slot, rule_name, self.namespace);
        Ok(ConnectionString::new(connection_string))
    }

    async fn probe(&self) -> Result<(), ClientError> {
        let url = format!("{}?api-version={}", self.namespace_url(), API_VERSION);
        debug!("Probing Service Bus namespace: {}", url);

        let token = self.token.token(MANAGEMENT_RESOURCE).await?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ClientError::from_transport("read namespace", e))?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            return Err(ClientError::from_status(status, "read namespace", &body));
        }

        match body["properties"]["status"].as_str() {
            Some("Active") | None => Ok(()),
            Some(other) => Err(ClientError::Transient(format!(
                "namespace {} is {}",
                self.namespace, other
            ))),
        }
    }

    fn backend_type(&self) -> &'static str {
        "Azure Service Bus"
    }
}
