//! Azure AD bearer token acquisition.
//!
//! Both the Service Bus management plane and Key Vault data plane take a
//! bearer token scoped to their own resource, so providers are asked for a
//! token per resource and cache each one until shortly before it expires.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ClientError;

/// Resource identifier for Azure Resource Manager.
pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com";
/// Resource identifier for Key Vault.
pub const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";

const DEFAULT_LOGIN_BASE: &str = "https://login.microsoftonline.com";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Source of bearer tokens for Azure APIs.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, resource: &str) -> Result<String, ClientError>;
}

#[derive(Default)]
struct TokenCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl TokenCache {
    async fn get(&self, resource: &str) -> Option<String> {
        let guard = self.entries.lock().await;
        guard
            .get(resource)
            .filter(|(_, expiry)| Instant::now() < *expiry)
            .map(|(token, _)| token.clone())
    }

    async fn put(&self, resource: &str, token: &str, expires_in: u64) {
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        self.entries
            .lock()
            .await
            .insert(resource.to_string(), (token.to_string(), expiry));
    }
}

/// `expires_in` is a number from AAD and a string from IMDS / App Service.
fn expires_in(body: &Value) -> u64 {
    body["expires_in"]
        .as_u64()
        .or_else(|| body["expires_in"].as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(3600)
}

fn access_token(body: &Value, source: &str) -> Result<String, ClientError> {
    body["access_token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ClientError::Unknown(format!("{}: no access_token in token response", source)))
}

/// Managed identity credential.
///
/// Uses the App Service / Functions identity endpoint when `IDENTITY_ENDPOINT`
/// is set, and the instance metadata service otherwise.
pub struct ManagedIdentityToken {
    client: reqwest::Client,
    endpoint: Option<(String, String)>,
    client_id: Option<String>,
    cache: TokenCache,
}

impl ManagedIdentityToken {
    pub fn from_env(client_id: Option<String>) -> Self {
        let endpoint = match (
            std::env::var("IDENTITY_ENDPOINT"),
            std::env::var("IDENTITY_HEADER"),
        ) {
            (Ok(url), Ok(header)) => Some((url, header)),
            _ => None,
        };

        Self {
            client: reqwest::Client::new(),
            endpoint,
            client_id,
            cache: TokenCache::default(),
        }
    }
}

#[async_trait]
impl TokenProvider for ManagedIdentityToken {
    async fn token(&self, resource: &str) -> Result<String, ClientError> {
        if let Some(token) = self.cache.get(resource).await {
            return Ok(token);
        }

        let mut request = match &self.endpoint {
            Some((url, header)) => self
                .client
                .get(url)
                .header("X-IDENTITY-HEADER", header)
                .query(&[("api-version", "2019-08-01"), ("resource", resource)]),
            None => self
                .client
                .get(IMDS_ENDPOINT)
                .header("Metadata", "true")
                .query(&[("api-version", "2018-02-01"), ("resource", resource)]),
        };
        if let Some(ref client_id) = self.client_id {
            request = request.query(&[("client_id", client_id)]);
        }

        debug!(resource, "requesting managed identity token");
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::from_transport("managed identity token", e))?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            return Err(ClientError::from_status(status, "managed identity token", &body));
        }

        let token = access_token(&body, "managed identity")?;
        self.cache.put(resource, &token, expires_in(&body)).await;
        Ok(token)
    }
}

/// Service principal client-credentials flow.
pub struct ClientSecretToken {
    client: reqwest::Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    login_base: String,
    cache: TokenCache,
}

impl ClientSecretToken {
    pub fn new(tenant_id: String, client_id: String, client_secret: String) -> Self {
        Self::with_login_base(tenant_id, client_id, client_secret, DEFAULT_LOGIN_BASE.to_string())
    }

    /// Point the provider at a different authority host (sovereign clouds, tests).
    pub fn with_login_base(
        tenant_id: String,
        client_id: String,
        client_secret: String,
        login_base: String,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            tenant_id,
            client_id,
            client_secret,
            login_base: login_base.trim_end_matches('/').to_string(),
            cache: TokenCache::default(),
        }
    }
}

#[async_trait]
impl TokenProvider for ClientSecretToken {
    async fn token(&self, resource: &str) -> Result<String, ClientError> {
        if let Some(token) = self.cache.get(resource).await {
            return Ok(token);
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.login_base, self.tenant_id);
        let scope = format!("{}/.default", resource.trim_end_matches('/'));
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];

        debug!(resource, tenant = %self.tenant_id, "requesting service principal token");
        let response = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ClientError::from_transport("service principal token", e))?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            return Err(ClientError::from_status(status, "service principal token", &body));
        }

        let token = access_token(&body, "service principal")?;
        self.cache.put(resource, &token, expires_in(&body)).await;
        Ok(token)
    }
}

/// Fixed token, for tests and local emulators.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self, _resource: &str) -> Result<String, ClientError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[test]
    fn test_expires_in_accepts_number_and_string() {
        assert_eq!(expires_in(&json!({"expires_in": 1200})), 1200);
        assert_eq!(expires_in(&json!({"expires_in": "86399"})), 86399);
        assert_eq!(expires_in(&json!({})), 3600);
    }

    #[tokio::test]
    async fn test_client_secret_token_is_cached_per_resource() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_body(Matcher::UrlEncoded(
                "scope".into(),
                "https://vault.azure.net/.default".into(),
            ))
            .with_status(200)
            .with_body(r#"{"access_token":"kv-token","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let provider = ClientSecretToken::with_login_base(
            "tenant-1".into(),
            "client".into(),
            "secret".into(),
            server.url(),
        );

        assert_eq!(provider.token(KEY_VAULT_RESOURCE).await.unwrap(), "kv-token");
        assert_eq!(provider.token(KEY_VAULT_RESOURCE).await.unwrap(), "kv-token");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_secret_token_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(401)
            .with_body(r#"{"error":{"code":"invalid_client","message":"bad secret"}}"#)
            .create_async()
            .await;

        let provider = ClientSecretToken::with_login_base(
            "tenant-1".into(),
            "client".into(),
            "wrong".into(),
            server.url(),
        );

        let err = provider.token(MANAGEMENT_RESOURCE).await.unwrap_err();
        assert!(matches!(err, ClientError::Permission(_)));
    }

    #[tokio::test]
    async fn test_static_token() {
        let provider = StaticToken("fixed".into());
        assert_eq!(provider.token(MANAGEMENT_RESOURCE).await.unwrap(), "fixed");
    }
}
