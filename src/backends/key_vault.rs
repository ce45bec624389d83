use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::secret_backend::{validate_write, SecretStore};
use crate::auth::{TokenProvider, KEY_VAULT_RESOURCE};
use crate::error::ClientError;

const API_VERSION: &str = "7.4";

/// Azure Key Vault secrets client
pub struct KeyVaultClient {
    client: Client,
    token: Arc<dyn TokenProvider>,
    vault_uri: String,
    namespace: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetSecretRequest<'a> {
    value: &'a str,
    content_type: &'static str,
    attributes: SecretAttributes,
    tags: HashMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
struct SecretAttributes {
    enabled: bool,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

impl KeyVaultClient {
    /// Create a new Key Vault client
    ///
    /// `namespace` is recorded on every written secret as the `Namespace` tag.
    pub fn new(
        token: Arc<dyn TokenProvider>,
        vault_uri: &str,
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
            vault_uri: vault_uri.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
        })
    }

    pub(crate) fn secret_url(&self, name: &str) -> String {
        format!("{}/secrets/{}?api-version={}", self.vault_uri, name, API_VERSION)
    }

    fn rotation_tags(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("SecretType", "servicebus-connection-string".to_string()),
            ("RotatedBy", env!("CARGO_PKG_NAME").to_string()),
            ("RotatedAt", Utc::now().to_rfc3339()),
            ("Namespace", self.namespace.clone()),
        ])
    }
}

#[async_trait::async_trait]
impl SecretStore for KeyVaultClient {
    async fn write_secret(
        &self,
        name: &str,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        validate_write(name, value, expires_at)?;

        let context = format!("write secret '{}'", name);
        let url = self.secret_url(name);
        debug!("Writing secret to: {}", url);

        let request_body = SetSecretRequest {
            value,
            content_type: "text/plain",
            attributes: SecretAttributes {
                enabled: true,
                exp: expires_at.timestamp(),
            },
            tags: self.rotation_tags(),
        };

        let token = self.token.token(KEY_VAULT_RESOURCE).await?;
        let response = self
            .client
            .put(&url)
            .bearer_auth(&token)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| ClientError::from_transport(&context, e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(ClientError::from_status(status, &context, &body));
        }

        info!("Successfully updated Key Vault secret: {}", name);
        Ok(())
    }

    async fn read_secret(&self, name: &str) -> Result<String, ClientError> {
        let context = format!("read secret '{}'", name);
        let url = self.secret_url(name);
        debug!("Reading secret from: {}", url);

        let token = self.token.token(KEY_VAULT_RESOURCE).await?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ClientError::from_transport(&context, e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(ClientError::from_status(status, &context, &body));
        }

        let bundle: SecretBundle = response
            .json()
            .await
            .map_err(|e| ClientError::from_transport(&context, e))?;

        bundle
            .value
            .ok_or_else(|| ClientError::NotFound(format!("{}: secret has no current value", context)))
    }

    async fn probe(&self) -> Result<(), ClientError> {
        let url = format!("{}/secrets?maxresults=1&api-version={}", self.vault_uri, API_VERSION);
        debug!("Probing Key Vault: {}", url);

        let token = self.token.token(KEY_VAULT_RESOURCE).await?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ClientError::from_transport("list secrets", e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(ClientError::from_status(status, "list secrets", &body));
        }
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "Azure Key Vault"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use chrono::Duration as ChronoDuration;
    use mockito::Matcher;
    use serde_json::json;

    fn client(url: &str) -> KeyVaultClient {
        KeyVaultClient::new(
            Arc::new(StaticToken("kv-token".into())),
            url,
            "sb-test",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_secret_url_construction() {
        let client = client("https://kv-test.vault.azure.net/");
        assert_eq!(
            client.secret_url("servicebus-read-only-connection-string"),
            "https://kv-test.vault.azure.net/secrets/servicebus-read-only-connection-string?api-version=7.4"
        );
    }

    #[test]
    fn test_rotation_tags() {
        let tags = client("https://kv").rotation_tags();
        assert_eq!(tags.get("SecretType").map(String::as_str), Some("servicebus-connection-string"));
        assert_eq!(tags.get("Namespace").map(String::as_str), Some("sb-test"));
        assert!(tags.contains_key("RotatedAt"));
        assert!(tags.contains_key("RotatedBy"));
    }

    #[tokio::test]
    async fn test_write_secret_sends_value_and_expiry() {
        let mut server = mockito::Server::new_async().await;
        let expires_at = Utc::now() + ChronoDuration::days(30);
        let mock = server
            .mock("PUT", "/secrets/sb-conn")
            .match_query(Matcher::UrlEncoded("api-version".into(), "7.4".into()))
            .match_header("authorization", "Bearer kv-token")
            .match_body(Matcher::PartialJson(json!({
                "value": "Endpoint=sb://x/;SharedAccessKey=k",
                "contentType": "text/plain",
                "attributes": {"enabled": true, "exp": expires_at.timestamp()},
                "tags": {"Namespace": "sb-test"}
            })))
            .with_status(200)
            .with_body(r#"{"id":"https://kv/secrets/sb-conn/abc"}"#)
            .create_async()
            .await;

        client(&server.url())
            .write_secret("sb-conn", "Endpoint=sb://x/;SharedAccessKey=k", expires_at)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_write_secret_rejects_empty_value_without_calling_vault() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let err = client(&server.url())
            .write_secret("sb-conn", "", Utc::now() + ChronoDuration::days(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Invalid(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_write_secret_forbidden() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/secrets/sb-conn")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error":{"code":"Forbidden","message":"set permission missing"}}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .write_secret("sb-conn", "v", Utc::now() + ChronoDuration::days(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Permission(_)));
    }

    #[tokio::test]
    async fn test_read_secret() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/secrets/sb-conn")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"value":"current-value","id":"https://kv/secrets/sb-conn/v2"}"#)
            .create_async()
            .await;

        let value = client(&server.url()).read_secret("sb-conn").await.unwrap();
        assert_eq!(value, "current-value");
    }

    #[tokio::test]
    async fn test_read_missing_secret() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/secrets/missing")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error":{"code":"SecretNotFound","message":"missing"}}"#)
            .create_async()
            .await;

        let err = client(&server.url()).read_secret("missing").await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_probe_throttled_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/secrets")
            .match_query(Matcher::Any)
            .with_status(429)
            .create_async()
            .await;

        let err = client(&server.url()).probe().await.unwrap_err();
        assert!(err.is_transient());
    }
}
