use aws_config::Region;
use aws_sdk_secretsmanager::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_secretsmanager::types::Tag;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::secret_backend::{validate_write, SecretStore};
use crate::error::ClientError;

/// AWS Secrets Manager store
///
/// Secrets Manager has no native expiry on a version, so the expiration is
/// recorded as an `ExpiresAt` tag next to the rotation tags.
pub struct AwsSecretsStore {
    client: SecretsManagerClient,
    namespace: String,
}

impl AwsSecretsStore {
    /// Create a new AWS Secrets Manager store
    pub async fn new(region: Option<String>, namespace: &str) -> Self {
        let region_str = region.unwrap_or_else(|| {
            std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string())
        });

        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region_str))
            .load()
            .await;

        Self {
            client: SecretsManagerClient::new(&config),
            namespace: namespace.to_string(),
        }
    }

    /// Tags recorded on every rotated secret
    fn rotation_metadata(&self, expires_at: DateTime<Utc>) -> HashMap<String, String> {
        HashMap::from([
            ("SecretType".to_string(), "servicebus-connection-string".to_string()),
            ("RotatedBy".to_string(), env!("CARGO_PKG_NAME").to_string()),
            ("RotatedAt".to_string(), Utc::now().to_rfc3339()),
            ("ExpiresAt".to_string(), expires_at.to_rfc3339()),
            ("Namespace".to_string(), self.namespace.clone()),
        ])
    }
}

/// Convert metadata HashMap to AWS tags
fn metadata_to_tags(metadata: &HashMap<String, String>) -> Vec<Tag> {
    metadata
        .iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build())
        .collect()
}

/// Map an SDK failure onto the shared taxonomy.
fn classify<E, R>(context: &str, err: SdkError<E, R>) -> ClientError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return ClientError::Transient(message)
        }
        _ => {}
    }

    match err.code() {
        Some("ResourceNotFoundException") => ClientError::NotFound(message),
        Some("AccessDeniedException")
        | Some("UnrecognizedClientException")
        | Some("InvalidSignatureException")
        | Some("ExpiredTokenException") => ClientError::Permission(message),
        Some("InternalServiceError") | Some("ThrottlingException") | Some("ServiceUnavailable") => {
            ClientError::Transient(message)
        }
        Some("InvalidParameterException") | Some("InvalidRequestException") => {
            ClientError::Invalid(message)
        }
        _ => ClientError::Unknown(message),
    }
}

#[async_trait::async_trait]
impl SecretStore for AwsSecretsStore {
    async fn write_secret(
        &self,
        name: &str,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        validate_write(name, value, expires_at)?;
        debug!("Writing secret to AWS Secrets Manager: {}", name);

        self.client
            .put_secret_value()
            .secret_id(name)
            .secret_string(value)
            .send()
            .await
            .map_err(|e| classify(&format!("put secret value '{}'", name), e))?;

        // Tagging failures are logged, not returned.
        let tags = metadata_to_tags(&self.rotation_metadata(expires_at));
        if let Err(e) = self
            .client
            .tag_resource()
            .secret_id(name)
            .set_tags(Some(tags))
            .send()
            .await
        {
            warn!(
                "Updated secret '{}' but failed to tag it: {}",
                name,
                DisplayErrorContext(&e)
            );
        }

        info!("Successfully updated secret '{}' in AWS Secrets Manager", name);
        Ok(())
    }

    async fn read_secret(&self, name: &str) -> Result<String, ClientError> {
        debug!("Reading secret from AWS Secrets Manager: {}", name);

        let response = self
            .client
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
            .map_err(|e| classify(&format!("read secret '{}'", name), e))?;

        response
            .secret_string()
            .map(str::to_string)
            .ok_or_else(|| ClientError::NotFound(format!("Secret '{}' has no string value", name)))
    }

    async fn probe(&self) -> Result<(), ClientError> {
        self.client
            .list_secrets()
            .max_results(1)
            .send()
            .await
            .map_err(|e| classify("list secrets", e))?;
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "AWS Secrets Manager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_metadata_to_tags() {
        let mut metadata = HashMap::new();
        metadata.insert("Namespace".to_string(), "sb-test".to_string());
        metadata.insert("RotatedBy".to_string(), "rotator".to_string());

        let tags = metadata_to_tags(&metadata);
        assert_eq!(tags.len(), 2);

        let tag_map: HashMap<String, String> = tags
            .iter()
            .filter_map(|tag| {
                tag.key()
                    .and_then(|k| tag.value().map(|v| (k.to_string(), v.to_string())))
            })
            .collect();
        assert_eq!(tag_map.get("Namespace"), Some(&"sb-test".to_string()));
    }

    #[test]
    fn test_metadata_to_tags_empty() {
        assert!(metadata_to_tags(&HashMap::new()).is_empty());
    }

    #[tokio::test]
    async fn test_rotation_metadata_records_expiry() {
        let store = AwsSecretsStore::new(Some("us-east-1".into()), "sb-test").await;
        let expires_at = Utc::now() + Duration::days(30);

        let metadata = store.rotation_metadata(expires_at);
        assert_eq!(metadata.get("ExpiresAt"), Some(&expires_at.to_rfc3339()));
        assert_eq!(metadata.get("Namespace"), Some(&"sb-test".to_string()));
        assert_eq!(
            metadata.get("SecretType"),
            Some(&"servicebus-connection-string".to_string())
        );
    }
}
