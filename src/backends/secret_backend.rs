use chrono::{DateTime, Utc};

use crate::error::ClientError;

/// Trait for secret stores (Azure Key Vault, AWS Secrets Manager, etc.)
///
/// Stores never retry. The orchestrator owns retry policy because it knows
/// whether a backend-side mutation has already happened.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Make `value` the current version of `name`, expiring at `expires_at`.
    async fn write_secret(
        &self,
        name: &str,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ClientError>;

    /// Read the current version of `name`.
    async fn read_secret(&self, name: &str) -> Result<String, ClientError>;

    /// Lightweight read used by health checks. Never mutates anything.
    async fn probe(&self) -> Result<(), ClientError>;

    /// Get the store type name for display purposes
    fn store_type(&self) -> &'static str;
}

/// Reject writes that no store should accept.
pub fn validate_write(name: &str, value: &str, expires_at: DateTime<Utc>) -> Result<(), ClientError> {
    if name.is_empty() {
        return Err(ClientError::Invalid("secret name must not be empty".into()));
    }
    if value.is_empty() {
        return Err(ClientError::Invalid(format!(
            "refusing to write an empty value to secret '{}'",
            name
        )));
    }
    if expires_at <= Utc::now() {
        return Err(ClientError::Invalid(format!(
            "expiration {} for secret '{}' is not in the future",
            expires_at.to_rfc3339(),
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_validate_write() {
        let future = Utc::now() + Duration::days(30);
        assert!(validate_write("a", "v", future).is_ok());
        assert!(matches!(validate_write("a", "", future), Err(ClientError::Invalid(_))));
        assert!(matches!(validate_write("", "v", future), Err(ClientError::Invalid(_))));

        let past = Utc::now() - Duration::seconds(1);
        assert!(matches!(validate_write("a", "v", past), Err(ClientError::Invalid(_))));
    }
}
