use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ClientError;

/// One of the two fixed key slots on an authorization rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySlot {
    Primary,
    Secondary,
}

impl KeySlot {
    /// Value of `keyType` in the ARM `regenerateKeys` request.
    pub fn key_type(&self) -> &'static str {
        match self {
            KeySlot::Primary => "PrimaryKey",
            KeySlot::Secondary => "SecondaryKey",
        }
    }
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySlot::Primary => write!(f, "primary"),
            KeySlot::Secondary => write!(f, "secondary"),
        }
    }
}

/// A connection string carrying freshly generated key material.
///
/// `Debug` never prints the value; use [`ConnectionString::expose`] at the
/// points that must hand it on (secret writes, audit recovery records).
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString(String);

impl ConnectionString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `SharedAccessKey=` component, if present.
    pub fn shared_access_key(&self) -> Option<&str> {
        self.0
            .split(';')
            .find_map(|part| part.trim().strip_prefix("SharedAccessKey="))
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("length", &self.0.len())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Trait for key-regenerating backends (Azure Service Bus namespaces).
#[async_trait::async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Regenerate one key slot of an authorization rule and return the new
    /// connection string. This is the only copy of the new credential.
    async fn regenerate_key(
        &self,
        rule_name: &str,
        slot: KeySlot,
    ) -> Result<ConnectionString, ClientError>;

    /// Lightweight read used by health checks. Never mutates anything.
    async fn probe(&self) -> Result<(), ClientError>;

    /// Get the backend type name for display purposes
    fn backend_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_access_key_extraction() {
        let conn = ConnectionString::new(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=ReadOnlyAccess;SharedAccessKey=abc123=",
        );
        assert_eq!(conn.shared_access_key(), Some("abc123="));
        assert_eq!(ConnectionString::new("Endpoint=sb://x/").shared_access_key(), None);
    }

    #[test]
    fn test_debug_is_redacted() {
        let conn = ConnectionString::new("SharedAccessKey=very-secret");
        let rendered = format!("{:?}", conn);
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_key_type() {
        assert_eq!(KeySlot::Primary.key_type(), "PrimaryKey");
        assert_eq!(KeySlot::Secondary.key_type(), "SecondaryKey");
        assert_eq!(KeySlot::Secondary.to_string(), "secondary");
    }
}
