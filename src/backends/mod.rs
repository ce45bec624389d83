//! Secret store implementations
//!
//! This module provides the secret store abstraction the rotated connection
//! strings are propagated into, and its implementations.

mod aws_secrets;
mod key_vault;
mod secret_backend;

pub use aws_secrets::AwsSecretsStore;
pub use key_vault::KeyVaultClient;
pub use secret_backend::{validate_write, SecretStore};

/// Secret store selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    KeyVault,
    Aws,
}

impl std::str::FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "key_vault" | "keyvault" | "azure" => Ok(StoreKind::KeyVault),
            "aws" => Ok(StoreKind::Aws),
            _ => Err(format!("Unknown secret store: {}. Supported: key_vault, aws", s)),
        }
    }
}
