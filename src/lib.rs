//! Service Bus Key Rotator Library
//!
//! Rotates Azure Service Bus authorization rule keys on a schedule and keeps
//! the connection strings in a secret store in step with the live keys.

pub mod audit;
pub mod auth;
pub mod backends;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod lock;
pub mod rotation;
pub mod scheduler;
pub mod server;

pub use backends::SecretStore;
pub use config::{AuthorizationRuleSpec, Config};
pub use credentials::{ConnectionString, CredentialBackend, KeySlot};
pub use error::{ApiError, ClientError, LockError};
pub use rotation::{Orchestrator, RotationRun, RotationSettings, TriggerSource};
