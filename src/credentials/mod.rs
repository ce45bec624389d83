//! Credential backends
//!
//! A credential backend owns the live keys of the messaging namespace. The only
//! mutation it offers is "regenerate key slot N for rule R", which invalidates
//! the previous value of that slot the moment it succeeds.

mod credential_backend;
mod service_bus;

pub use credential_backend::{ConnectionString, CredentialBackend, KeySlot};
pub use service_bus::ServiceBusClient;
