//! Per-rule rotation leases.
//!
//! A lease has an owner token and an expiry. Expired leases can be taken over
//! by the next `acquire`, so a crashed holder never needs a manual unlock.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::LockError;

/// Owner token handed out by [`RotationLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutual exclusion scoped to one authorization rule.
#[async_trait::async_trait]
pub trait RotationLock: Send + Sync {
    /// Take the lease for `rule`, failing with [`LockError::AlreadyLocked`]
    /// while an unexpired lease exists.
    async fn acquire(&self, rule: &str, ttl: Duration) -> Result<LockToken, LockError>;

    /// Give the lease back. Only the current holder may release.
    async fn release(&self, rule: &str, token: &LockToken) -> Result<(), LockError>;

    /// Push the expiry of a held, unexpired lease out to `now + ttl`.
    async fn refresh(&self, rule: &str, token: &LockToken, ttl: Duration) -> Result<(), LockError>;
}

#[derive(Debug)]
struct Lease {
    token: LockToken,
    expires_at: Instant,
}

/// In-process lease table.
#[derive(Default)]
pub struct InMemoryRotationLock {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryRotationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `rule` currently has an unexpired lease.
    pub async fn is_held(&self, rule: &str) -> bool {
        let leases = self.leases.lock().await;
        leases
            .get(rule)
            .map(|lease| lease.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl RotationLock for InMemoryRotationLock {
    async fn acquire(&self, rule: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        if let Some(existing) = leases.get(rule) {
            if existing.expires_at > now {
                return Err(LockError::AlreadyLocked {
                    rule: rule.to_string(),
                });
            }
            debug!(rule, previous = %existing.token, "taking over expired rotation lease");
        }

        let token = LockToken::new();
        leases.insert(
            rule.to_string(),
            Lease {
                token,
                expires_at: now + ttl,
            },
        );
        debug!(rule, %token, ?ttl, "acquired rotation lease");
        Ok(token)
    }

    async fn release(&self, rule: &str, token: &LockToken) -> Result<(), LockError> {
        let mut leases = self.leases.lock().await;
        match leases.get(rule) {
            Some(lease) if lease.token == *token => {
                leases.remove(rule);
                debug!(rule, %token, "released rotation lease");
                Ok(())
            }
            _ => Err(LockError::StaleToken {
                rule: rule.to_string(),
            }),
        }
    }

    async fn refresh(&self, rule: &str, token: &LockToken, ttl: Duration) -> Result<(), LockError> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get_mut(rule) {
            Some(lease) if lease.token == *token && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(())
            }
            Some(lease) if lease.token == *token => Err(LockError::LeaseLost {
                rule: rule.to_string(),
            }),
            _ => Err(LockError::StaleToken {
                rule: rule.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_second_acquire_is_rejected() {
        let lock = InMemoryRotationLock::new();
        lock.acquire("FunctionAppAccess", TTL).await.unwrap();

        let err = lock.acquire("FunctionAppAccess", TTL).await.unwrap_err();
        assert_eq!(
            err,
            LockError::AlreadyLocked {
                rule: "FunctionAppAccess".into()
            }
        );
    }

    #[tokio::test]
    async fn test_leases_are_scoped_per_rule() {
        let lock = InMemoryRotationLock::new();
        lock.acquire("FunctionAppAccess", TTL).await.unwrap();
        assert!(lock.acquire("ReadOnlyAccess", TTL).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let lock = InMemoryRotationLock::new();
        let token = lock.acquire("r", TTL).await.unwrap();
        lock.release("r", &token).await.unwrap();
        assert!(!lock.is_held("r").await);
        assert!(lock.acquire("r", TTL).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_with_foreign_token_does_not_unlock() {
        let lock = InMemoryRotationLock::new();
        lock.acquire("r", TTL).await.unwrap();

        let err = lock.release("r", &LockToken::new()).await.unwrap_err();
        assert!(matches!(err, LockError::StaleToken { .. }));
        assert!(lock.is_held("r").await);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let lock = InMemoryRotationLock::new();
        let stale = lock.acquire("r", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fresh = lock.acquire("r", TTL).await.unwrap();
        assert_ne!(stale, fresh);

        // The crashed holder can neither refresh nor release the new lease.
        assert!(lock.refresh("r", &stale, TTL).await.is_err());
        assert!(lock.release("r", &stale).await.is_err());
        assert!(lock.is_held("r").await);
    }

    #[tokio::test]
    async fn test_refresh_extends_lease() {
        let lock = InMemoryRotationLock::new();
        let token = lock.acquire("r", Duration::from_millis(40)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.refresh("r", &token, Duration::from_millis(200)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(lock.is_held("r").await);
        assert!(lock.acquire("r", TTL).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_after_expiry_reports_lost_lease() {
        let lock = InMemoryRotationLock::new();
        let token = lock.acquire("r", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = lock.refresh("r", &token, TTL).await.unwrap_err();
        assert_eq!(err, LockError::LeaseLost { rule: "r".into() });
    }
}
