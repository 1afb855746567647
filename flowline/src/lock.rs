use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{FlowError, Result};
use crate::telemetry;

/// Proof of ownership for an acquired lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A held lock. Releasing requires the same key and token.
#[derive(Clone, Debug)]
pub struct LockHandle {
    pub key: String,
    pub token: LockToken,
    pub ttl: Duration,
    acquired_at: Instant,
}

impl LockHandle {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            token: LockToken::new(),
            ttl,
            acquired_at: Instant::now(),
        }
    }

    /// The lock has outlived its TTL and may already belong to someone else.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }
}

/// Mutual exclusion with a TTL, scoped by key.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Single acquisition attempt. `Ok(None)` means the key is held.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>>;

    /// Release a lock. A handle whose lock already expired is a no-op.
    async fn release(&self, handle: &LockHandle) -> Result<()>;

    /// Acquire `key`, retrying per `config`, or fail with
    /// [`FlowError::LockTimeout`].
    async fn acquire(&self, key: &str, config: &LockConfig) -> Result<LockHandle> {
        let started = Instant::now();
        let ttl = config.ttl();
        for attempt in 0..=config.retry_count {
            if let Some(handle) = self.try_acquire(key, ttl).await? {
                debug!(key = %key, attempt, "lock acquired");
                return Ok(handle);
            }
            if attempt < config.retry_count {
                tokio::time::sleep(config.retry_delay()).await;
            }
        }
        Err(FlowError::LockTimeout {
            key: key.to_string(),
            waited: started.elapsed(),
        })
    }
}

/// Run `f` while holding `key`.
///
/// On acquisition failure `f` is not run and the lock timeout is returned.
/// A failed release is logged; the TTL bounds how long the key stays held.
pub async fn with_lock<P, F, Fut, T>(provider: &P, key: &str, config: &LockConfig, f: F) -> Result<T>
where
    P: LockProvider + ?Sized,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
{
    let span = telemetry::lock_span(key);
    let handle = provider.acquire(key, config).instrument(span.clone()).await?;
    let result = f().instrument(span).await;

    if handle.is_expired() {
        warn!(key = %key, ttl_ms = handle.ttl.as_millis() as u64, "lock expired before release");
    }
    if let Err(err) = provider.release(&handle).await {
        warn!(key = %key, error = %err, "failed to release lock");
    }
    result
}

/// Process-local lock table.
#[derive(Clone, Default)]
pub struct InMemoryLockProvider {
    held: Arc<Mutex<HashMap<String, (LockToken, Instant)>>>,
}

impl std::fmt::Debug for InMemoryLockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLockProvider")
            .field("held", &self.held.lock().len())
            .finish()
    }
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by anyone.
    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let now = Instant::now();
        let expiry = now
            .checked_add(ttl)
            .ok_or_else(|| FlowError::Configuration(format!("lock ttl {ttl:?} is out of range")))?;
        let mut held = self.held.lock();
        if let Some((_, expires_at)) = held.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let handle = LockHandle::new(key, ttl);
        held.insert(key.to_string(), (handle.token, expiry));
        Ok(Some(handle))
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut held = self.held.lock();
        if held.get(&handle.key).is_some_and(|(token, _)| *token == handle.token) {
            held.remove(&handle.key);
        }
        Ok(())
    }
}
