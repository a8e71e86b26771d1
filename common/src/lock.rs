// Per-resource mutual exclusion: in-process and Redis (SET NX EX) implementations

use crate::db::RedisPool;
use crate::errors::StorageError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Lock trait for ensuring exclusive access to a named resource
///
/// Acquisition is try-style: if another holder owns the resource the call fails with
/// `StorageError::LockHeld` instead of waiting for it.
#[async_trait]
pub trait ResourceLock: Send + Sync {
    /// Acquire a lock on the specified resource with a TTL
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, StorageError>;
}

enum Holder {
    Local {
        held: Arc<Mutex<HashSet<String>>>,
    },
    Redis {
        pool: RedisPool,
        lock_value: String,
    },
}

/// Lock guard that releases the lock when dropped
pub struct LockGuard {
    resource: String,
    ttl: Duration,
    holder: Holder,
}

impl LockGuard {
    /// Resource name this guard holds
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.holder {
            Holder::Local { held } => {
                // A poisoned set still holds valid data; release regardless
                let mut held = held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                held.remove(&self.resource);
                debug!(resource = %self.resource, "Local lock released");
            }
            Holder::Redis { pool, lock_value } => {
                // Release the lock asynchronously
                let resource = self.resource.clone();
                let lock_value = lock_value.clone();
                let pool = pool.clone();

                tokio::spawn(async move {
                    if let Err(e) = release_lock(&pool, &resource, &lock_value).await {
                        warn!(
                            resource = %resource,
                            error = %e,
                            "Failed to release lock on drop"
                        );
                    }
                });
            }
        }
    }
}

/// In-process lock for single-node deployments and tests
///
/// The TTL is recorded on the guard but not enforced; the lock is held until the
/// guard is dropped.
#[derive(Clone, Default)]
pub struct LocalLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a resource is currently held
    pub fn is_held(&self, resource: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(resource))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ResourceLock for LocalLock {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, StorageError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| StorageError::LockHeld(format!("{} (lock table poisoned)", resource)))?;

        if !held.insert(resource.to_string()) {
            return Err(StorageError::LockHeld(resource.to_string()));
        }

        debug!(resource = %resource, "Local lock acquired");
        Ok(LockGuard {
            resource: resource.to_string(),
            ttl,
            holder: Holder::Local {
                held: Arc::clone(&self.held),
            },
        })
    }
}

/// Redis lock for multi-process deployments
pub struct RedLock {
    pool: RedisPool,
    retry_count: u32,
    retry_delay: Duration,
}

impl RedLock {
    /// Create a RedLock that tries once; a held lock means another node owns the work
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            retry_count: 1,
            retry_delay: Duration::from_millis(200),
        }
    }

    /// Create a RedLock with custom retry configuration
    pub fn with_retry(pool: RedisPool, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            pool,
            retry_count: retry_count.max(1),
            retry_delay,
        }
    }

    /// Try to acquire the lock once
    async fn try_acquire_once(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<LockGuard, StorageError> {
        let mut conn = self.pool.connection();
        let key = format!("lock:{}", resource);
        let lock_value = Uuid::new_v4().to_string();

        // SET NX EX: set only if absent, with expiration
        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&lock_value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::RedisError(format!("Failed to acquire lock: {}", e)))?;

        if result.is_some() {
            debug!(
                resource = %resource,
                lock_value = %lock_value,
                ttl_seconds = ttl.as_secs(),
                "Lock acquired"
            );

            Ok(LockGuard {
                resource: resource.to_string(),
                ttl,
                holder: Holder::Redis {
                    pool: self.pool.clone(),
                    lock_value,
                },
            })
        } else {
            Err(StorageError::LockHeld(resource.to_string()))
        }
    }
}

#[async_trait]
impl ResourceLock for RedLock {
    #[instrument(skip(self), fields(resource = %resource, ttl_seconds = ?ttl.as_secs()))]
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, StorageError> {
        let mut attempts = 0;

        loop {
            match self.try_acquire_once(resource, ttl).await {
                Ok(guard) => {
                    debug!(
                        resource = %resource,
                        attempts = attempts + 1,
                        "Lock acquired successfully"
                    );
                    return Ok(guard);
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.retry_count {
                        return Err(e);
                    }

                    debug!(
                        resource = %resource,
                        attempt = attempts,
                        retry_delay_ms = self.retry_delay.as_millis(),
                        "Lock acquisition failed, retrying"
                    );

                    sleep(self.retry_delay).await;
                }
            }
        }
    }
}

/// Release a lock by deleting the key if it matches the lock value
async fn release_lock(
    pool: &RedisPool,
    resource: &str,
    lock_value: &str,
) -> Result<(), StorageError> {
    let mut conn = pool.connection();
    let key = format!("lock:{}", resource);

    // Atomic check-and-delete so we only delete a lock we own
    let script = r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
    "#;

    let result: i32 = redis::Script::new(script)
        .key(&key)
        .arg(lock_value)
        .invoke_async(&mut conn)
        .await
        .map_err(|e| StorageError::RedisError(format!("Failed to release lock: {}", e)))?;

    if result == 1 {
        debug!(resource = %resource, "Lock released successfully");
    } else {
        warn!(
            resource = %resource,
            lock_value = %lock_value,
            "Lock was not owned or already expired"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    #[tokio::test]
    async fn test_local_lock_is_exclusive() {
        let lock = LocalLock::new();

        let guard = lock
            .acquire("enrollment:a:bienvenida", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(guard.resource(), "enrollment:a:bienvenida");
        assert!(lock.is_held("enrollment:a:bienvenida"));

        let second = lock
            .acquire("enrollment:a:bienvenida", Duration::from_secs(10))
            .await;
        assert!(matches!(second, Err(StorageError::LockHeld(_))));

        // Unrelated resources are not blocked
        let other = lock
            .acquire("enrollment:b:bienvenida", Duration::from_secs(10))
            .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_local_lock_released_on_drop() {
        let lock = LocalLock::new();
        {
            let _guard = lock
                .acquire("resource", Duration::from_secs(10))
                .await
                .unwrap();
        }
        assert!(!lock.is_held("resource"));
        assert!(lock.acquire("resource", Duration::from_secs(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_guard_reports_ttl() {
        let lock = LocalLock::new();
        let guard = lock
            .acquire("resource", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(guard.ttl(), Duration::from_secs(300));
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redlock_exclusivity() {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
        };
        let pool = RedisPool::new(&config).await.unwrap();
        let lock1 = RedLock::new(pool.clone());
        let lock2 = RedLock::with_retry(pool, 1, Duration::from_millis(10));

        let _guard1 = lock1
            .acquire("exclusive_resource", Duration::from_secs(10))
            .await
            .unwrap();

        let result = lock2
            .acquire("exclusive_resource", Duration::from_secs(10))
            .await;
        assert!(matches!(result, Err(StorageError::LockHeld(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redlock_auto_release_on_drop() {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
        };
        let pool = RedisPool::new(&config).await.unwrap();
        let lock = RedLock::new(pool.clone());

        {
            let _guard = lock
                .acquire("auto_release_resource", Duration::from_secs(10))
                .await
                .unwrap();
        }

        // Give some time for async drop to complete
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _guard2 = RedLock::new(pool)
            .acquire("auto_release_resource", Duration::from_secs(10))
            .await
            .unwrap();
    }
}
