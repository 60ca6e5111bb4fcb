//! Token locks — optimistic, non-blocking mutual exclusion per resource.
//!
//! `acquire` either returns a lock or `None` straight away; there is no wait
//! queue, so a resource can be starved by repeated short acquisitions. Callers
//! that need fairness retry with their own backoff. Expiry is passive: stale
//! locks are swept at the next `acquire`.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use steward_core::error::Result;

use crate::db::{Database, millis_to_time, ttl_millis};

/// Proof of ownership for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_id: String,
    /// Opaque token; only its holder can extend or release the lock.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    db: Database,
}

impl LockManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Try to take `resource_id` for `ttl`. Returns `None` if someone else holds it.
    pub fn acquire(&self, resource_id: &str, ttl: Duration) -> Result<Option<Lock>> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));
        let token = uuid::Uuid::new_v4().to_string();

        let inserted = self.db.with_conn(|conn| {
            let swept = conn.execute("DELETE FROM locks WHERE expires_at < ?1", [now])?;
            if swept > 0 {
                tracing::debug!("🧹 Swept {swept} expired lock(s)");
            }
            conn.execute(
                "INSERT OR IGNORE INTO locks (resource_id, token, expires_at) VALUES (?1, ?2, ?3)",
                params![resource_id, token, expires_at],
            )
        })?;

        if inserted == 0 {
            tracing::debug!("🔒 Lock busy: {resource_id}");
            return Ok(None);
        }
        tracing::debug!("🔐 Lock acquired: {resource_id}");
        Ok(Some(Lock {
            resource_id: resource_id.to_string(),
            token,
            expires_at: millis_to_time(expires_at),
        }))
    }

    /// Push the expiry of a held lock to now + `ttl`.
    /// False if the resource is unknown or the token no longer matches.
    pub fn extend(&self, lock: &Lock, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_millis(ttl));
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE locks SET expires_at = ?1 WHERE resource_id = ?2 AND token = ?3",
                params![expires_at, lock.resource_id, lock.token],
            )
        })?;
        Ok(updated == 1)
    }

    /// Release a lock. Stale or foreign tokens are ignored.
    pub fn release(&self, lock: &Lock) -> Result<()> {
        let deleted = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM locks WHERE resource_id = ?1 AND token = ?2",
                params![lock.resource_id, lock.token],
            )
        })?;
        if deleted > 0 {
            tracing::debug!("🔓 Lock released: {}", lock.resource_id);
        }
        Ok(())
    }

    /// Current unexpired holder of `resource_id`, if any.
    pub fn holder(&self, resource_id: &str) -> Result<Option<Lock>> {
        let now = Utc::now().timestamp_millis();
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT token, expires_at FROM locks WHERE resource_id = ?1 AND expires_at >= ?2",
                params![resource_id, now],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
            )
            .optional()
        })?;
        Ok(row.map(|(token, expires_at)| Lock {
            resource_id: resource_id.to_string(),
            token,
            expires_at: millis_to_time(expires_at),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LockManager {
        LockManager::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let locks = manager();
        let first = locks.acquire("thread-1", Duration::from_secs(30)).unwrap();
        assert!(first.is_some());
        assert!(locks.acquire("thread-1", Duration::from_secs(30)).unwrap().is_none());
        // Other resources are independent.
        assert!(locks.acquire("thread-2", Duration::from_secs(30)).unwrap().is_some());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let locks = manager();
        let first = locks
            .acquire("thread-1", Duration::from_millis(50))
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let second = locks
            .acquire("thread-1", Duration::from_millis(50))
            .unwrap()
            .expect("stale lock should be reclaimed");
        assert_ne!(first.token, second.token);
    }

    #[test]
    fn test_release_then_reacquire() {
        let locks = manager();
        let lock = locks.acquire("r", Duration::from_secs(30)).unwrap().unwrap();
        locks.release(&lock).unwrap();
        assert!(locks.acquire("r", Duration::from_secs(30)).unwrap().is_some());
    }

    #[test]
    fn test_release_with_wrong_token_is_noop() {
        let locks = manager();
        let lock = locks.acquire("r", Duration::from_secs(30)).unwrap().unwrap();
        let forged = Lock { token: "forged".into(), ..lock.clone() };
        locks.release(&forged).unwrap();
        assert_eq!(locks.holder("r").unwrap(), Some(lock.clone()));

        // Releasing twice is also silent.
        locks.release(&lock).unwrap();
        locks.release(&lock).unwrap();
        assert!(locks.holder("r").unwrap().is_none());
    }

    #[test]
    fn test_extend_requires_matching_token() {
        let locks = manager();
        let lock = locks.acquire("r", Duration::from_millis(100)).unwrap().unwrap();

        let forged = Lock { token: "forged".into(), ..lock.clone() };
        assert!(!locks.extend(&forged, Duration::from_secs(30)).unwrap());

        let unknown = Lock { resource_id: "other".into(), ..lock.clone() };
        assert!(!locks.extend(&unknown, Duration::from_secs(30)).unwrap());

        assert!(locks.extend(&lock, Duration::from_secs(30)).unwrap());
        let held = locks.holder("r").unwrap().unwrap();
        assert!(held.expires_at > lock.expires_at);
    }

    #[test]
    fn test_extended_lock_outlives_original_ttl() {
        let locks = manager();
        let lock = locks.acquire("r", Duration::from_millis(40)).unwrap().unwrap();
        assert!(locks.extend(&lock, Duration::from_secs(30)).unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert!(locks.acquire("r", Duration::from_secs(1)).unwrap().is_none());
    }

    #[test]
    fn test_extend_after_reclaim_fails() {
        let locks = manager();
        let old = locks.acquire("r", Duration::from_millis(20)).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(40));
        let _new = locks.acquire("r", Duration::from_secs(30)).unwrap().unwrap();
        assert!(!locks.extend(&old, Duration::from_secs(30)).unwrap());
    }
}
