//! TTL cache — JSON values keyed by string, expired lazily on read.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use steward_core::error::{Result, StewardError};

use crate::db::{Database, ttl_millis};

/// Key/value cache backed by the `cache` table.
#[derive(Debug, Clone)]
pub struct CacheStore {
    db: Database,
}

impl CacheStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch and deserialize a value. An expired entry is deleted and reported absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let now = Utc::now().timestamp_millis();
        let raw = self.db.with_conn(|conn| {
            let row: Option<(String, Option<i64>)> = conn
                .query_row(
                    "SELECT value, expires_at FROM cache WHERE key = ?1",
                    [key],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            match row {
                Some((_, Some(expires_at))) if now > expires_at => {
                    conn.execute(
                        "DELETE FROM cache WHERE key = ?1 AND expires_at = ?2",
                        params![key, expires_at],
                    )?;
                    tracing::debug!("🗑️ Cache entry expired: {key}");
                    Ok(None)
                }
                Some((value, _)) => Ok(Some(value)),
                None => Ok(None),
            }
        })?;

        raw.map(|value| {
            serde_json::from_str(&value)
                .map_err(|e| StewardError::Storage(format!("Cache decode '{key}': {e}")))
        })
        .transpose()
    }

    /// Store a value, replacing any existing entry. `None` TTL never expires.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| StewardError::validation(format!("Cache encode '{key}': {e}")))?;
        let expires_at =
            ttl.map(|ttl| Utc::now().timestamp_millis().saturating_add(ttl_millis(ttl)));
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, json, expires_at],
            )
        })?;
        tracing::debug!("💾 Cache set: {key} (ttl: {:?})", ttl);
        Ok(())
    }

    /// Remove an entry. Missing keys are fine.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.db
            .with_conn(|conn| conn.execute("DELETE FROM cache WHERE key = ?1", [key]))?;
        Ok(())
    }
}
