//! Subscription membership — which resources (threads, feeds) we follow.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use steward_core::error::Result;

use crate::db::{Database, decode_time, encode_time};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub resource_id: String,
    pub subscribed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionStore {
    db: Database,
}

impl SubscriptionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn is_subscribed(&self, resource_id: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE resource_id = ?1)",
                [resource_id],
                |r| r.get(0),
            )
        })
    }

    /// Subscribe (idempotent). Re-subscribing only refreshes the timestamp.
    pub fn subscribe(&self, resource_id: &str) -> Result<()> {
        let now = encode_time(Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subscriptions (resource_id, subscribed_at) VALUES (?1, ?2)
                 ON CONFLICT(resource_id) DO UPDATE SET subscribed_at = excluded.subscribed_at",
                params![resource_id, now],
            )
        })?;
        tracing::debug!("📌 Subscribed: {resource_id}");
        Ok(())
    }

    /// Unsubscribe (idempotent).
    pub fn unsubscribe(&self, resource_id: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM subscriptions WHERE resource_id = ?1", [resource_id])
        })?;
        Ok(())
    }

    /// All subscriptions, most recent first.
    pub fn list(&self) -> Result<Vec<Subscription>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_id, subscribed_at FROM subscriptions
                 ORDER BY subscribed_at DESC, resource_id",
            )?;
            let rows = stmt.query_map([], |row| {
                let resource_id: String = row.get(0)?;
                let subscribed_at: String = row.get(1)?;
                Ok(Subscription {
                    resource_id,
                    subscribed_at: decode_time(&subscribed_at).unwrap_or_default(),
                })
            })?;
            rows.collect()
        })
    }
}
