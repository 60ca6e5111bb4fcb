//! # Steward Store
//!
//! Embedded single-writer state for the assistant backend.
//!
//! ```text
//! Database (SQLite, WAL, foreign keys)
//!   ├── CacheStore          key → JSON, optional TTL, lazy expiry on read
//!   ├── LockManager         resource → (token, expiry), non-blocking acquire
//!   ├── SubscriptionStore   set of followed resource ids
//!   └── scheduled_tasks / task_runs (used by steward-scheduler)
//! ```
//!
//! Nothing sweeps in the background: expired cache entries and locks are
//! cleaned up the next time that key or resource is touched.

pub mod cache;
pub mod db;
pub mod locks;
pub mod subscriptions;

pub use cache::CacheStore;
pub use db::Database;
pub use locks::{Lock, LockManager};
pub use subscriptions::{Subscription, SubscriptionStore};
