pub mod postgres;
pub mod redis;

use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

/// Key holding a counter's live value on the fast store.
pub fn counter_key(name: &str) -> String {
    format!("counter:{name}")
}

/// Key holding a counter's per-day dedup set on the fast store.
pub fn dau_set_key(name: &str, date: NaiveDate) -> String {
    format!("counter:{name}:users:{}", date.format("%Y%m%d"))
}

/// The fast in-memory counter layer (redis in production).
///
/// Per-key operations are relied upon to be linearizable.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Atomically add `delta` (possibly negative) to `key`, returning the
    /// new value. A missing key starts at 0.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Current value of `key`; a missing key reads as 0.
    async fn get(&self, key: &str) -> Result<i64, StoreError>;

    /// Add `member` to the set at `key`. Returns whether the member was
    /// newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Set an absolute expiry on `key`. Idempotent: re-setting the same
    /// expiry is a no-op.
    async fn set_expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// All members of the set at `key`; a missing key is the empty set.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Lightweight health check, used by the recovery probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// The durable counter store (postgres in production).
///
/// Rows are created lazily on first write; reads of missing counters
/// return 0.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Add `delta` to the stored value, creating the row with `delta` as
    /// its initial value if missing. Returns the new value.
    async fn upsert_counter(&self, name: &str, delta: i64) -> Result<i64, StoreError>;

    /// Overwrite the stored value (administrative reset path).
    async fn set_counter(&self, name: &str, value: i64) -> Result<(), StoreError>;

    /// Current stored value; a missing row reads as 0.
    async fn get_counter(&self, name: &str) -> Result<i64, StoreError>;

    /// Write the end-of-day archive row for `(name, date)`. A second write
    /// for the same pair overwrites, which makes scheduler retries
    /// idempotent.
    async fn upsert_history(
        &self,
        name: &str,
        date: NaiveDate,
        final_value: i64,
        users: &[String],
        metadata: Value,
    ) -> Result<(), StoreError>;

    /// Delete history rows archived before `cutoff`. Returns rows affected.
    async fn delete_history_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError>;
}
