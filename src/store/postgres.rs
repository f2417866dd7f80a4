use super::DurableStore;
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::NaiveDate;
use deadpool_postgres::{Config, Pool, Runtime};
use serde_json::Value;
use tokio_postgres::NoTls;
use tracing::info;

/// [`DurableStore`] backed by postgres through a deadpool connection pool.
///
/// Expected schema:
///
/// ```sql
/// CREATE TABLE counters (
///     name        TEXT PRIMARY KEY,
///     value       BIGINT NOT NULL DEFAULT 0,
///     updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
///
/// CREATE TABLE counter_history (
///     name         TEXT NOT NULL,
///     archive_date DATE NOT NULL,
///     final_value  BIGINT NOT NULL,
///     users        JSONB NOT NULL DEFAULT '[]',
///     metadata     JSONB NOT NULL DEFAULT '{}',
///     archived_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     PRIMARY KEY (name, archive_date)
/// );
/// ```
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let mut cfg = Config::new();
        cfg.url = Some(database_url.to_string());
        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        info!("durable store connection pool created");
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, StoreError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl DurableStore for PostgresStore {
    async fn upsert_counter(&self, name: &str, delta: i64) -> Result<i64, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                r#"
                INSERT INTO counters (name, value, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (name)
                DO UPDATE SET
                    value = counters.value + EXCLUDED.value,
                    updated_at = NOW()
                RETURNING value
                "#,
                &[&name, &delta],
            )
            .await?;
        Ok(row.get("value"))
    }

    async fn set_counter(&self, name: &str, value: i64) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .execute(
                r#"
                INSERT INTO counters (name, value, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (name)
                DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                "#,
                &[&name, &value],
            )
            .await?;
        Ok(())
    }

    async fn get_counter(&self, name: &str) -> Result<i64, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT value FROM counters WHERE name = $1", &[&name])
            .await?;
        Ok(row.map(|r| r.get::<_, i64>("value")).unwrap_or(0))
    }

    async fn upsert_history(
        &self,
        name: &str,
        date: NaiveDate,
        final_value: i64,
        users: &[String],
        metadata: Value,
    ) -> Result<(), StoreError> {
        let client = self.client().await?;
        let users_json = Value::from(users.to_vec());
        client
            .execute(
                r#"
                INSERT INTO counter_history
                    (name, archive_date, final_value, users, metadata, archived_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (name, archive_date)
                DO UPDATE SET
                    final_value = EXCLUDED.final_value,
                    users = EXCLUDED.users,
                    metadata = EXCLUDED.metadata,
                    archived_at = NOW()
                "#,
                &[&name, &date, &final_value, &users_json, &metadata],
            )
            .await?;
        Ok(())
    }

    async fn delete_history_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let client = self.client().await?;
        let affected = client
            .execute(
                "DELETE FROM counter_history WHERE archive_date < $1",
                &[&cutoff],
            )
            .await?;
        Ok(affected)
    }
}
