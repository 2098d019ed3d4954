//! Postgres data store.
//!
//! Bootstrap pins a single pool connection, takes a `pg_advisory_lock`
//! derived from the database and schema names, creates the event-store
//! table and its indexes if they are missing, and releases the lock on
//! every exit path. Advisory locks are session-scoped, so acquire, table
//! creation, and release all run on that one pinned connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_core::{
    lock, DataStore, DynamicValue, DynamicValues, OutboxError, OutboxMessage, OutboxResult,
    TxCallback, TxExecutor,
};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Row, Transaction};
use tracing::{debug, info};

/// Default name of the event-store table.
pub const DEFAULT_EVENT_STORE_TABLE: &str = "event_store";

/// Postgres implementation of the data store.
#[derive(Debug)]
pub struct PostgresDataStore {
    pool: PgPool,
    database_name: String,
    schema_name: String,
    table: String,
    // only meaningful during bootstrap; the lock never outlives it
    is_locked: bool,
}

impl PostgresDataStore {
    /// Create a store over an existing pool, using the default table name.
    pub async fn with_instance(pool: PgPool) -> OutboxResult<Self> {
        Self::with_table(pool, DEFAULT_EVENT_STORE_TABLE).await
    }

    /// Create a store over an existing pool with a custom table name.
    pub async fn with_table(pool: PgPool, table: &str) -> OutboxResult<Self> {
        let mut conn = pool.acquire().await.map_err(OutboxError::storage)?;

        let database_name: Option<String> = sqlx::query_scalar("SELECT CURRENT_DATABASE()::text")
            .fetch_one(&mut *conn)
            .await
            .map_err(OutboxError::storage)?;
        let database_name = database_name.unwrap_or_default();
        if database_name.is_empty() {
            return Err(OutboxError::NoDatabaseName);
        }

        let schema_name: Option<String> = sqlx::query_scalar("SELECT CURRENT_SCHEMA()::text")
            .fetch_one(&mut *conn)
            .await
            .map_err(OutboxError::storage)?;
        let schema_name = schema_name.unwrap_or_default();
        if schema_name.is_empty() {
            return Err(OutboxError::NoSchema);
        }

        let mut store = Self {
            pool,
            database_name,
            schema_name,
            table: table.to_string(),
            is_locked: false,
        };

        store.ensure_table(&mut conn).await?;

        info!(
            database = %store.database_name,
            schema = %store.schema_name,
            table = %store.table,
            "postgres data store ready"
        );

        Ok(store)
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn advisory_lock_id(&self) -> i64 {
        i64::from(lock::generate_id(&self.database_name, &[&self.schema_name]))
    }

    async fn ensure_table(&mut self, conn: &mut PgConnection) -> OutboxResult<()> {
        self.lock(conn).await?;
        let created = self.create_table(conn).await;
        let unlocked = self.unlock(conn).await;
        created?;
        unlocked
    }

    async fn lock(&mut self, conn: &mut PgConnection) -> OutboxResult<()> {
        if self.is_locked {
            return Err(OutboxError::Locked);
        }

        // blocks until the lock is granted to this session
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(self.advisory_lock_id())
            .execute(&mut *conn)
            .await
            .map_err(OutboxError::storage)?;

        self.is_locked = true;
        Ok(())
    }

    async fn unlock(&mut self, conn: &mut PgConnection) -> OutboxResult<()> {
        if !self.is_locked {
            return Ok(());
        }

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.advisory_lock_id())
            .execute(&mut *conn)
            .await
            .map_err(OutboxError::storage)?;

        self.is_locked = false;
        Ok(())
    }

    async fn create_table(&self, conn: &mut PgConnection) -> OutboxResult<()> {
        let ddl = format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    id BIGSERIAL NOT NULL PRIMARY KEY,
    dispatched BOOLEAN NOT NULL DEFAULT FALSE,
    dispatched_at TIMESTAMPTZ,
    payload BYTEA NOT NULL,
    options JSONB,
    headers JSONB
);

CREATE INDEX IF NOT EXISTS "index_{table}_dispatched" ON {table} USING btree (dispatched ASC NULLS LAST);
CREATE INDEX IF NOT EXISTS "index_{table}_dispatched_at" ON {table} USING btree (dispatched_at ASC NULLS LAST);
"#,
            table = self.table
        );

        sqlx::raw_sql(&ddl)
            .execute(&mut *conn)
            .await
            .map_err(OutboxError::storage)?;

        debug!(table = %self.table, "event-store table ensured");
        Ok(())
    }
}

#[async_trait]
impl DataStore for PostgresDataStore {
    async fn get_events(&self, batch_size: i32) -> OutboxResult<Vec<OutboxMessage>> {
        let query = format!(
            "SELECT id, dispatched, dispatched_at, payload, options, headers \
             FROM {} WHERE dispatched = false ORDER BY id ASC LIMIT $1",
            self.table
        );

        let rows = sqlx::query(&query)
            .bind(i64::from(batch_size))
            .fetch_all(&self.pool)
            .await
            .map_err(OutboxError::storage)?;

        rows.into_iter().map(row_to_message).collect()
    }

    async fn add(&self, msg: OutboxMessage) -> OutboxResult<()> {
        let query = format!(
            "INSERT INTO {} (payload, options, headers) VALUES ($1, $2, $3)",
            self.table
        );

        sqlx::query(&query)
            .bind(&msg.payload)
            .bind(msg.options.to_json()?)
            .bind(msg.headers.to_json()?)
            .execute(&self.pool)
            .await
            .map_err(OutboxError::storage)?;

        Ok(())
    }

    async fn add_within_tx(&self, msg: OutboxMessage, fn_: TxCallback) -> OutboxResult<()> {
        let mut tx = self.pool.begin().await.map_err(OutboxError::storage)?;

        {
            let mut execer = PgTxExecutor { tx: &mut tx };
            // a callback error drops the transaction, rolling back any
            // statements it already issued
            fn_(&mut execer).await?;
        }

        let query = format!(
            "INSERT INTO {} (payload, options, headers) VALUES ($1, $2, $3)",
            self.table
        );

        sqlx::query(&query)
            .bind(&msg.payload)
            .bind(msg.options.to_json()?)
            .bind(msg.headers.to_json()?)
            .execute(&mut *tx)
            .await
            .map_err(OutboxError::storage)?;

        tx.commit().await.map_err(OutboxError::storage)?;
        Ok(())
    }

    async fn set_as_dispatched(&self, id: i64) -> OutboxResult<()> {
        let query = format!(
            "UPDATE {} SET dispatched = true, dispatched_at = now() WHERE id = $1",
            self.table
        );

        sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(OutboxError::storage)?;

        Ok(())
    }

    async fn remove(&self, dispatched_before: DateTime<Utc>, batch_size: i32) -> OutboxResult<()> {
        let query = format!(
            r#"
DELETE FROM {table}
WHERE ctid IN (
    SELECT ctid FROM {table}
    WHERE dispatched = true AND dispatched_at < $1
    LIMIT $2
)
"#,
            table = self.table
        );

        sqlx::query(&query)
            .bind(dispatched_before)
            .bind(i64::from(batch_size))
            .execute(&self.pool)
            .await
            .map_err(OutboxError::storage)?;

        Ok(())
    }

    async fn close(&self) -> OutboxResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

struct PgTxExecutor<'t, 'c> {
    tx: &'t mut Transaction<'c, sqlx::Postgres>,
}

#[async_trait]
impl TxExecutor for PgTxExecutor<'_, '_> {
    async fn execute(&mut self, query: &str, args: &[DynamicValue]) -> OutboxResult<u64> {
        let mut q = sqlx::query(query);
        for arg in args {
            q = bind_value(q, arg);
        }

        let result = q
            .execute(&mut **self.tx)
            .await
            .map_err(OutboxError::storage)?;

        Ok(result.rows_affected())
    }
}

fn bind_value<'q>(
    q: Query<'q, sqlx::Postgres, PgArguments>,
    arg: &'q DynamicValue,
) -> Query<'q, sqlx::Postgres, PgArguments> {
    match arg {
        DynamicValue::Null => q.bind(Option::<String>::None),
        DynamicValue::Bool(b) => q.bind(*b),
        DynamicValue::Int(i) => q.bind(*i),
        DynamicValue::Float(f) => q.bind(*f),
        DynamicValue::String(s) => q.bind(s.as_str()),
        DynamicValue::Bytes(b) => q.bind(b.as_slice()),
    }
}

fn row_to_message(row: PgRow) -> OutboxResult<OutboxMessage> {
    let options: Option<serde_json::Value> = row.try_get("options").map_err(OutboxError::storage)?;
    let headers: Option<serde_json::Value> = row.try_get("headers").map_err(OutboxError::storage)?;

    Ok(OutboxMessage {
        id: row.try_get("id").map_err(OutboxError::storage)?,
        dispatched: row.try_get("dispatched").map_err(OutboxError::storage)?,
        dispatched_at: row.try_get("dispatched_at").map_err(OutboxError::storage)?,
        payload: row.try_get("payload").map_err(OutboxError::storage)?,
        options: DynamicValues::from_json(options)?,
        headers: DynamicValues::from_json(headers)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    async fn connect() -> PgPool {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must point at a Postgres instance");
        PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("connect to Postgres")
    }

    async fn fresh_store(pool: &PgPool, table: &str) -> PostgresDataStore {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(pool)
            .await
            .expect("drop table");

        PostgresDataStore::with_table(pool.clone(), table)
            .await
            .expect("bootstrap store")
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres (set DATABASE_URL)"]
    async fn bootstraps_and_round_trips_a_message() {
        let pool = connect().await;
        let store = fresh_store(&pool, "outbox_pg_roundtrip").await;

        let msg = OutboxMessage::new(b"pg payload".to_vec())
            .with_option("topic", "orders")
            .with_header("trace-id", "abc");
        store.add(msg).await.unwrap();

        let events = store.get_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, b"pg payload");
        assert_eq!(events[0].options.opt_str("topic").unwrap(), Some("orders"));
        assert_eq!(events[0].headers.opt_str("trace-id").unwrap(), Some("abc"));
        assert!(!events[0].dispatched);

        store.set_as_dispatched(events[0].id).await.unwrap();
        assert!(store.get_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres (set DATABASE_URL)"]
    async fn a_failing_callback_rolls_back_the_insert() {
        let pool = connect().await;
        let store = fresh_store(&pool, "outbox_pg_rollback").await;

        let result = store
            .add_within_tx(
                OutboxMessage::new(b"never stored".to_vec()),
                Box::new(|tx: &mut dyn TxExecutor| {
                    Box::pin(async move {
                        tx.execute("SELECT 1", &[]).await?;
                        Err::<(), _>(OutboxError::Storage("business failure".into()))
                    })
                }),
            )
            .await;

        assert!(result.is_err());
        assert!(store.get_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres (set DATABASE_URL)"]
    async fn marking_twice_is_harmless() {
        let pool = connect().await;
        let store = fresh_store(&pool, "outbox_pg_idempotent").await;

        store
            .add(OutboxMessage::new(b"once".to_vec()))
            .await
            .unwrap();
        let id = store.get_events(1).await.unwrap()[0].id;

        store.set_as_dispatched(id).await.unwrap();
        store.set_as_dispatched(id).await.unwrap();
        assert!(store.get_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres (set DATABASE_URL)"]
    async fn remove_purges_only_old_dispatched_rows() {
        let pool = connect().await;
        let store = fresh_store(&pool, "outbox_pg_remove").await;

        store.add(OutboxMessage::new(b"old".to_vec())).await.unwrap();
        store
            .add(OutboxMessage::new(b"pending".to_vec()))
            .await
            .unwrap();

        let events = store.get_events(10).await.unwrap();
        store.set_as_dispatched(events[0].id).await.unwrap();

        // the dispatched row is now, the cutoff is in the future: purged
        store
            .remove(Utc::now() + chrono::Duration::hours(1), 100)
            .await
            .unwrap();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_pg_remove")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
        assert_eq!(store.get_events(10).await.unwrap().len(), 1);
    }
}
