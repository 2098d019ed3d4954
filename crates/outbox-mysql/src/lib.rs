//! MySQL data store.
//!
//! Bootstrap pins a single pool connection, takes a `GET_LOCK` named
//! lock derived from the database and table names, creates the
//! event-store table if it is missing, and releases the lock on every
//! exit path. Named locks are session-scoped, so acquire, table creation,
//! and release all run on that one pinned connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_core::{
    lock, DataStore, DynamicValue, DynamicValues, OutboxError, OutboxMessage, OutboxResult,
    TxCallback, TxExecutor,
};
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::query::Query;
use sqlx::{MySql, MySqlConnection, MySqlPool, Row, Transaction};
use tracing::{debug, info};

/// Default name of the event-store table.
pub const DEFAULT_EVENT_STORE_TABLE: &str = "event_store";

/// How long `GET_LOCK` waits for a competing bootstrap, in seconds.
const LOCK_TIMEOUT_SECS: i32 = 10;

/// MySQL implementation of the data store.
#[derive(Debug)]
pub struct MySqlDataStore {
    pool: MySqlPool,
    database_name: String,
    table: String,
    // only meaningful during bootstrap; the lock never outlives it
    is_locked: bool,
}

impl MySqlDataStore {
    /// Create a store over an existing pool, using the default table name.
    pub async fn with_instance(pool: MySqlPool) -> OutboxResult<Self> {
        Self::with_table(pool, DEFAULT_EVENT_STORE_TABLE).await
    }

    /// Create a store over an existing pool with a custom table name.
    pub async fn with_table(pool: MySqlPool, table: &str) -> OutboxResult<Self> {
        let mut conn = pool.acquire().await.map_err(OutboxError::storage)?;

        let database_name: Option<String> = sqlx::query_scalar("SELECT DATABASE()")
            .fetch_one(&mut *conn)
            .await
            .map_err(OutboxError::storage)?;
        let database_name = database_name.unwrap_or_default();
        if database_name.is_empty() {
            return Err(OutboxError::NoDatabaseName);
        }

        let mut store = Self {
            pool,
            database_name,
            table: table.to_string(),
            is_locked: false,
        };

        store.ensure_table(&mut conn).await?;

        info!(
            database = %store.database_name,
            table = %store.table,
            "mysql data store ready"
        );

        Ok(store)
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn advisory_lock_id(&self) -> String {
        lock::generate(&self.database_name, &[&self.table])
    }

    async fn ensure_table(&mut self, conn: &mut MySqlConnection) -> OutboxResult<()> {
        self.lock(conn).await?;
        let created = self.create_table(conn).await;
        let unlocked = self.unlock(conn).await;
        created?;
        unlocked
    }

    async fn lock(&mut self, conn: &mut MySqlConnection) -> OutboxResult<()> {
        if self.is_locked {
            return Err(OutboxError::Locked);
        }

        // 1 on success, 0 on timeout, NULL on error
        let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
            .bind(self.advisory_lock_id())
            .bind(LOCK_TIMEOUT_SECS)
            .fetch_one(&mut *conn)
            .await
            .map_err(OutboxError::storage)?;

        if acquired != Some(1) {
            return Err(OutboxError::Locked);
        }

        self.is_locked = true;
        Ok(())
    }

    async fn unlock(&mut self, conn: &mut MySqlConnection) -> OutboxResult<()> {
        if !self.is_locked {
            return Ok(());
        }

        sqlx::query("SELECT RELEASE_LOCK(?)")
            .bind(self.advisory_lock_id())
            .execute(&mut *conn)
            .await
            .map_err(OutboxError::storage)?;

        self.is_locked = false;
        Ok(())
    }

    async fn create_table(&self, conn: &mut MySqlConnection) -> OutboxResult<()> {
        let ddl = format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    id BIGINT AUTO_INCREMENT NOT NULL PRIMARY KEY,
    dispatched BOOL NOT NULL DEFAULT FALSE,
    dispatched_at TIMESTAMP NULL,
    payload BLOB NOT NULL,
    options JSON,
    headers JSON
) ENGINE=InnoDB DEFAULT CHARSET=utf8
"#,
            table = self.table
        );

        sqlx::query(&ddl)
            .execute(&mut *conn)
            .await
            .map_err(OutboxError::storage)?;

        debug!(table = %self.table, "event-store table ensured");
        Ok(())
    }
}

#[async_trait]
impl DataStore for MySqlDataStore {
    async fn get_events(&self, batch_size: i32) -> OutboxResult<Vec<OutboxMessage>> {
        let query = format!(
            "SELECT id, dispatched, dispatched_at, payload, options, headers \
             FROM {} WHERE dispatched = false ORDER BY id ASC LIMIT ?",
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
            "INSERT INTO {} (payload, options, headers) VALUES (?, ?, ?)",
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
            let mut execer = MySqlTxExecutor { tx: &mut tx };
            // a callback error drops the transaction, rolling back any
            // statements it already issued
            fn_(&mut execer).await?;
        }

        let query = format!(
            "INSERT INTO {} (payload, options, headers) VALUES (?, ?, ?)",
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
            "UPDATE {} SET dispatched = true, dispatched_at = UTC_TIMESTAMP() WHERE id = ?",
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
            "DELETE FROM {} WHERE dispatched = true AND dispatched_at < ? LIMIT ?",
            self.table
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

struct MySqlTxExecutor<'t, 'c> {
    tx: &'t mut Transaction<'c, MySql>,
}

#[async_trait]
impl TxExecutor for MySqlTxExecutor<'_, '_> {
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
    q: Query<'q, MySql, MySqlArguments>,
    arg: &'q DynamicValue,
) -> Query<'q, MySql, MySqlArguments> {
    match arg {
        DynamicValue::Null => q.bind(Option::<String>::None),
        DynamicValue::Bool(b) => q.bind(*b),
        DynamicValue::Int(i) => q.bind(*i),
        DynamicValue::Float(f) => q.bind(*f),
        DynamicValue::String(s) => q.bind(s.as_str()),
        DynamicValue::Bytes(b) => q.bind(b.as_slice()),
    }
}

fn row_to_message(row: MySqlRow) -> OutboxResult<OutboxMessage> {
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
