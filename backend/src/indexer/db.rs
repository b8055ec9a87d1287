use alloy_primitives::Address;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::time::Duration;

use crate::indexer::errors::StoreError;
use crate::indexer::models::PointsLedgerEntry;
use crate::indexer::types::{DbBlockNumber, DbTaskId, DbTimestamp, DbTxHash};

/// Initialize the SQLite connection pool.
pub(crate) async fn init_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Runs all necessary migrations for the indexer.
pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Canonical text form of an address in the ledger.
pub(crate) fn address_key(address: &Address) -> String {
    format!("{address:#x}")
}

/// Insert-only points ledger.
#[derive(Debug, Clone)]
pub(crate) struct PointsLedger {
    pool: SqlitePool,
}

impl PointsLedger {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Getter for `pool`
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a ledger entry.
    ///
    /// Returns `false` when an entry with the same `(tx_hash, log_index)` already
    /// exists, which counts as success.
    pub(crate) async fn insert_entry(&self, entry: &PointsLedgerEntry) -> Result<bool, StoreError> {
        let block_number = DbBlockNumber::try_from(entry.block_number)
            .map_err(|_| StoreError::Parse(entry.block_number.to_string()))?;
        let log_index = i64::try_from(entry.log_index)
            .map_err(|_| StoreError::Parse(entry.log_index.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO points_ledger
                (address, points, event_kind, block_number, tx_hash, log_index,
                 amount_wei, contract, data_hash, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(address_key(&entry.address))
        .bind(entry.points)
        .bind(entry.event_kind.to_string())
        .bind(block_number)
        .bind(DbTxHash::from(entry.tx_hash))
        .bind(log_index)
        .bind(&entry.amount_wei)
        .bind(address_key(&entry.contract))
        .bind(entry.data_hash.to_vec())
        .bind(DbTimestamp::from(entry.computed_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Total points credited to `address`, 0 when it has no entries.
    pub(crate) async fn sum_points(&self, address: &Address) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(points), 0) FROM points_ledger WHERE address = ?1",
        )
        .bind(address_key(address))
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }
}

/// Get the last processed block for a specific indexer task id, if recorded.
pub(crate) async fn get_indexer_state(
    pool: &SqlitePool,
    task_id: &DbTaskId,
) -> Result<Option<DbBlockNumber>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT last_processed_block
        FROM indexer_state
        WHERE task_id = ?1
        "#,
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
}

/// Record the last processed block for a specific indexer task id.
pub(crate) async fn update_indexer_state(
    pool: &SqlitePool,
    task_id: &DbTaskId,
    last_processed_block: DbBlockNumber,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO indexer_state (task_id, last_processed_block, updated_at)
        VALUES (?1, ?2, CURRENT_TIMESTAMP)
        ON CONFLICT(task_id) DO UPDATE
        SET last_processed_block = excluded.last_processed_block,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(task_id)
    .bind(last_processed_block)
    .execute(pool)
    .await?;
    Ok(())
}

/// In-memory database with migrations applied.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
