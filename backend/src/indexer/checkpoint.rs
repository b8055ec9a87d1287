//! Persistence of the last fully processed block height.
//!
//! The checkpoint is a single integer. On restart the engine resumes from it,
//! re-scanning at most the block it names; ledger inserts are idempotent so
//! the overlap is harmless.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};

use crate::indexer::db::{get_indexer_state, update_indexer_state};
use crate::indexer::errors::StoreError;
use crate::indexer::types::{DbBlockNumber, DbTaskId, IndexerTaskId};

/// Load/save of the ingestion high-water mark.
#[async_trait]
pub(crate) trait CheckpointStore: Send + Sync {
    /// Last recorded block height, 0 when nothing has been recorded.
    async fn load(&self) -> Result<u64, StoreError>;

    /// Durably record `block_number`.
    async fn save(&self, block_number: u64) -> Result<(), StoreError>;
}

/// Checkpoint kept as a decimal integer in a plain text file.
#[derive(Debug, Clone)]
pub(crate) struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Getter for `path`
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<u64, StoreError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let trimmed = contents.trim();
        trimmed
            .parse::<u64>()
            .map_err(|_| StoreError::Parse(trimmed.to_string()))
    }

    async fn save(&self, block_number: u64) -> Result<(), StoreError> {
        let tmp = self.tmp_path();

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(format!("{block_number}\n").as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        // rename is atomic on the same filesystem
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Checkpoint kept as a row of the `indexer_state` table.
#[derive(Debug, Clone)]
pub(crate) struct SqliteCheckpointStore {
    pool: SqlitePool,
    task_id: DbTaskId,
}

impl SqliteCheckpointStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            task_id: DbTaskId::from(IndexerTaskId::PointsIngestion),
        }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self) -> Result<u64, StoreError> {
        match get_indexer_state(&self.pool, &self.task_id).await? {
            Some(block) => {
                u64::try_from(block).map_err(|_| StoreError::Parse((*block).to_string()))
            }
            None => Ok(0),
        }
    }

    async fn save(&self, block_number: u64) -> Result<(), StoreError> {
        let block = DbBlockNumber::try_from(block_number)
            .map_err(|_| StoreError::Parse(block_number.to_string()))?;
        update_indexer_state(&self.pool, &self.task_id, block).await?;
        Ok(())
    }
}

/// In-memory store that records every saved value.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryCheckpointStore {
    history: std::sync::Mutex<Vec<u64>>,
}

#[cfg(test)]
impl MemoryCheckpointStore {
    pub(crate) fn history(&self) -> Vec<u64> {
        self.history.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<u64, StoreError> {
        Ok(self.history.lock().unwrap().last().copied().unwrap_or(0))
    }

    async fn save(&self, block_number: u64) -> Result<(), StoreError> {
        self.history.lock().unwrap().push(block_number);
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<T> {
    async fn load(&self) -> Result<u64, StoreError> {
        (**self).load().await
    }

    async fn save(&self, block_number: u64) -> Result<(), StoreError> {
        (**self).save(block_number).await
    }
}
