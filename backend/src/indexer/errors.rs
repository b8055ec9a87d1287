use thiserror::Error;

/// Error types for chain node access
#[derive(Debug, Error)]
pub(crate) enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("RPC call `{0}` timed out")]
    Timeout(&'static str),

    #[error("Malformed RPC response: {0}")]
    Decode(String),

    #[error("Subscription transport failed: {0}")]
    Transport(String),

    #[error("Subscription closed by the node")]
    Closed,
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Decode(e.to_string())
    }
}

/// Error types for checkpoint and ledger persistence
#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("Checkpoint file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored checkpoint `{0}` is not a block number")]
    Parse(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Failure to apply a log to the ledger
#[derive(Debug, Error)]
pub(crate) enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
