//! Chain node access: historical log scans, live log subscriptions and block timestamps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonrpsee::{core::client::SubscriptionClientT, rpc_params, ws_client::WsClientBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::indexer::errors::SourceError;
use crate::indexer::types::{from_hex_u64, parse_hex_u64, LogFilter, RawLogRecord};
use crate::utils::rpc_client::create_http_client;

/// Buffered logs between the subscription task and the engine
const LOG_CHANNEL_CAPACITY: usize = 512;

/// Live log feed.
///
/// `errors` yields once when the underlying transport fails; the subscription
/// must then be dropped and re-established.
#[derive(Debug)]
pub(crate) struct Subscription {
    pub(crate) logs: mpsc::Receiver<RawLogRecord>,
    pub(crate) errors: mpsc::Receiver<SourceError>,
}

/// Capability over the chain node RPC.
#[async_trait]
pub(crate) trait LogSource: Send + Sync + 'static {
    /// Current head block height.
    async fn current_height(&self) -> Result<u64, SourceError>;

    /// All logs in `[filter.from_block, filter.to_block]` matching the filter.
    async fn scan_range(&self, filter: &LogFilter) -> Result<Vec<RawLogRecord>, SourceError>;

    /// Logs from `filter.from_block` onwards, delivered at least once and in no
    /// guaranteed order.
    async fn subscribe(&self, filter: &LogFilter) -> Result<Subscription, SourceError>;

    /// Timestamp of block `block_number`.
    async fn block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>, SourceError>;
}

/// Subset of `eth_getBlockByNumber` needed for the points formula.
#[derive(Debug, Deserialize)]
struct BlockHeader {
    #[serde(deserialize_with = "from_hex_u64")]
    timestamp: u64,
}

/// [`LogSource`] over an Ethereum JSON-RPC node.
///
/// Plain calls go over HTTP. Subscriptions use `eth_subscribe("logs")` over a
/// WebSocket and replay `eth_getLogs` from the filter's start block up to the
/// head, so logs emitted while disconnected are still delivered.
#[derive(Debug, Clone)]
pub(crate) struct JsonRpcLogSource {
    http: reqwest::Client,
    rpc_url: String,
    ws_url: String,
    replay_window: u64,
    request_timeout: Duration,
}

impl JsonRpcLogSource {
    pub(crate) fn new(
        rpc_url: impl Into<String>,
        ws_url: impl Into<String>,
        replay_window: u64,
        request_timeout: Duration,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            http: create_http_client(request_timeout)?,
            rpc_url: rpc_url.into(),
            ws_url: ws_url.into(),
            replay_window: replay_window.max(1),
            request_timeout,
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, SourceError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp: Value = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = resp.get("error") {
            return Err(SourceError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        let result = resp
            .get("result")
            .cloned()
            .ok_or_else(|| SourceError::Decode(format!("missing `result` in {method} response")))?;
        Ok(serde_json::from_value(result)?)
    }

    /// Re-deliver historical logs from `filter.from_block` to the current head.
    async fn replay(
        &self,
        filter: &LogFilter,
        tx: &mpsc::Sender<RawLogRecord>,
    ) -> Result<(), SourceError> {
        let head = self.current_height().await?;
        let mut from = filter.from_block;

        while from <= head {
            let to = from.saturating_add(self.replay_window - 1).min(head);
            let logs = self.scan_range(&filter.with_range(from, to)).await?;
            debug!(from, to, count = logs.len(), "Replayed logs before live stream");
            for log in logs {
                if tx.send(log).await.is_err() {
                    return Ok(());
                }
            }
            from = to + 1;
        }
        Ok(())
    }
}

#[async_trait]
impl LogSource for JsonRpcLogSource {
    async fn current_height(&self) -> Result<u64, SourceError> {
        let height: String = self.request("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&height).map_err(|e| SourceError::Decode(format!("block number {height}: {e}")))
    }

    async fn scan_range(&self, filter: &LogFilter) -> Result<Vec<RawLogRecord>, SourceError> {
        let logs: Vec<RawLogRecord> = self
            .request("eth_getLogs", json!([filter.range_params()]))
            .await?;
        Ok(logs.into_iter().filter(|log| !log.removed).collect())
    }

    async fn subscribe(&self, filter: &LogFilter) -> Result<Subscription, SourceError> {
        let client = WsClientBuilder::default()
            .request_timeout(self.request_timeout)
            .build(&self.ws_url)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let mut subscription = client
            .subscribe::<Value, _>(
                "eth_subscribe",
                rpc_params!["logs", filter.subscription_params()],
                "eth_unsubscribe",
            )
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        info!(ws_url = %self.ws_url, from_block = filter.from_block, "Subscribed to logs");

        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(1);
        let source = self.clone();
        let filter = filter.clone();

        tokio::spawn(async move {
            // The subscription lives only as long as its client.
            let _client = client;

            if let Err(e) = source.replay(&filter, &log_tx).await {
                let _ = err_tx.send(e).await;
                return;
            }

            loop {
                let next = tokio::select! {
                    _ = log_tx.closed() => return,
                    next = subscription.next() => next,
                };

                match next {
                    Some(Ok(value)) => match serde_json::from_value::<RawLogRecord>(value) {
                        Ok(log) if log.removed => continue,
                        Ok(log) => {
                            if log_tx.send(log).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(%e, "Ignoring malformed log notification"),
                    },
                    Some(Err(e)) => warn!(%e, "Ignoring undecodable log notification"),
                    None => {
                        let _ = err_tx.send(SourceError::Closed).await;
                        return;
                    }
                }
            }
        });

        Ok(Subscription {
            logs: log_rx,
            errors: err_rx,
        })
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>, SourceError> {
        let header: Option<BlockHeader> = self
            .request(
                "eth_getBlockByNumber",
                json!([format!("{block_number:#x}"), false]),
            )
            .await?;

        let header =
            header.ok_or_else(|| SourceError::Decode(format!("block {block_number} not found")))?;
        i64::try_from(header.timestamp)
            .ok()
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .ok_or_else(|| SourceError::Decode(format!("timestamp {} out of range", header.timestamp)))
    }
}
