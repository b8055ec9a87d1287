//! The ingestion engine: backfill and live phases over a [`LogSource`].
//!
//! # Backfill
//! The head is sampled once. Fixed-size windows from `max(checkpoint, start)`
//! to that head are fetched, decoded, scored and persisted in order; the
//! checkpoint moves to a window's last block only after all of its entries
//! are stored. A window whose fetch keeps failing is logged and skipped.
//!
//! # Live
//! `Subscribing → Streaming → Reconnecting → Subscribing`. Each record is
//! applied and checkpointed on its own. After a transport error, or a record
//! that cannot be applied, the engine waits and re-subscribes from the last
//! checkpoint, so skipped or missed records are replayed rather than lost.
//!
//! Both phases observe the stop signal only between records and windows.

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::{IngestionConfig, IngestionMode, StartBlock};
use crate::indexer::checkpoint::CheckpointStore;
use crate::indexer::db::PointsLedger;
use crate::indexer::decoder::{decode, Decoded, EventSchema};
use crate::indexer::errors::{IngestError, SourceError, StoreError};
use crate::indexer::models::PointsLedgerEntry;
use crate::indexer::points;
use crate::indexer::source::{LogSource, Subscription};
use crate::indexer::types::{LogFilter, RawLogRecord};
use crate::utils::{retry_policy::ExponentialBackoff, rpc_client::execute_with_retries};

/// Retries for ledger and checkpoint writes
const PERSIST_MAX_RETRIES: u64 = 5;

/// Time budget for ledger and checkpoint write retries
const PERSIST_RETRY_TIME: Duration = Duration::from_secs(10);

/// Tunables for one engine run.
#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    pub(crate) contract_addresses: BTreeSet<Address>,
    pub(crate) start_block: StartBlock,
    pub(crate) mode: IngestionMode,
    pub(crate) window_size: u64,
    pub(crate) window_retry: ExponentialBackoff,
    pub(crate) persist_retry: ExponentialBackoff,
    pub(crate) reconnect_delay: Duration,
    pub(crate) rpc_timeout: Duration,
}

impl EngineSettings {
    pub(crate) fn from_config(config: &IngestionConfig) -> Self {
        Self {
            contract_addresses: config.contract_addresses().clone(),
            start_block: config.start_block(),
            mode: config.mode(),
            window_size: config.backfill_window_size(),
            window_retry: config.window_retry_policy(),
            persist_retry: ExponentialBackoff::new(PERSIST_MAX_RETRIES, PERSIST_RETRY_TIME, 1.5),
            reconnect_delay: config.reconnect_delay(),
            rpc_timeout: config.rpc_timeout(),
        }
    }
}

/// Whether the engine should keep going after a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stopped,
}

/// Live-mode states.
#[derive(Debug)]
enum LiveState {
    Subscribing,
    Streaming(Subscription),
    Reconnecting,
}

/// Turns chain logs into points ledger entries.
pub(crate) struct IngestionEngine<S> {
    source: S,
    schema: EventSchema,
    checkpoint_store: Box<dyn CheckpointStore>,
    ledger: PointsLedger,
    settings: EngineSettings,
    /// Highest block whose events are fully persisted
    checkpoint: u64,
    /// Configured start block, resolved against the head at run start
    genesis: u64,
}

impl<S: LogSource> IngestionEngine<S> {
    /// Builds an engine, reading the stored checkpoint once.
    ///
    /// An unreadable checkpoint is returned as an error so the process can fail
    /// before ingesting anything.
    pub(crate) async fn open(
        source: S,
        schema: EventSchema,
        checkpoint_store: Box<dyn CheckpointStore>,
        ledger: PointsLedger,
        settings: EngineSettings,
    ) -> Result<Self, StoreError> {
        let checkpoint = checkpoint_store.load().await?;
        info!(checkpoint, "Loaded ingestion checkpoint");

        Ok(Self {
            source,
            schema,
            checkpoint_store,
            ledger,
            settings,
            checkpoint,
            genesis: 0,
        })
    }

    /// Runs the configured phases until they finish or `stop` turns true.
    pub(crate) async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let Some(head) = self.sample_head(&mut stop).await else {
            info!("Ingestion stopped before start");
            return;
        };

        self.genesis = match self.settings.start_block {
            StartBlock::Number(n) => n,
            StartBlock::Latest if self.checkpoint == 0 => head,
            StartBlock::Latest => 0,
        };

        let flow = match self.settings.mode {
            IngestionMode::Live => Flow::Continue,
            IngestionMode::Backfill | IngestionMode::Full => self.backfill(head, &stop).await,
        };

        if flow == Flow::Continue && self.settings.mode != IngestionMode::Backfill {
            self.live(&mut stop).await;
        }

        info!(checkpoint = self.checkpoint, "Ingestion stopped");
    }

    fn resume_block(&self) -> u64 {
        self.checkpoint.max(self.genesis)
    }

    fn filter(&self, from_block: u64, to_block: Option<u64>) -> LogFilter {
        LogFilter::new(
            self.settings.contract_addresses.clone(),
            self.schema.signatures().copied().collect(),
            from_block,
            to_block,
        )
    }

    async fn with_timeout<T>(
        &self,
        method: &'static str,
        call: impl Future<Output = Result<T, SourceError>>,
    ) -> Result<T, SourceError> {
        tokio::time::timeout(self.settings.rpc_timeout, call)
            .await
            .map_err(|_| SourceError::Timeout(method))?
    }

    /// Head height, retried until it succeeds or the engine is stopped.
    async fn sample_head(&self, stop: &mut watch::Receiver<bool>) -> Option<u64> {
        loop {
            match self
                .with_timeout("eth_blockNumber", self.source.current_height())
                .await
            {
                Ok(head) => return Some(head),
                Err(e) => {
                    warn!(%e, "Failed to fetch chain head");
                    if pause(self.settings.reconnect_delay, stop).await == Flow::Stopped {
                        return None;
                    }
                }
            }
        }
    }

    async fn backfill(&mut self, head: u64, stop: &watch::Receiver<bool>) -> Flow {
        let mut cursor = self.resume_block();
        info!(from = cursor, head, window = self.settings.window_size, "Starting backfill");

        while cursor <= head {
            if *stop.borrow() {
                info!(cursor, "Backfill interrupted by stop signal");
                return Flow::Stopped;
            }

            let end = cursor
                .saturating_add(self.settings.window_size.saturating_sub(1))
                .min(head);

            match self.fetch_window(cursor, end).await {
                Ok(logs) => {
                    let count = logs.len();
                    match self.apply_window(logs).await {
                        Ok(applied) => {
                            self.advance_checkpoint(end).await;
                            info!(from = cursor, to = end, logs = count, applied, "Backfill window applied");
                        }
                        Err(e) => {
                            warn!(from = cursor, to = end, %e, "Skipping window: failed to apply logs");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        from = cursor,
                        to = end,
                        attempts = self.settings.window_retry.max_retries() + 1,
                        %e,
                        "Skipping window after exhausting retries"
                    );
                }
            }

            if end == u64::MAX {
                break;
            }
            cursor = end + 1;
        }

        info!(head, checkpoint = self.checkpoint, "Backfill caught up");
        Flow::Continue
    }

    async fn fetch_window(&self, from: u64, to: u64) -> Result<Vec<RawLogRecord>, SourceError> {
        let filter = self.filter(from, Some(to));
        let (this, filter) = (&*self, &filter);
        execute_with_retries(
            move || this.with_timeout("eth_getLogs", this.source.scan_range(filter)),
            "eth_getLogs",
            &self.settings.window_retry,
        )
        .await
    }

    /// Applies a window's logs in block order; returns the number of new entries.
    async fn apply_window(&self, mut logs: Vec<RawLogRecord>) -> Result<usize, IngestError> {
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        let mut timestamps = HashMap::new();
        let mut applied = 0;
        for raw in logs {
            if let Some(entry) = self.evaluate(raw, &mut timestamps).await? {
                if self.persist(&entry).await? {
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    /// Decodes and scores one log; `None` when the log carries no points event.
    async fn evaluate(
        &self,
        raw: RawLogRecord,
        timestamps: &mut HashMap<u64, DateTime<Utc>>,
    ) -> Result<Option<PointsLedgerEntry>, SourceError> {
        let (block_number, tx_hash, log_index) = (raw.block_number, raw.tx_hash, raw.log_index);
        if raw.removed {
            debug!(block_number, %tx_hash, log_index, "Skipping removed log");
            return Ok(None);
        }

        let event = match decode(raw, &self.schema) {
            Decoded::Event(event) => event,
            Decoded::Skip(reason) => {
                debug!(block_number, %tx_hash, log_index, ?reason, "Skipping log");
                return Ok(None);
            }
        };

        let block_time = match timestamps.get(&block_number) {
            Some(ts) => *ts,
            None => {
                let this = self;
                let ts = execute_with_retries(
                    move || {
                        this.with_timeout(
                            "eth_getBlockByNumber",
                            this.source.block_timestamp(block_number),
                        )
                    },
                    "eth_getBlockByNumber",
                    &self.settings.window_retry,
                )
                .await?;
                timestamps.insert(block_number, ts);
                ts
            }
        };

        let now = Utc::now();
        let points = points::compute(event.points_multiplier, event.amount_wei, block_time, now);
        debug!(
            kind = %event.kind,
            account = %event.account,
            amount_wei = %event.amount_wei,
            points,
            block_number,
            "Computed points"
        );

        Ok(Some(PointsLedgerEntry::new(&event, points, now)))
    }

    async fn persist(&self, entry: &PointsLedgerEntry) -> Result<bool, StoreError> {
        let ledger = &self.ledger;
        let inserted = execute_with_retries(
            move || ledger.insert_entry(entry),
            "insert_ledger_entry",
            &self.settings.persist_retry,
        )
        .await?;

        if !inserted {
            debug!(tx_hash = %entry.tx_hash, log_index = entry.log_index, "Ledger entry already present");
        }
        Ok(inserted)
    }

    /// Moves the checkpoint forward to `block_number`; never backwards.
    async fn advance_checkpoint(&mut self, block_number: u64) {
        if block_number <= self.checkpoint {
            return;
        }

        let store = &self.checkpoint_store;
        let saved = execute_with_retries(
            move || store.save(block_number),
            "save_checkpoint",
            &self.settings.persist_retry,
        )
        .await;

        match saved {
            Ok(()) => self.checkpoint = block_number,
            Err(e) => warn!(
                block_number,
                checkpoint = self.checkpoint,
                %e,
                "Failed to persist checkpoint, keeping previous value"
            ),
        }
    }

    async fn live(&mut self, stop: &mut watch::Receiver<bool>) {
        let mut state = LiveState::Subscribing;

        loop {
            state = match state {
                LiveState::Subscribing => {
                    if *stop.borrow() {
                        return;
                    }
                    let filter = self.filter(self.resume_block(), None);
                    match self
                        .with_timeout("eth_subscribe", self.source.subscribe(&filter))
                        .await
                    {
                        Ok(subscription) => {
                            info!(from_block = filter.from_block, "Streaming live logs");
                            LiveState::Streaming(subscription)
                        }
                        Err(e) => {
                            warn!(from_block = filter.from_block, %e, "Failed to subscribe to logs");
                            LiveState::Reconnecting
                        }
                    }
                }
                LiveState::Streaming(mut subscription) => {
                    tokio::select! {
                        biased;
                        _ = stopped(stop) => return,
                        next = subscription.logs.recv() => match next {
                            Some(raw) => match self.apply_record(raw).await {
                                Ok(()) => LiveState::Streaming(subscription),
                                // Checkpoint stays below the failed record, so the
                                // next subscription replays it.
                                Err(_) => LiveState::Reconnecting,
                            },
                            None => {
                                warn!(checkpoint = self.checkpoint, "Log stream ended");
                                LiveState::Reconnecting
                            }
                        },
                        Some(e) = subscription.errors.recv() => {
                            warn!(checkpoint = self.checkpoint, %e, "Subscription error");
                            LiveState::Reconnecting
                        }
                    }
                }
                LiveState::Reconnecting => {
                    let delay = self.settings.reconnect_delay;
                    info!(?delay, "Reconnecting log subscription");
                    if pause(delay, stop).await == Flow::Stopped {
                        return;
                    }
                    LiveState::Subscribing
                }
            };
        }
    }

    /// Applies one live record and checkpoints it.
    ///
    /// On failure the checkpoint is left untouched and the caller must drop the
    /// subscription.
    async fn apply_record(&mut self, raw: RawLogRecord) -> Result<(), IngestError> {
        let (block_number, tx_hash, log_index) = (raw.block_number, raw.tx_hash, raw.log_index);

        let mut timestamps = HashMap::new();
        let result = match self.evaluate(raw, &mut timestamps).await {
            Ok(Some(entry)) => self.persist(&entry).await.map(|_| ()).map_err(IngestError::from),
            Ok(None) => Ok(()),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                self.advance_checkpoint(block_number).await;
                Ok(())
            }
            Err(e) => {
                error!(
                    block_number,
                    %tx_hash,
                    log_index,
                    checkpoint = self.checkpoint,
                    %e,
                    "Failed to apply live record, resubscribing"
                );
                Err(e)
            }
        }
    }
}

/// Resolves once `stop` is true or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn pause(delay: Duration, stop: &mut watch::Receiver<bool>) -> Flow {
    tokio::select! {
        _ = stopped(stop) => Flow::Stopped,
        _ = tokio::time::sleep(delay) => Flow::Continue,
    }
}

/// Running engine task.
#[derive(Debug)]
pub(crate) struct IngestionHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IngestionHandle {
    /// Waits for the engine to finish on its own.
    pub(crate) async fn finished(&mut self) {
        if let Err(e) = (&mut self.task).await {
            error!(%e, "Ingestion task failed");
        }
    }

    /// Signals the engine to stop and waits for it to unwind.
    pub(crate) async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            error!(%e, "Ingestion task failed");
        }
    }
}

/// Spawns `engine` on its own task.
pub(crate) fn start_ingestion<S: LogSource>(engine: IngestionEngine<S>) -> IngestionHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(engine.run(stop_rx));
    IngestionHandle { stop_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::checkpoint::MemoryCheckpointStore;
    use crate::indexer::db::test_pool;
    use crate::indexer::decoder::{Borrow, EventSpec, Mint};
    use crate::indexer::types::EventKind;
    use alloy_primitives::{Bytes, B256, U256};
    use alloy_sol_types::SolEvent;
    use async_trait::async_trait;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };
    use tokio::sync::mpsc;

    fn contract() -> Address {
        Address::repeat_byte(0xcc)
    }

    const ONE_ETH: u128 = 1_000_000_000_000_000_000;

    /// Scripted chain node.
    #[derive(Default)]
    struct MockLogSource {
        head: u64,
        logs: Vec<RawLogRecord>,
        block_time: Option<DateTime<Utc>>,
        /// Remaining failures per window start block
        scan_failures: Mutex<HashMap<u64, usize>>,
        scans: Mutex<Vec<LogFilter>>,
        /// One entry per subscribe call: logs to deliver, then whether to fail
        subscriptions: Mutex<VecDeque<(Vec<RawLogRecord>, bool)>>,
        subscribe_filters: Mutex<Vec<LogFilter>>,
        open_channels: Mutex<Vec<(mpsc::Sender<RawLogRecord>, mpsc::Sender<SourceError>)>>,
        /// Remaining timestamp failures per block
        timestamp_failures: Mutex<HashMap<u64, usize>>,
        /// Number of upcoming scans that never answer
        stalled_scans: Mutex<usize>,
        /// Raised while scanning the window that starts at the given block
        stop_on_scan: Mutex<Option<(u64, watch::Sender<bool>)>>,
    }

    impl MockLogSource {
        fn new(head: u64, logs: Vec<RawLogRecord>) -> Self {
            Self {
                head,
                logs,
                block_time: Some(Utc::now() - chrono::Duration::minutes(20)),
                ..Default::default()
            }
        }

        fn failing_window(self, from_block: u64, failures: usize) -> Self {
            self.scan_failures.lock().unwrap().insert(from_block, failures);
            self
        }

        fn failing_timestamp(self, block_number: u64, failures: usize) -> Self {
            self.timestamp_failures
                .lock()
                .unwrap()
                .insert(block_number, failures);
            self
        }

        fn stalling_scans(self, count: usize) -> Self {
            *self.stalled_scans.lock().unwrap() = count;
            self
        }

        fn stop_when_scanning(self, from_block: u64, stop_tx: watch::Sender<bool>) -> Self {
            *self.stop_on_scan.lock().unwrap() = Some((from_block, stop_tx));
            self
        }

        fn scripted_subscription(self, logs: Vec<RawLogRecord>, fail: bool) -> Self {
            self.subscriptions.lock().unwrap().push_back((logs, fail));
            self
        }

        fn scan_starts(&self) -> Vec<u64> {
            self.scans.lock().unwrap().iter().map(|f| f.from_block).collect()
        }

        fn subscribe_starts(&self) -> Vec<u64> {
            self.subscribe_filters
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.from_block)
                .collect()
        }
    }

    #[async_trait]
    impl LogSource for Arc<MockLogSource> {
        async fn current_height(&self) -> Result<u64, SourceError> {
            Ok(self.head)
        }

        async fn scan_range(&self, filter: &LogFilter) -> Result<Vec<RawLogRecord>, SourceError> {
            self.scans.lock().unwrap().push(filter.clone());

            {
                let stop_on_scan = self.stop_on_scan.lock().unwrap();
                if let Some((from_block, stop_tx)) = stop_on_scan.as_ref() {
                    if *from_block == filter.from_block {
                        let _ = stop_tx.send(true);
                    }
                }
            }

            let stall = {
                let mut stalled = self.stalled_scans.lock().unwrap();
                let stall = *stalled > 0;
                *stalled = stalled.saturating_sub(1);
                stall
            };
            if stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }

            if let Some(remaining) = self.scan_failures.lock().unwrap().get_mut(&filter.from_block) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SourceError::Transport("connection reset".to_string()));
                }
            }

            let to_block = filter.to_block.unwrap_or(u64::MAX);
            Ok(self
                .logs
                .iter()
                .filter(|log| (filter.from_block..=to_block).contains(&log.block_number))
                .cloned()
                .collect())
        }

        async fn subscribe(&self, filter: &LogFilter) -> Result<Subscription, SourceError> {
            self.subscribe_filters.lock().unwrap().push(filter.clone());

            let (log_tx, logs) = mpsc::channel(16);
            let (error_tx, errors) = mpsc::channel(1);
            if let Some((scripted, fail)) = self.subscriptions.lock().unwrap().pop_front() {
                for log in scripted {
                    log_tx.try_send(log).unwrap();
                }
                if fail {
                    error_tx.try_send(SourceError::Closed).unwrap();
                }
            }
            self.open_channels.lock().unwrap().push((log_tx, error_tx));

            Ok(Subscription { logs, errors })
        }

        async fn block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>, SourceError> {
            if let Some(remaining) = self.timestamp_failures.lock().unwrap().get_mut(&block_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SourceError::Transport("header unavailable".to_string()));
                }
            }

            self.block_time
                .ok_or_else(|| SourceError::Decode(format!("no timestamp for block {block_number}")))
        }
    }

    fn schema() -> EventSchema {
        EventSchema::new([
            (
                Mint::SIGNATURE_HASH,
                EventSpec {
                    kind: EventKind::Mint,
                    multiplier: 1,
                },
            ),
            (
                Borrow::SIGNATURE_HASH,
                EventSpec {
                    kind: EventKind::Borrow,
                    multiplier: 2,
                },
            ),
        ])
    }

    fn settings(mode: IngestionMode, start_block: StartBlock) -> EngineSettings {
        EngineSettings {
            contract_addresses: BTreeSet::from([contract()]),
            start_block,
            mode,
            window_size: 10,
            window_retry: ExponentialBackoff::fixed(3, Duration::from_millis(1)),
            persist_retry: ExponentialBackoff::fixed(3, Duration::from_millis(1)),
            reconnect_delay: Duration::from_millis(10),
            rpc_timeout: Duration::from_secs(1),
        }
    }

    fn event_log(
        signature: B256,
        account: Address,
        amount: u128,
        block_number: u64,
        tx: u8,
    ) -> RawLogRecord {
        RawLogRecord {
            address: contract(),
            topics: vec![signature, account.into_word()],
            data: Bytes::from(U256::from(amount).to_be_bytes::<32>().to_vec()),
            block_number,
            tx_hash: B256::repeat_byte(tx),
            log_index: 0,
            removed: false,
        }
    }

    fn mint(account: Address, amount: u128, block_number: u64, tx: u8) -> RawLogRecord {
        event_log(Mint::SIGNATURE_HASH, account, amount, block_number, tx)
    }

    async fn engine(
        source: &Arc<MockLogSource>,
        store: &Arc<MemoryCheckpointStore>,
        ledger: &PointsLedger,
        settings: EngineSettings,
    ) -> IngestionEngine<Arc<MockLogSource>> {
        IngestionEngine::open(
            source.clone(),
            schema(),
            Box::new(store.clone()),
            ledger.clone(),
            settings,
        )
        .await
        .unwrap()
    }

    async fn run_to_completion(engine: IngestionEngine<Arc<MockLogSource>>) {
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), engine.run(stop_rx))
            .await
            .expect("engine did not finish");
    }

    async fn row_count(ledger: &PointsLedger) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM points_ledger")
            .fetch_one(ledger.pool())
            .await
            .unwrap()
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn backfill_awards_points_and_checkpoints_head() {
        let account = Address::repeat_byte(0xab);
        let source = Arc::new(MockLogSource::new(105, vec![mint(account, ONE_ETH, 101, 0x01)]));
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Backfill, StartBlock::Number(100)),
        )
        .await;
        run_to_completion(engine).await;

        assert_eq!(ledger.sum_points(&account).await.unwrap(), 2);
        assert_eq!(row_count(&ledger).await, 1);
        assert_eq!(store.history(), vec![105]);
        assert_eq!(source.scan_starts(), vec![100]);
    }

    #[tokio::test]
    async fn rerunning_a_range_is_idempotent() {
        let account = Address::repeat_byte(0xab);
        let logs = vec![
            mint(account, ONE_ETH, 101, 0x01),
            event_log(Borrow::SIGNATURE_HASH, account, 3 * ONE_ETH, 103, 0x02),
        ];
        let source = Arc::new(MockLogSource::new(105, logs));
        let ledger = PointsLedger::new(test_pool().await);

        for _ in 0..2 {
            let store = Arc::new(MemoryCheckpointStore::default());
            let engine = engine(
                &source,
                &store,
                &ledger,
                settings(IngestionMode::Backfill, StartBlock::Number(100)),
            )
            .await;
            run_to_completion(engine).await;
        }

        // 1 ETH * 2 intervals * 1 + 3 ETH * 2 intervals * 2
        assert_eq!(ledger.sum_points(&account).await.unwrap(), 14);
        assert_eq!(row_count(&ledger).await, 2);
    }

    #[tokio::test]
    async fn checkpoint_advances_per_window_and_never_regresses() {
        let source = Arc::new(MockLogSource::new(135, vec![]));
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let first = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Backfill, StartBlock::Number(100)),
        )
        .await;
        run_to_completion(first).await;
        assert_eq!(store.history(), vec![109, 119, 129, 135]);
        assert_eq!(source.scan_starts(), vec![100, 110, 120, 130]);

        // Restart resumes from the stored checkpoint rather than the start block
        let second = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Backfill, StartBlock::Number(100)),
        )
        .await;
        run_to_completion(second).await;
        assert_eq!(store.history(), vec![109, 119, 129, 135]);
        assert_eq!(source.scan_starts().last(), Some(&135));
    }

    #[tokio::test]
    async fn non_point_logs_are_skipped_but_checkpointed() {
        let account = Address::repeat_byte(0xab);
        let mut no_topics = mint(account, ONE_ETH, 101, 0x01);
        no_topics.topics.clear();
        let unknown = event_log(B256::repeat_byte(0x99), account, ONE_ETH, 102, 0x02);
        let mut short = mint(account, ONE_ETH, 103, 0x03);
        short.data = Bytes::from(vec![0u8; 31]);
        let zero = mint(account, 0, 104, 0x04);

        let source = Arc::new(MockLogSource::new(
            105,
            vec![no_topics, unknown, short, zero],
        ));
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Backfill, StartBlock::Number(100)),
        )
        .await;
        run_to_completion(engine).await;

        assert_eq!(row_count(&ledger).await, 0);
        assert_eq!(store.history(), vec![105]);
    }

    #[tokio::test]
    async fn transient_window_failures_are_retried() {
        let account = Address::repeat_byte(0xab);
        let source = Arc::new(
            MockLogSource::new(105, vec![mint(account, ONE_ETH, 101, 0x01)]).failing_window(100, 2),
        );
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Backfill, StartBlock::Number(100)),
        )
        .await;
        run_to_completion(engine).await;

        assert_eq!(source.scan_starts(), vec![100, 100, 100]);
        assert_eq!(ledger.sum_points(&account).await.unwrap(), 2);
        assert_eq!(store.history(), vec![105]);
    }

    #[tokio::test]
    async fn exhausted_window_is_skipped_without_checkpoint() {
        let account = Address::repeat_byte(0xab);
        let logs = vec![
            mint(account, ONE_ETH, 101, 0x01),
            mint(account, ONE_ETH, 111, 0x02),
        ];
        let source = Arc::new(MockLogSource::new(115, logs).failing_window(100, 5));
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Backfill, StartBlock::Number(100)),
        )
        .await;
        run_to_completion(engine).await;

        assert_eq!(source.scan_starts(), vec![100, 100, 100, 110]);
        assert_eq!(row_count(&ledger).await, 1);
        assert_eq!(store.history(), vec![115]);
    }

    #[tokio::test]
    async fn latest_start_ignores_history() {
        let account = Address::repeat_byte(0xab);
        let logs = vec![
            mint(account, ONE_ETH, 100, 0x01),
            mint(account, ONE_ETH, 500, 0x02),
        ];
        let source = Arc::new(MockLogSource::new(500, logs));
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Backfill, StartBlock::Latest),
        )
        .await;
        run_to_completion(engine).await;

        assert_eq!(source.scan_starts(), vec![500]);
        assert_eq!(row_count(&ledger).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_mode_resubscribes_from_checkpoint() {
        let account = Address::repeat_byte(0xab);
        let source = Arc::new(
            MockLogSource::new(40, vec![])
                .scripted_subscription(vec![mint(account, ONE_ETH, 100, 0x01)], true)
                .scripted_subscription(vec![mint(account, ONE_ETH, 100, 0x01)], false),
        );
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Live, StartBlock::Number(50)),
        )
        .await;
        let handle = start_ingestion(engine);

        let watched = source.clone();
        wait_until(move || watched.subscribe_filters.lock().unwrap().len() >= 2).await;
        handle.stop().await;

        assert_eq!(source.subscribe_starts(), vec![50, 100]);
        assert!(source.subscribe_filters.lock().unwrap()[0].to_block.is_none());
        // The replayed record is a duplicate
        assert_eq!(row_count(&ledger).await, 1);
        assert_eq!(store.history(), vec![100]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_mode_streams_after_backfill() {
        let account = Address::repeat_byte(0xab);
        let source = Arc::new(
            MockLogSource::new(105, vec![mint(account, ONE_ETH, 101, 0x01)])
                .scripted_subscription(vec![mint(account, 2 * ONE_ETH, 106, 0x02)], false),
        );
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Full, StartBlock::Number(100)),
        )
        .await;
        let handle = start_ingestion(engine);

        let watched = store.clone();
        wait_until(move || watched.history().last() == Some(&106)).await;
        handle.stop().await;

        assert_eq!(source.subscribe_starts(), vec![105]);
        assert_eq!(ledger.sum_points(&account).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn backfill_task_finishes_without_stop() {
        let source = Arc::new(MockLogSource::new(25, vec![]));
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Backfill, StartBlock::Number(0)),
        )
        .await;
        let mut handle = start_ingestion(engine);
        tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .expect("backfill did not finish");

        assert_eq!(store.history(), vec![9, 19, 25]);
        assert!(source.subscribe_starts().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_live_record_is_replayed_before_checkpoint_moves() {
        let account = Address::repeat_byte(0xab);
        let delivered = vec![
            mint(account, ONE_ETH, 105, 0x01),
            mint(account, ONE_ETH, 106, 0x02),
        ];
        // Every attempt of the first delivery fails; the replay succeeds.
        let source = Arc::new(
            MockLogSource::new(100, vec![])
                .failing_timestamp(105, 3)
                .scripted_subscription(delivered.clone(), false)
                .scripted_subscription(delivered, false),
        );
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Live, StartBlock::Number(100)),
        )
        .await;
        let handle = start_ingestion(engine);

        let watched = store.clone();
        wait_until(move || watched.history().last() == Some(&106)).await;
        handle.stop().await;

        assert_eq!(source.subscribe_starts(), vec![100, 100]);
        assert_eq!(store.history(), vec![105, 106]);
        assert_eq!(row_count(&ledger).await, 2);
        assert_eq!(ledger.sum_points(&account).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn stalled_scan_times_out_and_is_retried() {
        let account = Address::repeat_byte(0xab);
        let source = Arc::new(
            MockLogSource::new(105, vec![mint(account, ONE_ETH, 101, 0x01)]).stalling_scans(2),
        );
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let mut settings = settings(IngestionMode::Backfill, StartBlock::Number(100));
        settings.rpc_timeout = Duration::from_millis(50);
        let engine = engine(&source, &store, &ledger, settings).await;
        run_to_completion(engine).await;

        assert_eq!(source.scan_starts(), vec![100, 100, 100]);
        assert_eq!(row_count(&ledger).await, 1);
        assert_eq!(store.history(), vec![105]);
    }

    #[tokio::test]
    async fn stalled_scan_surfaces_as_timeout() {
        let source = Arc::new(MockLogSource::new(105, vec![]).stalling_scans(3));
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let mut settings = settings(IngestionMode::Backfill, StartBlock::Number(100));
        settings.rpc_timeout = Duration::from_millis(20);
        let engine = engine(&source, &store, &ledger, settings).await;

        let result = engine.fetch_window(100, 105).await;
        assert!(matches!(result, Err(SourceError::Timeout("eth_getLogs"))));
        assert_eq!(source.scan_starts(), vec![100, 100, 100]);
    }

    #[tokio::test]
    async fn stop_interrupts_backfill_between_windows() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let source = Arc::new(MockLogSource::new(135, vec![]).stop_when_scanning(110, stop_tx));
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Full, StartBlock::Number(100)),
        )
        .await;
        tokio::time::timeout(Duration::from_secs(5), engine.run(stop_rx))
            .await
            .expect("engine ignored stop");

        // The in-flight window completes; nothing after it is scanned
        assert_eq!(source.scan_starts(), vec![100, 110]);
        assert_eq!(store.history(), vec![109, 119]);
        assert!(source.subscribe_starts().is_empty());
    }

    #[tokio::test]
    async fn stop_ends_an_idle_stream() {
        let source = Arc::new(MockLogSource::new(10, vec![]));
        let store = Arc::new(MemoryCheckpointStore::default());
        let ledger = PointsLedger::new(test_pool().await);

        let engine = engine(
            &source,
            &store,
            &ledger,
            settings(IngestionMode::Live, StartBlock::Latest),
        )
        .await;
        let handle = start_ingestion(engine);

        let watched = source.clone();
        wait_until(move || !watched.subscribe_filters.lock().unwrap().is_empty()).await;
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("engine ignored stop");

        assert_eq!(source.subscribe_starts(), vec![10]);
    }

    #[tokio::test]
    async fn unreadable_checkpoint_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_block.txt");
        std::fs::write(&path, "not-a-block").unwrap();

        let result = IngestionEngine::open(
            Arc::new(MockLogSource::new(10, vec![])),
            schema(),
            Box::new(crate::indexer::checkpoint::FileCheckpointStore::new(path)),
            PointsLedger::new(test_pool().await),
            settings(IngestionMode::Backfill, StartBlock::Latest),
        )
        .await;

        assert!(matches!(result, Err(StoreError::Parse(_))));
    }
}
