//! Ingestion accumulator - identity, buffering and the anomaly protocol
//!
//! Single writer: one accumulator owns the identity counter, the buffer, the
//! symbol cache and both store handles. Callers drive it sequentially.
//!
//! Write ordering when anomalies are raised:
//! 1. flush the buffer (the flagged record must exist in the store)
//! 2. flag every trade-level anomaly
//! 3. commit (records and flags become durable together)
//! 4. write one alert per anomaly (soft durability, failures logged)
//!
//! An alert therefore never exists for a flag that could still be lost.
//! Anomalies whose flag or commit failed stay pending and are raised again
//! by the next raise (or `raise_pending`); flags are idempotent.

use super::dispatcher::AlertDispatcher;
use super::error::IngestError;
use super::progress::ProgressSink;
use super::retry::RetryPolicy;
use super::symbols::SymbolResolver;
use super::types::{Anomaly, SourceKind, Trade, TradeRecord};
use crate::detector::AnomalyDetector;
use crate::store::{FlagOutcome, TradeStore};
use chrono::{NaiveDate, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulatorConfig {
    /// Buffered trades that trigger a flush
    pub flush_threshold: usize,
    /// Commit after every threshold flush instead of only staging
    pub commit_on_flush: bool,
    pub retry: RetryPolicy,
    /// Fixed analysis date; today (UTC) when unset
    pub analysis_date: Option<NaiveDate>,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 2_500,
            commit_on_flush: false,
            retry: RetryPolicy::default(),
            analysis_date: None,
        }
    }
}

/// How the anomaly branch of `add` ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Registered for the deferred first pass
    Deferred,
    Clean,
    /// Number of anomalies raised
    Anomalous(usize),
    /// Detector failed for this trade; ingestion continued
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub id: i64,
    pub evaluation: Evaluation,
    /// Buffer was written to the store during this call
    pub flushed: bool,
}

/// Counts from one raise (flag, commit, alert) cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub anomalies: usize,
    pub flagged: usize,
    pub already_flagged: usize,
    /// Trade id the store does not know
    pub unmatched: usize,
    /// Period-level anomalies (alert only)
    pub period_level: usize,
    pub alerts_written: usize,
    pub alerts_failed: usize,
}

impl DispatchSummary {
    fn merge(&mut self, other: &DispatchSummary) {
        self.anomalies += other.anomalies;
        self.flagged += other.flagged;
        self.already_flagged += other.already_flagged;
        self.unmatched += other.unmatched;
        self.period_level += other.period_level;
        self.alerts_written += other.alerts_written;
        self.alerts_failed += other.alerts_failed;
    }
}

pub struct IngestionAccumulator {
    config: AccumulatorConfig,
    next_id: i64,
    buffer: Vec<TradeRecord>,
    store: Box<dyn TradeStore>,
    symbols: SymbolResolver,
    detector: Box<dyn AnomalyDetector>,
    dispatcher: AlertDispatcher,
    progress: Box<dyn ProgressSink>,
    /// Detected, not yet flagged and alerted
    unraised: Vec<Anomaly>,
    trade_count: u64,
    anomaly_count: u64,
    adapter_failures: u64,
    totals: DispatchSummary,
}

impl IngestionAccumulator {
    /// Seed the identity counter from the highest committed trade
    pub async fn open(
        config: AccumulatorConfig,
        store: Box<dyn TradeStore>,
        symbols: SymbolResolver,
        detector: Box<dyn AnomalyDetector>,
        dispatcher: AlertDispatcher,
        progress: Box<dyn ProgressSink>,
    ) -> Result<Self, IngestError> {
        let mut backoff = config.retry.backoff();
        let highest = loop {
            match store.highest_persisted_id().await {
                Ok(id) => break id,
                Err(e) => backoff.retry_or(e).await?,
            }
        };

        let config = AccumulatorConfig {
            flush_threshold: config.flush_threshold.max(1),
            ..config
        };

        log::info!("📦 Accumulator ready");
        log::info!("   ├─ Resuming after trade id: {}", highest);
        log::info!("   ├─ Flush threshold: {}", config.flush_threshold);
        log::info!("   └─ Commit on flush: {}", config.commit_on_flush);

        Ok(Self {
            buffer: Vec::with_capacity(config.flush_threshold),
            config,
            next_id: highest + 1,
            store,
            symbols,
            detector,
            dispatcher,
            progress,
            unraised: Vec::new(),
            trade_count: 0,
            anomaly_count: 0,
            adapter_failures: 0,
            totals: DispatchSummary::default(),
        })
    }

    /// Ingest one trade
    ///
    /// The identity is consumed as soon as it is allocated and never reused,
    /// even if a later step fails. Detector failures are reported in the
    /// outcome; store failures are returned.
    ///
    /// A buffer left full by a failed flush is written before the trade is
    /// accepted, so the buffer never grows past the flush threshold.
    pub async fn add(
        &mut self,
        trade: Trade,
        content_hash: Option<String>,
        is_bulk: bool,
    ) -> Result<AddOutcome, IngestError> {
        let mut flushed = self.flush_if_full().await?;

        let id = self.next_id;
        self.next_id += 1;

        let symbol = self.resolve_symbol(&trade.symbol).await?;
        let record = TradeRecord::from_trade(id, trade, symbol, self.analysis_date(), content_hash);

        self.buffer.push(record.clone());
        self.trade_count += 1;

        let evaluation = if is_bulk {
            self.detector.register(&record);
            Evaluation::Deferred
        } else {
            match self.detector.evaluate_single(&record).await {
                Ok(anomalies) if anomalies.is_empty() => Evaluation::Clean,
                Ok(anomalies) => {
                    let count = anomalies.len();
                    self.raise(anomalies).await?;
                    flushed = true;
                    Evaluation::Anomalous(count)
                }
                Err(e) => {
                    self.adapter_failures += 1;
                    log::error!("❌ Detector failed on trade {}: {}", id, e);
                    Evaluation::Failed(e.to_string())
                }
            }
        };

        if self.flush_if_full().await? {
            flushed = true;
        }

        self.report_progress();

        Ok(AddOutcome {
            id,
            evaluation,
            flushed,
        })
    }

    /// Write the whole buffer in one batch
    ///
    /// Returns the number of records written. An empty buffer issues no
    /// store call. On failure the buffer is left intact.
    pub async fn flush(&mut self) -> Result<usize, IngestError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let mut backoff = self.config.retry.backoff();
        loop {
            match self.store.bulk_insert(&self.buffer).await {
                Ok(()) => break,
                Err(e) => {
                    let e = self.store_failed(e);
                    backoff.retry_or(e).await?
                }
            }
        }

        let written = self.buffer.len();
        self.buffer.clear();
        log::debug!("💾 Flushed {} trades (next id {})", written, self.next_id);
        Ok(written)
    }

    /// Flush, then make everything staged durable
    pub async fn force_commit(&mut self) -> Result<(), IngestError> {
        self.flush().await?;
        self.commit().await
    }

    /// End-of-ingestion pass
    ///
    /// Buffered trades are committed first so the period pass (which reads
    /// committed data) sees them. Bulk or file-sourced runs evaluate the
    /// registered trades; live runs evaluate the current analysis date.
    pub async fn finalize(
        &mut self,
        is_bulk: bool,
        is_file_sourced: bool,
    ) -> Result<DispatchSummary, IngestError> {
        self.force_commit().await?;

        let result = if is_bulk || is_file_sourced {
            let source = if is_file_sourced {
                SourceKind::File
            } else {
                SourceKind::Backfill
            };
            log::info!("🔍 Running first-pass evaluation ({:?})", source);
            self.detector.evaluate_first_pass(source).await
        } else {
            let period = self.analysis_date();
            log::info!("🔍 Running end-of-period evaluation for {}", period);
            self.detector.evaluate_end_of_period(period).await
        };

        let anomalies = match result {
            Ok(anomalies) => anomalies,
            Err(e) => {
                self.adapter_failures += 1;
                log::error!("❌ Final evaluation failed: {}", e);
                return Err(e);
            }
        };

        let summary = self.raise(anomalies).await?;
        log::info!(
            "✅ Finalized: {} anomalies ({} flagged, {} period-level, {} alerts)",
            summary.anomalies,
            summary.flagged,
            summary.period_level,
            summary.alerts_written
        );
        Ok(summary)
    }

    /// Record that every trade of a source batch has been ingested
    ///
    /// The marker is committed together with the last buffered trades.
    pub async fn complete_source(&mut self, content_hash: &str) -> Result<(), IngestError> {
        self.flush().await?;

        let mut backoff = self.config.retry.backoff();
        loop {
            match self.store.mark_source_complete(content_hash).await {
                Ok(()) => break,
                Err(e) => {
                    let e = self.store_failed(e);
                    backoff.retry_or(e).await?
                }
            }
        }

        self.commit().await?;
        log::info!("✅ Source {} marked complete", content_hash);
        Ok(())
    }

    /// Flag, commit and alert anomalies left over by a failed raise
    pub async fn raise_pending(&mut self) -> Result<DispatchSummary, IngestError> {
        let mut summary = DispatchSummary {
            anomalies: self.unraised.len(),
            ..DispatchSummary::default()
        };
        if self.unraised.is_empty() {
            return Ok(summary);
        }

        self.flush().await?;

        let mut failure = None;
        for anomaly in &self.unraised {
            match self.dispatcher.flag(self.store.as_mut(), anomaly).await {
                Ok(FlagOutcome::Flagged) => summary.flagged += 1,
                Ok(FlagOutcome::AlreadyFlagged) => summary.already_flagged += 1,
                Ok(FlagOutcome::NotFound) => summary.unmatched += 1,
                Ok(FlagOutcome::NotApplicable) => summary.period_level += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            log::error!(
                "❌ Flagging failed, {} anomalies kept for retry: {}",
                self.unraised.len(),
                e
            );
            return Err(self.store_failed(e));
        }

        self.commit().await?;

        let anomalies = std::mem::take(&mut self.unraised);
        for anomaly in &anomalies {
            match self.dispatcher.alert(anomaly).await {
                Ok(()) => summary.alerts_written += 1,
                Err(e) => {
                    summary.alerts_failed += 1;
                    log::error!("❌ {}", e);
                }
            }
        }

        self.totals.merge(&summary);
        Ok(summary)
    }

    pub fn next_id(&self) -> i64 {
        self.next_id
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    pub fn anomaly_count(&self) -> u64 {
        self.anomaly_count
    }

    pub fn pending_anomalies(&self) -> usize {
        self.unraised.len()
    }

    pub fn adapter_failures(&self) -> u64 {
        self.adapter_failures
    }

    /// Cumulative raise counts for this session
    pub fn totals(&self) -> DispatchSummary {
        self.totals
    }

    pub fn analysis_date(&self) -> NaiveDate {
        self.config
            .analysis_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Count anomalies as detected, then run the flag-commit-alert cycle
    async fn raise(&mut self, anomalies: Vec<Anomaly>) -> Result<DispatchSummary, IngestError> {
        self.anomaly_count += anomalies.len() as u64;
        self.unraised.extend(anomalies);
        self.report_progress();
        self.raise_pending().await
    }

    async fn flush_if_full(&mut self) -> Result<bool, IngestError> {
        if self.buffer.len() < self.config.flush_threshold {
            return Ok(false);
        }

        self.flush().await?;
        if self.config.commit_on_flush {
            self.commit().await?;
        } else {
            self.stage().await?;
        }
        Ok(true)
    }

    /// Symbols staged in a lost transaction are gone, so is their cache entry
    fn store_failed(&mut self, e: IngestError) -> IngestError {
        if matches!(e, IngestError::StagedWritesLost(_)) {
            log::error!("❌ {} (trades flushed since the last commit are gone)", e);
            self.symbols.forget_all();
        }
        e
    }

    async fn resolve_symbol(&mut self, name: &str) -> Result<String, IngestError> {
        let mut backoff = self.config.retry.backoff();
        loop {
            match self.symbols.resolve(name).await {
                Ok(symbol) => return Ok(symbol),
                Err(e) => {
                    let e = self.store_failed(e);
                    backoff.retry_or(e).await?
                }
            }
        }
    }

    async fn stage(&mut self) -> Result<(), IngestError> {
        let mut backoff = self.config.retry.backoff();
        loop {
            match self.store.stage_without_commit().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let e = self.store_failed(e);
                    backoff.retry_or(e).await?
                }
            }
        }
    }

    async fn commit(&mut self) -> Result<(), IngestError> {
        let mut backoff = self.config.retry.backoff();
        loop {
            match self.store.commit().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let e = self.store_failed(e);
                    backoff.retry_or(e).await?
                }
            }
        }
    }

    fn report_progress(&self) {
        self.progress.report(self.trade_count, self.anomaly_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{Alert, AnomalyCode, Durability, Symbol};
    use crate::store::{AlertStore, SourceProgress, SymbolStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    // In-memory primary store: staged rows only survive a commit

    #[derive(Default)]
    struct StoreState {
        committed: BTreeMap<i64, TradeRecord>,
        staged: BTreeMap<i64, TradeRecord>,
        symbols: Vec<String>,
        symbol_calls: usize,
        bulk_calls: usize,
        commit_calls: usize,
        fail_bulk: bool,
        /// `update_flag` fails for this trade id
        fail_flag: Option<i64>,
        /// Next `bulk_insert` acts like SQLite rolling back the transaction
        lose_transaction: bool,
        staged_sources: Vec<String>,
        sources: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct MemoryStore(Arc<Mutex<StoreState>>);

    impl MemoryStore {
        fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
            self.0.lock().unwrap()
        }

        /// Simulated crash: staged rows vanish
        fn drop_staged(&self) {
            self.state().staged.clear();
        }

        fn is_flagged(&self, id: i64) -> bool {
            let state = self.state();
            state
                .staged
                .get(&id)
                .or_else(|| state.committed.get(&id))
                .map(|r| r.flagged)
                .unwrap_or(false)
        }

        fn committed_flag(&self, id: i64) -> Option<bool> {
            self.state().committed.get(&id).map(|r| r.flagged)
        }
    }

    #[async_trait]
    impl TradeStore for MemoryStore {
        async fn highest_persisted_id(&self) -> Result<i64, IngestError> {
            Ok(self.state().committed.keys().next_back().copied().unwrap_or(0))
        }

        async fn bulk_insert(&mut self, records: &[TradeRecord]) -> Result<(), IngestError> {
            let mut state = self.state();
            state.bulk_calls += 1;
            if state.fail_bulk {
                return Err(IngestError::Integrity("UNIQUE constraint failed: trades.id".to_string()));
            }
            if state.lose_transaction {
                state.lose_transaction = false;
                state.staged.clear();
                state.symbols.clear();
                return Err(IngestError::StagedWritesLost("database or disk is full".to_string()));
            }
            for record in records {
                state.staged.insert(record.id, record.clone());
            }
            Ok(())
        }

        async fn update_flag(&mut self, id: i64) -> Result<FlagOutcome, IngestError> {
            let mut state = self.state();
            if state.fail_flag == Some(id) {
                return Err(IngestError::Database("disk I/O error".to_string()));
            }
            let current = match state.staged.get(&id).or_else(|| state.committed.get(&id)) {
                Some(record) => record.clone(),
                None => return Ok(FlagOutcome::NotFound),
            };
            if current.flagged {
                return Ok(FlagOutcome::AlreadyFlagged);
            }
            state.staged.insert(id, TradeRecord { flagged: true, ..current });
            Ok(FlagOutcome::Flagged)
        }

        async fn stage_without_commit(&mut self) -> Result<(), IngestError> {
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), IngestError> {
            let mut state = self.state();
            state.commit_calls += 1;
            let staged = std::mem::take(&mut state.staged);
            state.committed.extend(staged);
            let sources = std::mem::take(&mut state.staged_sources);
            state.sources.extend(sources);
            Ok(())
        }

        async fn source_progress(&self, content_hash: &str) -> Result<SourceProgress, IngestError> {
            let state = self.state();
            Ok(SourceProgress {
                stored_trades: state
                    .committed
                    .values()
                    .filter(|r| r.source_hash.as_deref() == Some(content_hash))
                    .count() as u64,
                completed: state.sources.iter().any(|s| s == content_hash),
            })
        }

        async fn mark_source_complete(&mut self, content_hash: &str) -> Result<(), IngestError> {
            self.state().staged_sources.push(content_hash.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl SymbolStore for MemoryStore {
        async fn get_or_create_symbol(&mut self, name: &str) -> Result<Symbol, IngestError> {
            let mut state = self.state();
            state.symbol_calls += 1;
            if !state.symbols.iter().any(|s| s == name) {
                state.symbols.push(name.to_string());
            }
            Ok(Symbol {
                name: name.to_string(),
            })
        }
    }

    #[derive(Clone, Default)]
    struct MemoryAlerts {
        written: Arc<Mutex<Vec<Alert>>>,
        fail: bool,
    }

    #[async_trait]
    impl AlertStore for MemoryAlerts {
        async fn insert_alert(&mut self, alert: &Alert, _durability: Durability) -> Result<(), IngestError> {
            if self.fail {
                return Err(IngestError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "alert store down",
                )));
            }
            self.written.lock().unwrap().push(alert.clone());
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "memory"
        }
    }

    type SingleScript = Box<dyn FnMut(&TradeRecord) -> Result<Vec<Anomaly>, IngestError> + Send>;

    /// Detector whose answers are scripted by the test
    struct ScriptedDetector {
        single: SingleScript,
        registered: Arc<Mutex<Vec<i64>>>,
        first_pass: Vec<Anomaly>,
        end_of_period: Vec<Anomaly>,
        periods: Arc<Mutex<Vec<NaiveDate>>>,
    }

    impl ScriptedDetector {
        fn clean() -> Self {
            Self::with_single(|_| Ok(Vec::new()))
        }

        fn with_single(
            single: impl FnMut(&TradeRecord) -> Result<Vec<Anomaly>, IngestError> + Send + 'static,
        ) -> Self {
            Self {
                single: Box::new(single),
                registered: Arc::new(Mutex::new(Vec::new())),
                first_pass: Vec::new(),
                end_of_period: Vec::new(),
                periods: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl AnomalyDetector for ScriptedDetector {
        fn register(&mut self, record: &TradeRecord) {
            self.registered.lock().unwrap().push(record.id);
        }

        async fn evaluate_single(&mut self, record: &TradeRecord) -> Result<Vec<Anomaly>, IngestError> {
            (self.single)(record)
        }

        async fn evaluate_first_pass(&mut self, _source: SourceKind) -> Result<Vec<Anomaly>, IngestError> {
            self.registered.lock().unwrap().clear();
            Ok(std::mem::take(&mut self.first_pass))
        }

        async fn evaluate_end_of_period(&mut self, period: NaiveDate) -> Result<Vec<Anomaly>, IngestError> {
            self.periods.lock().unwrap().push(period);
            Ok(std::mem::take(&mut self.end_of_period))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingProgress(Arc<Mutex<Vec<(u64, u64)>>>);

    impl ProgressSink for RecordingProgress {
        fn report(&self, trade_count: u64, anomaly_count: u64) {
            self.0.lock().unwrap().push((trade_count, anomaly_count));
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn trade(symbol: &str, price: f64) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            price,
            size: 100.0,
            bid: price - 0.01,
            ask: price + 0.01,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        }
    }

    fn config(threshold: usize) -> AccumulatorConfig {
        AccumulatorConfig {
            flush_threshold: threshold,
            commit_on_flush: false,
            retry: RetryPolicy::none(),
            analysis_date: Some(day()),
        }
    }

    struct Harness {
        store: MemoryStore,
        alerts: MemoryAlerts,
        progress: RecordingProgress,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStore::default(),
                alerts: MemoryAlerts::default(),
                progress: RecordingProgress::default(),
            }
        }

        async fn open(&self, config: AccumulatorConfig, detector: ScriptedDetector) -> IngestionAccumulator {
            let dispatcher = AlertDispatcher::new(
                Box::new(self.alerts.clone()),
                Durability::Soft,
                RetryPolicy::none(),
            );
            IngestionAccumulator::open(
                config,
                Box::new(self.store.clone()),
                SymbolResolver::new(Box::new(self.store.clone())),
                Box::new(detector),
                dispatcher,
                Box::new(self.progress.clone()),
            )
            .await
            .unwrap()
        }

        fn alerts(&self) -> Vec<Alert> {
            self.alerts.written.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_ids_are_gap_free_from_highest_committed() {
        let harness = Harness::new();
        {
            let mut acc = harness.open(config(100), ScriptedDetector::clean()).await;
            for _ in 0..5 {
                acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
            }
            acc.force_commit().await.unwrap();
        }

        let mut acc = harness.open(config(100), ScriptedDetector::clean()).await;
        assert_eq!(acc.next_id(), 6);

        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(acc.add(trade("VOD.L", 72.0), None, false).await.unwrap().id);
        }
        assert_eq!(ids, (6..=15).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_restart_ignores_uncommitted_rows() {
        let harness = Harness::new();
        {
            let mut acc = harness.open(config(2), ScriptedDetector::clean()).await;
            for _ in 0..3 {
                acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
            }
            acc.force_commit().await.unwrap();

            // Flushed (threshold 2) but never committed
            for _ in 0..4 {
                acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
            }
            assert_eq!(acc.buffer_len(), 0);
        }
        harness.store.drop_staged();

        let acc = harness.open(config(2), ScriptedDetector::clean()).await;
        assert_eq!(acc.next_id(), 4);
    }

    #[tokio::test]
    async fn test_empty_flush_issues_no_store_call() {
        let harness = Harness::new();
        let mut acc = harness.open(config(10), ScriptedDetector::clean()).await;

        assert_eq!(acc.flush().await.unwrap(), 0);
        acc.force_commit().await.unwrap();
        assert_eq!(harness.store.state().bulk_calls, 0);
    }

    #[tokio::test]
    async fn test_symbols_resolved_once_per_name() {
        let harness = Harness::new();
        let mut acc = harness.open(config(10), ScriptedDetector::clean()).await;

        for symbol in ["VOD.L", "BP.L", "VOD.L", "VOD.L", "BP.L"] {
            acc.add(trade(symbol, 10.0), None, false).await.unwrap();
        }
        let state = harness.store.state();
        assert_eq!(state.symbol_calls, 2);
        assert_eq!(state.symbols, vec!["VOD.L".to_string(), "BP.L".to_string()]);
    }

    #[tokio::test]
    async fn test_threshold_scenario() {
        let harness = Harness::new();
        let detector = ScriptedDetector::with_single(|record| {
            if record.id == 4 {
                Ok(vec![Anomaly::for_trade(record, AnomalyCode::PriceDeviation, "spike")])
            } else {
                Ok(Vec::new())
            }
        });
        let mut acc = harness.open(config(3), detector).await;

        for expected in 1..=2 {
            let outcome = acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
            assert_eq!(outcome.id, expected);
            assert!(!outcome.flushed);
        }
        let third = acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        assert!(third.flushed);
        assert_eq!(acc.buffer_len(), 0);
        assert!(harness.alerts().is_empty());

        let fourth = acc.add(trade("VOD.L", 99.0), None, false).await.unwrap();
        assert_eq!(fourth.id, 4);
        assert_eq!(fourth.evaluation, Evaluation::Anomalous(1));
        assert!(fourth.flushed);
        assert_eq!(acc.buffer_len(), 0);

        let alerts = harness.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].subject.trade_id(), Some(4));

        // Forced commit: all four rows and the flag are durable
        assert_eq!(harness.store.committed_flag(4), Some(true));
        assert_eq!(harness.store.committed_flag(1), Some(false));
        assert_eq!(harness.store.state().committed.len(), 4);
    }

    #[tokio::test]
    async fn test_k_anomalies_write_k_alerts() {
        let harness = Harness::new();
        let detector = ScriptedDetector::with_single(|record| {
            Ok(vec![
                Anomaly::for_trade(record, AnomalyCode::PriceDeviation, "price"),
                Anomaly::for_trade(record, AnomalyCode::SizeOutlier, "size"),
                Anomaly::for_trade(record, AnomalyCode::CrossedQuote, "crossed"),
            ])
        });
        let mut acc = harness.open(config(100), detector).await;

        let outcome = acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        assert_eq!(outcome.evaluation, Evaluation::Anomalous(3));
        assert_eq!(harness.alerts().len(), 3);
        assert!(harness.store.is_flagged(outcome.id));

        // Same trade three times: one transition, two idempotent no-ops
        let totals = acc.totals();
        assert_eq!(totals.flagged, 1);
        assert_eq!(totals.already_flagged, 2);
        assert_eq!(acc.anomaly_count(), 3);
    }

    #[tokio::test]
    async fn test_period_anomaly_alerts_without_flags() {
        let harness = Harness::new();
        let mut detector = ScriptedDetector::clean();
        detector.end_of_period = vec![Anomaly::for_period(
            day(),
            "VOD.L",
            AnomalyCode::ElevatedDailyRate,
            "too many outliers",
        )];
        let periods = detector.periods.clone();
        let mut acc = harness.open(config(100), detector).await;

        for _ in 0..3 {
            acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        }
        let summary = acc.finalize(false, false).await.unwrap();

        assert_eq!(summary.period_level, 1);
        assert_eq!(summary.alerts_written, 1);
        assert_eq!(*periods.lock().unwrap(), vec![day()]);
        assert_eq!(harness.alerts()[0].subject.period_key(), Some(day()));
        for id in 1..=3 {
            assert_eq!(harness.store.committed_flag(id), Some(false));
        }
    }

    #[tokio::test]
    async fn test_bulk_mode_defers_to_first_pass() {
        let harness = Harness::new();
        let mut detector = ScriptedDetector::with_single(|_| panic!("live evaluation in bulk mode"));
        let registered = detector.registered.clone();
        let outlier = TradeRecord::from_trade(2, trade("BP.L", 5.0), "BP.L".to_string(), day(), None);
        detector.first_pass = vec![Anomaly::for_trade(
            &outlier,
            AnomalyCode::PriceDeviation,
            "backfill outlier",
        )];
        let mut acc = harness.open(config(100), detector).await;

        for _ in 0..3 {
            let outcome = acc
                .add(trade("BP.L", 5.0), Some("abc".to_string()), true)
                .await
                .unwrap();
            assert_eq!(outcome.evaluation, Evaluation::Deferred);
        }
        assert_eq!(*registered.lock().unwrap(), vec![1, 2, 3]);
        assert!(harness.alerts().is_empty());

        let summary = acc.finalize(true, false).await.unwrap();
        assert_eq!(summary.flagged, 1);
        assert_eq!(harness.alerts().len(), 1);
        assert_eq!(harness.store.committed_flag(2), Some(true));
        assert_eq!(acc.totals().alerts_written, 1);
    }

    #[tokio::test]
    async fn test_detector_failure_does_not_stop_ingestion() {
        let harness = Harness::new();
        let detector = ScriptedDetector::with_single(|record| {
            if record.id == 2 {
                Err(IngestError::Adapter("model offline".to_string()))
            } else {
                Ok(Vec::new())
            }
        });
        let mut acc = harness.open(config(100), detector).await;

        acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        let failed = acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        assert!(matches!(failed.evaluation, Evaluation::Failed(_)));
        let next = acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        assert_eq!(next.id, 3);
        assert_eq!(next.evaluation, Evaluation::Clean);

        assert_eq!(acc.adapter_failures(), 1);
        assert_eq!(acc.buffer_len(), 3);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_buffer() {
        let harness = Harness::new();
        let mut acc = harness.open(config(100), ScriptedDetector::clean()).await;
        for _ in 0..2 {
            acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        }

        harness.store.state().fail_bulk = true;
        let err = acc.flush().await.unwrap_err();
        assert!(matches!(err, IngestError::Integrity(_)));
        assert_eq!(acc.buffer_len(), 2);

        harness.store.state().fail_bulk = false;
        assert_eq!(acc.flush().await.unwrap(), 2);
        assert_eq!(acc.buffer_len(), 0);
    }

    #[tokio::test]
    async fn test_alert_failure_is_not_fatal() {
        let mut harness = Harness::new();
        harness.alerts.fail = true;
        let detector = ScriptedDetector::with_single(|record| {
            Ok(vec![Anomaly::for_trade(record, AnomalyCode::CrossedQuote, "crossed")])
        });
        let mut acc = harness.open(config(100), detector).await;

        let outcome = acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        assert_eq!(outcome.evaluation, Evaluation::Anomalous(1));
        assert_eq!(harness.store.committed_flag(1), Some(true));
        assert_eq!(acc.totals().alerts_failed, 1);

        // Ingestion carries on
        assert_eq!(acc.add(trade("VOD.L", 72.0), None, false).await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_commit_on_flush() {
        let harness = Harness::new();
        let mut acc = harness
            .open(
                AccumulatorConfig {
                    commit_on_flush: true,
                    ..config(2)
                },
                ScriptedDetector::clean(),
            )
            .await;

        acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        assert_eq!(harness.store.state().committed.len(), 2);
    }

    #[tokio::test]
    async fn test_progress_counts_unflushed_trades() {
        let harness = Harness::new();
        let detector = ScriptedDetector::with_single(|record| {
            if record.id == 3 {
                Ok(vec![Anomaly::for_trade(record, AnomalyCode::PriceDeviation, "spike")])
            } else {
                Ok(Vec::new())
            }
        });
        let mut acc = harness.open(config(100), detector).await;

        for _ in 0..3 {
            acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        }

        let reports = harness.progress.0.lock().unwrap().clone();
        assert_eq!(reports.first(), Some(&(1, 0)));
        assert_eq!(reports.last(), Some(&(3, 1)));
    }

    #[tokio::test]
    async fn test_full_buffer_is_flushed_before_accepting_more() {
        let harness = Harness::new();
        let mut acc = harness.open(config(2), ScriptedDetector::clean()).await;

        acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        harness.store.state().fail_bulk = true;
        assert!(acc.add(trade("VOD.L", 72.0), None, false).await.is_err());
        assert_eq!(acc.buffer_len(), 2);

        // Rejected before an identity is handed out
        assert!(acc.add(trade("VOD.L", 72.0), None, false).await.is_err());
        assert_eq!(acc.buffer_len(), 2);
        assert_eq!(acc.next_id(), 3);

        harness.store.state().fail_bulk = false;
        let outcome = acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        assert_eq!(outcome.id, 3);
        assert!(outcome.flushed);
        assert_eq!(acc.buffer_len(), 1);
        assert_eq!(harness.store.state().staged.len(), 2);
    }

    #[tokio::test]
    async fn test_flag_failure_keeps_anomalies_for_retry() {
        let harness = Harness::new();
        let mut detector = ScriptedDetector::clean();
        detector.first_pass = (1..=2)
            .map(|id| {
                let record = TradeRecord::from_trade(id, trade("BP.L", 5.0), "BP.L".to_string(), day(), None);
                Anomaly::for_trade(&record, AnomalyCode::PriceDeviation, "backfill outlier")
            })
            .collect();
        let mut acc = harness.open(config(100), detector).await;

        for _ in 0..2 {
            acc.add(trade("BP.L", 5.0), None, true).await.unwrap();
        }
        harness.store.state().fail_flag = Some(2);

        let err = acc.finalize(true, false).await.unwrap_err();
        assert!(matches!(err, IngestError::Database(_)));

        // First flag staged only, no alert for anything
        assert!(harness.store.is_flagged(1));
        assert_eq!(harness.store.committed_flag(1), Some(false));
        assert!(harness.alerts().is_empty());

        // Detected anomalies are counted and kept
        assert_eq!(acc.anomaly_count(), 2);
        assert_eq!(acc.pending_anomalies(), 2);
        assert_eq!(harness.progress.0.lock().unwrap().last(), Some(&(2, 2)));

        harness.store.state().fail_flag = None;
        let summary = acc.raise_pending().await.unwrap();
        assert_eq!(summary.flagged, 1);
        assert_eq!(summary.already_flagged, 1);
        assert_eq!(summary.alerts_written, 2);
        assert_eq!(harness.store.committed_flag(1), Some(true));
        assert_eq!(harness.store.committed_flag(2), Some(true));
        assert_eq!(acc.pending_anomalies(), 0);
        assert_eq!(acc.anomaly_count(), 2);
    }

    #[tokio::test]
    async fn test_lost_transaction_clears_symbol_cache() {
        let harness = Harness::new();
        let mut acc = harness.open(config(2), ScriptedDetector::clean()).await;

        for _ in 0..2 {
            acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        }
        assert_eq!(harness.store.state().symbol_calls, 1);

        harness.store.state().lose_transaction = true;
        acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        let err = acc.add(trade("VOD.L", 72.0), None, false).await.unwrap_err();
        assert!(matches!(err, IngestError::StagedWritesLost(_)));

        // The symbol went down with the transaction and is created again
        acc.add(trade("VOD.L", 72.0), None, false).await.unwrap();
        let state = harness.store.state();
        assert_eq!(state.symbol_calls, 2);
        assert_eq!(state.symbols, vec!["VOD.L".to_string()]);
    }

    #[tokio::test]
    async fn test_complete_source_commits_marker_with_last_trades() {
        let harness = Harness::new();
        let mut acc = harness.open(config(100), ScriptedDetector::clean()).await;

        for _ in 0..3 {
            acc.add(trade("VOD.L", 72.0), Some("feed".to_string()), false).await.unwrap();
        }
        assert!(harness.store.state().committed.is_empty());

        acc.complete_source("feed").await.unwrap();
        let state = harness.store.state();
        assert_eq!(state.committed.len(), 3);
        assert_eq!(state.sources, vec!["feed".to_string()]);
    }
}
