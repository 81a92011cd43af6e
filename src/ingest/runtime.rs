//! Ingestion driver - single writer task fed by a bounded channel
//!
//! The reader side (file, stdin, network) only parses and sends. Everything
//! that touches identities, the buffer or the stores happens on the task
//! running `run_ingestion`.

use super::accumulator::{DispatchSummary, IngestionAccumulator};
use super::dispatcher::AlertDispatcher;
use super::error::IngestError;
use super::progress::ProgressSink;
use super::symbols::SymbolResolver;
use super::types::Trade;
use crate::config::{IngestConfig, IngestMode};
use crate::detector::PriceDeviationDetector;
use crate::store::{AlertBackend, SqliteTradeReader, SqliteTradeStore};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// One trade handed from a reader to the writer
#[derive(Debug, Clone)]
pub struct IngestMessage {
    pub trade: Trade,
    /// Fingerprint of the source batch this trade came from
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub mode: IngestMode,
    pub file_sourced: bool,
    /// Live mode flushes and commits on this cadence
    pub commit_interval_ms: u64,
    /// Channel capacity, for utilisation logging
    pub channel_capacity: usize,
}

impl IngestOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            mode: config.mode,
            file_sourced: config.is_file_sourced(),
            commit_interval_ms: config.commit_interval_ms,
            channel_capacity: config.channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub trades: u64,
    pub anomalies: u64,
    pub adapter_failures: u64,
    /// Highest identity handed out this session (0 when none)
    pub last_id: i64,
    /// Result of the end-of-ingestion pass
    pub finalize: DispatchSummary,
    pub totals: DispatchSummary,
}

impl IngestReport {
    fn from_accumulator(accumulator: &IngestionAccumulator, finalize: DispatchSummary) -> Self {
        Self {
            trades: accumulator.trade_count(),
            anomalies: accumulator.anomaly_count(),
            adapter_failures: accumulator.adapter_failures(),
            last_id: accumulator.next_id() - 1,
            finalize,
            totals: accumulator.totals(),
        }
    }
}

/// Open the SQLite-backed stores and wire an accumulator over them
///
/// Returns the trade store handle too, so callers can check source hashes
/// before ingesting.
pub async fn build_accumulator(
    config: &IngestConfig,
    progress: Box<dyn ProgressSink>,
) -> Result<(IngestionAccumulator, SqliteTradeStore), IngestError> {
    let store = SqliteTradeStore::open(&config.trades_db_path)?;
    let reader = SqliteTradeReader::open(&config.trades_db_path)?;
    let detector = PriceDeviationDetector::new(config.detector).with_reader(reader);

    let alerts = AlertBackend::open(config.alert_backend.clone(), config.alerts_path())?;
    let dispatcher = AlertDispatcher::new(Box::new(alerts), config.alert_durability, config.retry);

    let accumulator = IngestionAccumulator::open(
        config.accumulator_config(),
        Box::new(store.clone()),
        SymbolResolver::new(Box::new(store.clone())),
        Box::new(detector),
        dispatcher,
        progress,
    )
    .await?;

    Ok((accumulator, store))
}

/// Drain the channel into the accumulator until every sender is dropped
///
/// Closing the channel is the shutdown signal: the end-of-ingestion pass
/// runs, then the buffer is flushed and committed. Store failures stop the
/// loop and are returned; the accumulator (and its unflushed buffer) stays
/// with the caller.
pub async fn run_ingestion(
    mut rx: mpsc::Receiver<IngestMessage>,
    accumulator: &mut IngestionAccumulator,
    options: IngestOptions,
) -> Result<IngestReport, IngestError> {
    let is_bulk = options.mode.is_bulk();

    log::info!("🚀 Starting trade ingestion");
    log::info!("   ├─ Mode: {:?}", options.mode);
    log::info!("   ├─ File sourced: {}", options.file_sourced);
    log::info!("   ├─ Next trade id: {}", accumulator.next_id());
    log::info!("   └─ Waiting for trades...");

    let mut commit_timer = interval(Duration::from_millis(options.commit_interval_ms.max(1)));
    commit_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    commit_timer.tick().await;

    let mut window_trades = 0u64;
    let mut last_log_time = Instant::now();

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    break;
                };

                if let Err(e) = accumulator.add(message.trade, message.content_hash, is_bulk).await {
                    log::error!(
                        "❌ Ingestion halted at trade {}: {} ({} trades buffered)",
                        accumulator.next_id() - 1,
                        e,
                        accumulator.buffer_len()
                    );
                    return Err(e);
                }
                window_trades += 1;

                // Log throughput every 10 seconds
                if last_log_time.elapsed().as_secs() >= 10 {
                    let trades_per_sec = window_trades as f64 / last_log_time.elapsed().as_secs_f64();
                    log::info!(
                        "📊 Ingestion rate: {:.1} trades/sec (total: {})",
                        trades_per_sec,
                        accumulator.trade_count()
                    );
                    last_log_time = Instant::now();
                    window_trades = 0;
                }
            }

            _ = commit_timer.tick(), if !is_bulk => {
                let pending = accumulator.buffer_len();
                accumulator.force_commit().await?;

                let channel_usage = rx.len();
                log::debug!(
                    "💾 Periodic commit: {} trades | channel: {}/{}",
                    pending,
                    channel_usage,
                    options.channel_capacity
                );

                // Warn if channel is filling up (> 50% capacity)
                if options.channel_capacity > 0 && channel_usage > options.channel_capacity / 2 {
                    log::warn!(
                        "⚠️  Channel usage high: {}/{} ({}%)",
                        channel_usage,
                        options.channel_capacity,
                        (channel_usage * 100) / options.channel_capacity
                    );
                }
            }
        }
    }

    log::info!("🔄 Trade channel closed, finalizing...");

    let finalize = match accumulator.finalize(is_bulk, options.file_sourced).await {
        Ok(summary) => summary,
        Err(IngestError::Adapter(reason)) => {
            log::warn!("⚠️  Final evaluation skipped: {}", reason);
            DispatchSummary::default()
        }
        Err(e) => return Err(e),
    };
    accumulator.force_commit().await?;

    let report = IngestReport::from_accumulator(accumulator, finalize);
    log::info!("✅ Ingestion stopped");
    log::info!("   ├─ Trades: {}", report.trades);
    log::info!("   ├─ Anomalies: {}", report.anomalies);
    log::info!("   ├─ Detector failures: {}", report.adapter_failures);
    log::info!("   └─ Last trade id: {}", report.last_id);

    Ok(report)
}
