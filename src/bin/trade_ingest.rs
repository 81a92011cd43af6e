//! Trade ingestion runtime
//!
//! Reads JSON-line trades from a file or stdin, assigns identities, persists
//! them in batches and raises anomalies.
//!
//! Usage:
//!   cargo run --release --bin trade_ingest < trades.jsonl
//!   TRADE_SOURCE_PATH=trades.jsonl INGEST_MODE=backfill cargo run --release --bin trade_ingest
//!
//! Environment variables:
//!   TRADES_DB_PATH - primary SQLite database (default: data/trades.db)
//!   ALERT_BACKEND - sqlite|jsonl (default: sqlite)
//!   INGEST_MODE - live|backfill (default: live)
//!   FLUSH_THRESHOLD - trades per batch (default: 2500)
//!   See `IngestConfig::from_env` for the full list.

use dotenv::dotenv;
use log::{error, info, warn};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::{mpsc, watch};
use tradesentry::config::IngestConfig;
use tradesentry::ingest::hashing::file_hash;
use tradesentry::ingest::{
    build_accumulator, open_trade_file, read_trades, run_ingestion, ConsoleProgress, IngestMessage,
    IngestOptions, LogProgress, ProgressSink, ReadStats,
};
use tradesentry::store::TradeStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Trade Ingest");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = IngestConfig::from_env();
    config.log_summary();

    let progress: Box<dyn ProgressSink> = if config.show_progress {
        Box::new(ConsoleProgress)
    } else {
        Box::new(LogProgress::new(10_000))
    };

    info!("🔧 Opening stores...");
    let (mut accumulator, store) = build_accumulator(&config, progress).await?;
    info!("✅ Stores ready");

    // A completed file is skipped; an interrupted one resumes after its stored trades
    let (content_hash, resume_after) = match &config.source_path {
        Some(path) => {
            let hash = file_hash(path)?;
            let progress = store.source_progress(&hash).await?;
            if progress.completed {
                warn!("⚠️  {} was already ingested (sha256 {}), nothing to do", path.display(), hash);
                return Ok(());
            }
            info!("🔑 Source fingerprint: {}", hash);
            if progress.stored_trades > 0 {
                info!("⏩ Resuming after {} trades stored by an earlier run", progress.stored_trades);
            }
            (Some(hash), progress.stored_trades)
        }
        None => (None, 0),
    };

    let source: Box<dyn AsyncBufRead + Send + Unpin> = match &config.source_path {
        Some(path) => Box::new(open_trade_file(path).await?),
        None => {
            info!("📖 Reading trades from stdin");
            Box::new(BufReader::new(tokio::io::stdin()))
        }
    };

    let (tx, rx) = mpsc::channel::<IngestMessage>(config.channel_capacity());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    info!("✅ Trade channel created (buffer: {})", config.channel_capacity());

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!();
                info!("⚠️  Received CTRL+C, shutting down...");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                error!("❌ Failed to listen for CTRL+C: {}", err);
            }
        }
    });

    let reader = tokio::spawn(read_trades(
        source,
        content_hash.clone(),
        resume_after,
        tx,
        shutdown_rx,
    ));

    info!("🔄 Press CTRL+C to stop (buffered trades are committed on exit)");

    let result = run_ingestion(rx, &mut accumulator, IngestOptions::from_config(&config)).await;
    if config.show_progress {
        eprintln!();
    }

    // A halted writer leaves the reader blocked on its source
    let read_stats = if result.is_ok() {
        match reader.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("❌ Trade reader task failed: {}", e);
                ReadStats::default()
            }
        }
    } else {
        reader.abort();
        ReadStats::default()
    };

    // Only a source read to the end is marked complete
    let result = match (result, &content_hash) {
        (Ok(report), Some(hash)) if read_stats.completed => accumulator
            .complete_source(hash)
            .await
            .map(|()| report),
        (result, _) => result,
    };

    match result {
        Ok(report) => {
            info!("📊 Summary:");
            info!(
                "   ├─ Lines read: {} ({} skipped, {} already stored)",
                read_stats.lines, read_stats.skipped, read_stats.resumed
            );
            info!("   ├─ Trades ingested: {}", report.trades);
            info!("   ├─ Anomalies: {}", report.anomalies);
            info!(
                "   ├─ Flagged: {} ({} already flagged, {} period-level)",
                report.totals.flagged, report.totals.already_flagged, report.totals.period_level
            );
            info!(
                "   ├─ Alerts: {} written, {} failed",
                report.totals.alerts_written, report.totals.alerts_failed
            );
            info!("   └─ Last trade id: {}", report.last_id);
            Ok(())
        }
        Err(e) => {
            error!(
                "❌ Ingestion failed: {} ({} trades left unflushed)",
                e,
                accumulator.buffer_len()
            );
            Err(e.into())
        }
    }
}
