//! Live ingestion counters
//!
//! Reporting is fire-and-forget: sinks never block ingestion and never
//! return errors to the caller.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait ProgressSink: Send {
    /// Cumulative totals, including trades not yet flushed
    fn report(&self, trade_count: u64, anomaly_count: u64);
}

/// Rewrites a single stderr line
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, trade_count: u64, anomaly_count: u64) {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(
            stderr,
            "\rTrades: {} - ({} anomalies) (Ctrl-C to stop)",
            trade_count, anomaly_count
        );
        let _ = stderr.flush();
    }
}

/// Logs a line every `every` trades, and whenever the anomaly count moves
pub struct LogProgress {
    every: u64,
    last_anomalies: AtomicU64,
}

impl LogProgress {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            last_anomalies: AtomicU64::new(0),
        }
    }

    fn should_log(&self, trade_count: u64, anomaly_count: u64) -> bool {
        let previous = self.last_anomalies.swap(anomaly_count, Ordering::Relaxed);
        trade_count % self.every == 0 || anomaly_count != previous
    }
}

impl ProgressSink for LogProgress {
    fn report(&self, trade_count: u64, anomaly_count: u64) {
        if self.should_log(trade_count, anomaly_count) {
            log::info!("📊 Trades: {} ({} anomalies)", trade_count, anomaly_count);
        }
    }
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _trade_count: u64, _anomaly_count: u64) {}
}
