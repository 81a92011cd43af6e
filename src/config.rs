//! Runtime configuration from environment variables
//!
//! Every value has a default; unparseable values fall back to the default
//! with a warning instead of aborting startup.

use crate::detector::DetectorConfig;
use crate::ingest::accumulator::AccumulatorConfig;
use crate::ingest::retry::RetryPolicy;
use crate::ingest::types::Durability;
use crate::store::BackendType;
use chrono::NaiveDate;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which anomaly path a run takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Evaluate every trade as it arrives
    Live,
    /// Load a historical batch, evaluate once at the end
    Backfill,
}

impl IngestMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "live" | "stream" | "streaming" => Some(IngestMode::Live),
            "backfill" | "bulk" => Some(IngestMode::Backfill),
            _ => None,
        }
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, IngestMode::Backfill)
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Primary store (trades, symbols)
    pub trades_db_path: PathBuf,

    pub alert_backend: BackendType,
    pub alerts_db_path: PathBuf,
    pub alerts_jsonl_path: PathBuf,
    pub alert_durability: Durability,

    /// Buffered trades per flush
    pub flush_threshold: usize,
    pub commit_on_flush: bool,
    /// Periodic flush+commit while live
    pub commit_interval_ms: u64,

    /// Bounded trade channel between reader and writer
    pub channel_buffer: usize,

    pub mode: IngestMode,
    /// JSON-lines trade file; stdin when unset
    pub source_path: Option<PathBuf>,
    /// Pin the analysis date (YYYY-MM-DD); today (UTC) when unset
    pub analysis_date: Option<NaiveDate>,

    pub retry: RetryPolicy,
    pub detector: DetectorConfig,

    pub show_progress: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            trades_db_path: PathBuf::from("data/trades.db"),
            alert_backend: BackendType::Sqlite,
            alerts_db_path: PathBuf::from("data/alerts.db"),
            alerts_jsonl_path: PathBuf::from("data/alerts.jsonl"),
            alert_durability: Durability::Soft,
            flush_threshold: 2_500,
            commit_on_flush: false,
            commit_interval_ms: 5_000,
            channel_buffer: 10_000,
            mode: IngestMode::Live,
            source_path: None,
            analysis_date: None,
            retry: RetryPolicy::default(),
            detector: DetectorConfig::default(),
            show_progress: true,
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TRADES_DB_PATH` (default: data/trades.db)
    /// - `ALERT_BACKEND` sqlite|jsonl (default: sqlite)
    /// - `ALERTS_DB_PATH` (default: data/alerts.db)
    /// - `ALERTS_JSONL_PATH` (default: data/alerts.jsonl)
    /// - `ALERT_DURABILITY` soft|hard (default: soft)
    /// - `FLUSH_THRESHOLD` (default: 2500)
    /// - `COMMIT_ON_FLUSH` (default: false)
    /// - `COMMIT_INTERVAL_MS` (default: 5000)
    /// - `CHANNEL_BUFFER` (default: 10000)
    /// - `INGEST_MODE` live|backfill (default: live)
    /// - `TRADE_SOURCE_PATH` (default: unset, read stdin)
    /// - `ANALYSIS_DATE` (default: unset, today)
    /// - `RETRY_INITIAL_MS` / `RETRY_MAX_MS` / `RETRY_MAX_ATTEMPTS` (100 / 5000 / 5)
    /// - `DETECTOR_Z_THRESHOLD` / `DETECTOR_MIN_SAMPLES` (4.0 / 30)
    /// - `SHOW_PROGRESS` (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            trades_db_path: env::var("TRADES_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.trades_db_path),

            alert_backend: env_parsed_with("ALERT_BACKEND", BackendType::parse)
                .unwrap_or(defaults.alert_backend),

            alerts_db_path: env::var("ALERTS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.alerts_db_path),

            alerts_jsonl_path: env::var("ALERTS_JSONL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.alerts_jsonl_path),

            alert_durability: env_parsed_with("ALERT_DURABILITY", Durability::parse)
                .unwrap_or(defaults.alert_durability),

            flush_threshold: env_or("FLUSH_THRESHOLD", defaults.flush_threshold).max(1),
            commit_on_flush: env_or("COMMIT_ON_FLUSH", defaults.commit_on_flush),
            commit_interval_ms: env_or("COMMIT_INTERVAL_MS", defaults.commit_interval_ms),
            channel_buffer: env_or("CHANNEL_BUFFER", defaults.channel_buffer).max(1),

            mode: env_parsed_with("INGEST_MODE", IngestMode::parse).unwrap_or(defaults.mode),

            source_path: env::var("TRADE_SOURCE_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),

            analysis_date: env_parsed_with("ANALYSIS_DATE", |s| {
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
            }),

            retry: RetryPolicy {
                initial_delay_ms: env_or("RETRY_INITIAL_MS", defaults.retry.initial_delay_ms),
                max_delay_ms: env_or("RETRY_MAX_MS", defaults.retry.max_delay_ms),
                max_retries: env_or("RETRY_MAX_ATTEMPTS", defaults.retry.max_retries),
            },

            detector: DetectorConfig {
                z_threshold: env_or("DETECTOR_Z_THRESHOLD", defaults.detector.z_threshold),
                min_samples: env_or("DETECTOR_MIN_SAMPLES", defaults.detector.min_samples),
                ..defaults.detector
            },

            show_progress: env_or("SHOW_PROGRESS", defaults.show_progress),
        }
    }

    /// Path of the configured alert backend
    pub fn alerts_path(&self) -> &Path {
        match self.alert_backend {
            BackendType::Sqlite => &self.alerts_db_path,
            BackendType::Jsonl => &self.alerts_jsonl_path,
        }
    }

    /// Bounded channel capacity (tokio channels need at least one slot)
    pub fn channel_capacity(&self) -> usize {
        self.channel_buffer.max(1)
    }

    /// Trades replayed from a file take the first-pass path at finalize
    pub fn is_file_sourced(&self) -> bool {
        self.source_path.is_some()
    }

    pub fn accumulator_config(&self) -> AccumulatorConfig {
        AccumulatorConfig {
            flush_threshold: self.flush_threshold,
            commit_on_flush: self.commit_on_flush,
            retry: self.retry,
            analysis_date: self.analysis_date,
        }
    }

    pub fn log_summary(&self) {
        log::info!("⚙️  Configuration:");
        log::info!("   ├─ Trades DB: {}", self.trades_db_path.display());
        log::info!(
            "   ├─ Alerts: {:?} at {} ({:?} durability)",
            self.alert_backend,
            self.alerts_path().display(),
            self.alert_durability
        );
        log::info!("   ├─ Mode: {:?}", self.mode);
        log::info!(
            "   ├─ Source: {}",
            self.source_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "stdin".to_string())
        );
        log::info!(
            "   ├─ Flush threshold: {} (commit on flush: {})",
            self.flush_threshold,
            self.commit_on_flush
        );
        log::info!("   ├─ Commit interval: {}ms", self.commit_interval_ms);
        log::info!("   ├─ Channel buffer: {}", self.channel_capacity());
        log::info!(
            "   └─ Detector: z > {} after {} samples",
            self.detector.z_threshold,
            self.detector.min_samples
        );
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_parsed_with(key, |s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_parsed_with<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = env::var(key).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        log::warn!("⚠️  Ignoring invalid {}={:?}, using default", key, raw);
    }
    parsed
}
