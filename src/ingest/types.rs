//! Core data structures for trade ingestion and anomaly alerting
//!
//! Flow of values through the pipeline:
//!
//! ```text
//! Trade (incoming) ─► TradeRecord (buffered, persisted)
//!                          │
//!                          ▼
//!                 AnomalyDetector ─► Anomaly (transient) ─► Alert (secondary store)
//!                                                      └──► flag on TradeRecord
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Trade event as received from an external source
///
/// One JSON object per line when read from a file or stdin:
/// `{"symbol":"VOD.L","price":72.31,"size":1500,"bid":72.30,"ask":72.32,"timestamp":"2024-03-01T08:00:01Z"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

/// Trade as stored in the `trades` table
///
/// `id` is assigned by the accumulator and never reused. Once persisted the
/// only mutation is the one-way `flagged` transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: i64,
    pub price: f64,
    pub size: f64,
    pub bid: f64,
    pub ask: f64,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub analysis_date: NaiveDate,
    pub source_hash: Option<String>,
    pub flagged: bool,
}

impl TradeRecord {
    pub fn from_trade(
        id: i64,
        trade: Trade,
        symbol: String,
        analysis_date: NaiveDate,
        source_hash: Option<String>,
    ) -> Self {
        Self {
            id,
            price: trade.price,
            size: trade.size,
            bid: trade.bid,
            ask: trade.ask,
            symbol,
            timestamp: trade.timestamp,
            analysis_date,
            source_hash,
            flagged: false,
        }
    }

    /// Quote is crossed when the bid sits above the ask
    pub fn is_crossed(&self) -> bool {
        self.bid > self.ask
    }
}

/// Master-data symbol (unique by name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub name: String,
}

/// What an anomaly refers to
///
/// Day-level aggregate anomalies cannot be pinned to a single record and
/// carry the period key instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AnomalySubject {
    TradeId(i64),
    PeriodKey(NaiveDate),
}

impl AnomalySubject {
    pub fn trade_id(&self) -> Option<i64> {
        match self {
            AnomalySubject::TradeId(id) => Some(*id),
            AnomalySubject::PeriodKey(_) => None,
        }
    }

    pub fn period_key(&self) -> Option<NaiveDate> {
        match self {
            AnomalySubject::TradeId(_) => None,
            AnomalySubject::PeriodKey(date) => Some(*date),
        }
    }
}

/// Error classification code attached to anomalies and alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyCode {
    PriceDeviation,
    CrossedQuote,
    SizeOutlier,
    ElevatedDailyRate,
}

impl AnomalyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyCode::PriceDeviation => "PRICE_DEVIATION",
            AnomalyCode::CrossedQuote => "CROSSED_QUOTE",
            AnomalyCode::SizeOutlier => "SIZE_OUTLIER",
            AnomalyCode::ElevatedDailyRate => "ELEVATED_DAILY_RATE",
        }
    }
}

/// Detection result produced by an `AnomalyDetector`
///
/// Never persisted directly: it drives one alert and one flag update.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub subject: AnomalySubject,
    pub description: String,
    /// 1 (informational) to 5 (critical)
    pub severity: u8,
    pub code: AnomalyCode,
    pub symbol: String,
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn for_trade(record: &TradeRecord, code: AnomalyCode, description: impl Into<String>) -> Self {
        Self {
            subject: AnomalySubject::TradeId(record.id),
            description: description.into(),
            severity: 1,
            code,
            symbol: record.symbol.clone(),
            detected_at: Utc::now(),
        }
    }

    pub fn for_period(
        period: NaiveDate,
        symbol: impl Into<String>,
        code: AnomalyCode,
        description: impl Into<String>,
    ) -> Self {
        Self {
            subject: AnomalySubject::PeriodKey(period),
            description: description.into(),
            severity: 1,
            code,
            symbol: symbol.into(),
            detected_at: Utc::now(),
        }
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = severity.clamp(1, 5);
        self
    }
}

/// Alert row in the secondary store
///
/// `reviewed` starts false and is only changed by the review workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub time: DateTime<Utc>,
    pub subject: AnomalySubject,
    pub description: String,
    pub severity: u8,
    pub error_code: AnomalyCode,
    pub symbol: String,
    pub reviewed: bool,
}

impl From<&Anomaly> for Alert {
    fn from(anomaly: &Anomaly) -> Self {
        Self {
            time: anomaly.detected_at,
            subject: anomaly.subject,
            description: anomaly.description.clone(),
            severity: anomaly.severity,
            error_code: anomaly.code,
            symbol: anomaly.symbol.clone(),
            reviewed: false,
        }
    }
}

/// Durability requested for an alert write
///
/// Soft writes are acknowledged without waiting for stable storage. Alerts
/// are advisory; the trade flag is the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    #[default]
    Soft,
    Hard,
}

impl Durability {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "soft" => Some(Durability::Soft),
            "hard" => Some(Durability::Hard),
            _ => None,
        }
    }
}

/// Source of a first-pass (backfill) evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Batch loaded for deferred analysis
    Backfill,
    /// Trades replayed from a file
    File,
}
