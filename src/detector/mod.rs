//! Anomaly detection contract
//!
//! The accumulator only consumes detection results; how anomalies are found
//! is up to the implementation. Calls may be expensive (full-batch
//! statistics), so callers never assume constant cost.
//!
//! | Mode                | Per trade          | End of ingestion              |
//! |---------------------|--------------------|-------------------------------|
//! | Live                | `evaluate_single`  | `evaluate_end_of_period`      |
//! | Backfill / file     | `register`         | `evaluate_first_pass`         |

pub mod deviation;

use crate::ingest::error::IngestError;
use crate::ingest::types::{Anomaly, SourceKind, TradeRecord};
use async_trait::async_trait;
use chrono::NaiveDate;

pub use deviation::{DetectorConfig, PriceDeviationDetector};

#[async_trait]
pub trait AnomalyDetector: Send {
    /// Keep a trade for the deferred first pass
    fn register(&mut self, record: &TradeRecord);

    /// Evaluate one trade immediately (live mode)
    async fn evaluate_single(&mut self, record: &TradeRecord) -> Result<Vec<Anomaly>, IngestError>;

    /// Evaluate everything registered since the last first pass
    async fn evaluate_first_pass(&mut self, source: SourceKind) -> Result<Vec<Anomaly>, IngestError>;

    /// Evaluate committed trades of one period (e.g. a trading day)
    async fn evaluate_end_of_period(&mut self, period: NaiveDate) -> Result<Vec<Anomaly>, IngestError>;
}
