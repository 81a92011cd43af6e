//! Price/size deviation detector with configurable thresholds

use super::AnomalyDetector;
use crate::ingest::error::IngestError;
use crate::ingest::types::{Anomaly, AnomalyCode, SourceKind, TradeRecord};
use crate::store::SqliteTradeReader;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Absolute z-score above which a price or size is an outlier
    pub z_threshold: f64,
    /// Observations per symbol required before z-scores are trusted
    pub min_samples: u64,
    /// Share of outliers in one symbol-day that raises a period anomaly
    pub daily_rate_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            z_threshold: 4.0,
            min_samples: 30,
            daily_rate_threshold: 0.05,
        }
    }
}

/// Welford running mean/variance
#[derive(Debug, Clone, Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }

    fn z_score(&self, value: f64, min_samples: u64) -> Option<f64> {
        let std_dev = self.std_dev();
        if self.count < min_samples || std_dev <= f64::EPSILON {
            return None;
        }
        Some((value - self.mean) / std_dev)
    }
}

#[derive(Debug, Clone, Default)]
struct SymbolStats {
    price: RunningStats,
    size: RunningStats,
}

impl SymbolStats {
    fn push(&mut self, record: &TradeRecord) {
        self.price.push(record.price);
        self.size.push(record.size);
    }
}

/// Flags trades whose price or size sits far from the symbol's mean, and
/// trades quoted with bid above ask
///
/// Live evaluation compares each trade against running statistics built
/// from the trades before it. Batch passes compute statistics over the
/// whole batch first.
pub struct PriceDeviationDetector {
    config: DetectorConfig,
    live: HashMap<String, SymbolStats>,
    registered: Vec<TradeRecord>,
    reader: Option<SqliteTradeReader>,
}

impl PriceDeviationDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            live: HashMap::new(),
            registered: Vec::new(),
            reader: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DetectorConfig::default())
    }

    /// Attach a reader over committed trades for end-of-period passes
    pub fn with_reader(mut self, reader: SqliteTradeReader) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    fn severity_for(&self, z: f64) -> u8 {
        let ratio = z.abs() / self.config.z_threshold;
        (2.0 + ratio).min(5.0) as u8
    }

    fn check(&self, record: &TradeRecord, stats: Option<&SymbolStats>) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        if record.is_crossed() {
            anomalies.push(
                Anomaly::for_trade(
                    record,
                    AnomalyCode::CrossedQuote,
                    format!("crossed quote: bid {} > ask {}", record.bid, record.ask),
                )
                .with_severity(2),
            );
        }

        let Some(stats) = stats else {
            return anomalies;
        };

        if let Some(z) = stats.price.z_score(record.price, self.config.min_samples) {
            if z.abs() > self.config.z_threshold {
                anomalies.push(
                    Anomaly::for_trade(
                        record,
                        AnomalyCode::PriceDeviation,
                        format!(
                            "price {} is {:.1} sigma from mean {:.4}",
                            record.price, z, stats.price.mean
                        ),
                    )
                    .with_severity(self.severity_for(z)),
                );
            }
        }

        if let Some(z) = stats.size.z_score(record.size, self.config.min_samples) {
            if z > self.config.z_threshold {
                anomalies.push(
                    Anomaly::for_trade(
                        record,
                        AnomalyCode::SizeOutlier,
                        format!("size {} is {:.1} sigma above mean {:.2}", record.size, z, stats.size.mean),
                    )
                    .with_severity(self.severity_for(z)),
                );
            }
        }

        anomalies
    }

    /// Statistics over the whole batch, then one check per trade in order
    fn screen_batch(&self, trades: &[TradeRecord]) -> Vec<Anomaly> {
        let mut stats: HashMap<&str, SymbolStats> = HashMap::new();
        for trade in trades {
            stats.entry(trade.symbol.as_str()).or_default().push(trade);
        }

        trades
            .iter()
            .flat_map(|trade| self.check(trade, stats.get(trade.symbol.as_str())))
            .collect()
    }

    /// Per-trade anomalies for trades not yet flagged, followed by one
    /// period anomaly per symbol whose outlier rate is too high
    fn screen_period(&self, period: NaiveDate, trades: &[TradeRecord]) -> Vec<Anomaly> {
        let screened = self.screen_batch(trades);

        let flagged: HashMap<i64, bool> = trades.iter().map(|t| (t.id, t.flagged)).collect();
        let mut per_symbol: HashMap<String, (u64, u64)> = HashMap::new();
        for trade in trades {
            per_symbol.entry(trade.symbol.clone()).or_default().0 += 1;
        }

        // A trade with several anomalies counts once towards its symbol's rate
        let mut outlier_ids: HashSet<i64> = HashSet::new();
        for anomaly in &screened {
            if let Some(id) = anomaly.subject.trade_id() {
                if outlier_ids.insert(id) {
                    per_symbol.entry(anomaly.symbol.clone()).or_default().1 += 1;
                }
            }
        }

        // Trades flagged earlier in the day already produced their alert
        let mut anomalies: Vec<Anomaly> = screened
            .into_iter()
            .filter(|anomaly| match anomaly.subject.trade_id() {
                Some(id) => !flagged.get(&id).copied().unwrap_or(false),
                None => true,
            })
            .collect();

        let mut symbols: Vec<(String, (u64, u64))> = per_symbol.into_iter().collect();
        symbols.sort_by(|a, b| a.0.cmp(&b.0));

        for (symbol, (total, outliers)) in symbols {
            if total < self.config.min_samples {
                continue;
            }
            let rate = outliers as f64 / total as f64;
            if rate > self.config.daily_rate_threshold {
                anomalies.push(
                    Anomaly::for_period(
                        period,
                        symbol,
                        AnomalyCode::ElevatedDailyRate,
                        format!(
                            "{} of {} trades anomalous on {} ({:.1}%)",
                            outliers,
                            total,
                            period,
                            rate * 100.0
                        ),
                    )
                    .with_severity(3),
                );
            }
        }

        anomalies
    }
}

#[async_trait]
impl AnomalyDetector for PriceDeviationDetector {
    fn register(&mut self, record: &TradeRecord) {
        self.registered.push(record.clone());
    }

    async fn evaluate_single(&mut self, record: &TradeRecord) -> Result<Vec<Anomaly>, IngestError> {
        let anomalies = self.check(record, self.live.get(&record.symbol));
        self.live.entry(record.symbol.clone()).or_default().push(record);
        Ok(anomalies)
    }

    async fn evaluate_first_pass(&mut self, source: SourceKind) -> Result<Vec<Anomaly>, IngestError> {
        let registered = std::mem::take(&mut self.registered);
        let anomalies = self.screen_batch(&registered);

        // Warm the live statistics so streaming evaluation can follow a backfill
        for record in &registered {
            self.live.entry(record.symbol.clone()).or_default().push(record);
        }

        log::info!(
            "🔍 First pass ({:?}): {} trades screened, {} anomalies",
            source,
            registered.len(),
            anomalies.len()
        );
        Ok(anomalies)
    }

    async fn evaluate_end_of_period(&mut self, period: NaiveDate) -> Result<Vec<Anomaly>, IngestError> {
        let reader = self.reader.as_ref().ok_or_else(|| {
            IngestError::Adapter("no trade reader attached for end-of-period analysis".to_string())
        })?;

        let trades = reader
            .trades_for_period(period)
            .map_err(|e| IngestError::Adapter(e.to_string()))?;

        let anomalies = self.screen_period(period, &trades);

        log::info!(
            "🔍 End of period {}: {} trades screened, {} anomalies",
            period,
            trades.len(),
            anomalies.len()
        );
        Ok(anomalies)
    }
}
