use super::error::IngestError;
use super::retry::RetryPolicy;
use super::types::{Alert, Anomaly, AnomalySubject, Durability};
use crate::store::{AlertStore, FlagOutcome, TradeStore};

/// Turns anomalies into trade flags and alerts
///
/// Flags go to the primary store (strong durability, retried, surfaced on
/// failure). Alerts go to the secondary store with the configured
/// durability; a failed alert is returned as `AlertWrite` for the caller to
/// log and move on.
pub struct AlertDispatcher {
    store: Box<dyn AlertStore>,
    durability: Durability,
    retry: RetryPolicy,
}

impl AlertDispatcher {
    pub fn new(store: Box<dyn AlertStore>, durability: Durability, retry: RetryPolicy) -> Self {
        log::info!(
            "🚨 Alert dispatcher ready ({} backend, {:?} durability)",
            store.backend_type(),
            durability
        );
        Self {
            store,
            durability,
            retry,
        }
    }

    /// Mark the anomaly's trade as flagged
    ///
    /// Period subjects cannot be pinned to one record and are a no-op.
    /// Flagging an already-flagged trade is a no-op as well.
    pub async fn flag(
        &mut self,
        trades: &mut dyn TradeStore,
        anomaly: &Anomaly,
    ) -> Result<FlagOutcome, IngestError> {
        let id = match anomaly.subject {
            AnomalySubject::TradeId(id) => id,
            AnomalySubject::PeriodKey(_) => return Ok(FlagOutcome::NotApplicable),
        };

        let mut backoff = self.retry.backoff();
        loop {
            match trades.update_flag(id).await {
                Ok(FlagOutcome::NotFound) => {
                    log::warn!("⚠️  Anomaly references unknown trade {}, nothing flagged", id);
                    return Ok(FlagOutcome::NotFound);
                }
                Ok(outcome) => return Ok(outcome),
                Err(e) => backoff.retry_or(e).await?,
            }
        }
    }

    /// Write exactly one alert for the anomaly
    pub async fn alert(&mut self, anomaly: &Anomaly) -> Result<(), IngestError> {
        let alert = Alert::from(anomaly);

        let mut backoff = self.retry.backoff();
        loop {
            match self.store.insert_alert(&alert, self.durability).await {
                Ok(()) => {
                    log::info!(
                        "🚨 {} {} [{}] {}",
                        alert.error_code.as_str(),
                        alert.symbol,
                        describe_subject(&alert.subject),
                        alert.description
                    );
                    return Ok(());
                }
                Err(e) => backoff
                    .retry_or(e)
                    .await
                    .map_err(IngestError::into_alert_write)?,
            }
        }
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }
}

fn describe_subject(subject: &AnomalySubject) -> String {
    match subject {
        AnomalySubject::TradeId(id) => format!("trade {}", id),
        AnomalySubject::PeriodKey(date) => format!("day {}", date),
    }
}
