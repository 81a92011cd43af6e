//! Secondary store for alerts
//!
//! Kept in a separate database from trades. Alert writes default to soft
//! durability: an abrupt crash may lose the most recent alerts, while the
//! trade flag written to the primary store survives.

use crate::ingest::error::IngestError;
use crate::ingest::types::{Alert, Durability};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;

#[async_trait]
pub trait AlertStore: Send {
    /// Insert exactly one alert
    async fn insert_alert(&mut self, alert: &Alert, durability: Durability) -> Result<(), IngestError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

pub struct SqliteAlertStore {
    conn: Connection,
    durability: Option<Durability>,
}

impl SqliteAlertStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, IngestError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS alerts (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                time        TEXT NOT NULL,
                trade_id    INTEGER,
                period_key  TEXT,
                description TEXT NOT NULL,
                reviewed    INTEGER NOT NULL DEFAULT 0,
                error_code  TEXT NOT NULL,
                severity    INTEGER NOT NULL DEFAULT 1,
                symbol      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_unreviewed ON alerts(reviewed, time DESC);
            CREATE INDEX IF NOT EXISTS idx_alerts_trade ON alerts(trade_id);",
        )?;

        log::info!("✅ Alert store initialized (SQLite)");

        Ok(Self {
            conn,
            durability: None,
        })
    }

    /// Switch the connection's sync level only when it changes
    fn set_durability(&mut self, durability: Durability) -> Result<(), IngestError> {
        if self.durability == Some(durability) {
            return Ok(());
        }
        let level = match durability {
            Durability::Soft => "OFF",
            Durability::Hard => "FULL",
        };
        self.conn.pragma_update(None, "synchronous", level)?;
        self.durability = Some(durability);
        Ok(())
    }
}

#[async_trait]
impl AlertStore for SqliteAlertStore {
    async fn insert_alert(&mut self, alert: &Alert, durability: Durability) -> Result<(), IngestError> {
        self.set_durability(durability)?;

        self.conn.execute(
            "INSERT INTO alerts
             (time, trade_id, period_key, description, reviewed, error_code, severity, symbol)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alert.time,
                alert.subject.trade_id(),
                alert.subject.period_key(),
                alert.description,
                alert.reviewed,
                alert.error_code.as_str(),
                alert.severity,
                alert.symbol,
            ],
        )?;

        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
