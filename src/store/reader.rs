//! Read-only access to committed trades
//!
//! Opens its own connection in `query_only` mode, so it never sees rows the
//! accumulator has staged but not yet committed.

use super::trades::row_to_record;
use crate::ingest::error::IngestError;
use crate::ingest::types::TradeRecord;
use crate::sqlite_pragma::apply_optimized_pragmas;
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use std::path::Path;

pub struct SqliteTradeReader {
    conn: Connection,
}

impl SqliteTradeReader {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let conn = Connection::open(db_path)?;

        apply_optimized_pragmas(&conn)?;

        // Enable read-only mode to prevent write locks (must be after PRAGMAs)
        conn.execute_batch("PRAGMA query_only = ON")?;

        Ok(Self { conn })
    }

    /// Committed trades stamped with `period`, in identity order
    pub fn trades_for_period(&self, period: NaiveDate) -> Result<Vec<TradeRecord>, IngestError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, price, size, bid, ask, symbol_name, timestamp,
                    analysis_date, source_hash, flagged
             FROM trades
             WHERE analysis_date = ?1
             ORDER BY id ASC",
        )?;

        let trades = stmt
            .query_map(params![period], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!("📥 Read {} committed trades for {}", trades.len(), period);
        Ok(trades)
    }
}
