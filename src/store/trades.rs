//! Primary store: trades and symbols
//!
//! Writes are staged inside one open SQLite transaction and only become
//! durable on `commit()`. A connection dropped with an open transaction rolls
//! back, so after a crash `highest_persisted_id()` reflects committed rows
//! only.
//!
//! SQLite may roll back the whole open transaction by itself (disk full, I/O
//! errors). Once anything has been staged, the store notices the connection
//! is back in autocommit and reports `StagedWritesLost` from every write and
//! from the next `commit()`, instead of starting a fresh transaction over the
//! gap.

use crate::ingest::error::IngestError;
use crate::ingest::types::{Symbol, TradeRecord};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of a flag update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOutcome {
    Flagged,
    AlreadyFlagged,
    /// No record with that identity has been stored
    NotFound,
    /// Period-level subject, nothing to flag
    NotApplicable,
}

/// How far a source batch got in earlier runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceProgress {
    /// Trades carrying the source hash
    pub stored_trades: u64,
    /// Every trade of the source was committed
    pub completed: bool,
}

/// Trade persistence consumed by the accumulator
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Highest committed trade id, 0 when the table is empty
    async fn highest_persisted_id(&self) -> Result<i64, IngestError>;

    /// Stage all records in one batch (not committed)
    async fn bulk_insert(&mut self, records: &[TradeRecord]) -> Result<(), IngestError>;

    /// One-way `flagged = true` transition
    async fn update_flag(&mut self, id: i64) -> Result<FlagOutcome, IngestError>;

    /// Make sure staged writes sit in an open transaction
    async fn stage_without_commit(&mut self) -> Result<(), IngestError>;

    /// Durably finalize everything staged since the last commit
    async fn commit(&mut self) -> Result<(), IngestError>;

    /// Stored trades and completion marker for a source content hash
    async fn source_progress(&self, content_hash: &str) -> Result<SourceProgress, IngestError>;

    /// Stage the completion marker for a source (durable on `commit()`)
    async fn mark_source_complete(&mut self, content_hash: &str) -> Result<(), IngestError>;
}

/// Master-data store for symbols
#[async_trait]
pub trait SymbolStore: Send {
    /// Idempotent get-or-create; uniqueness is enforced by the table
    async fn get_or_create_symbol(&mut self, name: &str) -> Result<Symbol, IngestError>;
}

struct StoreConn {
    conn: Connection,
    /// Writes are pending in the open transaction
    staged: bool,
}

impl StoreConn {
    fn ensure_transaction_intact(&self) -> Result<(), IngestError> {
        if self.staged && self.conn.is_autocommit() {
            return Err(IngestError::StagedWritesLost(
                "SQLite rolled back the open transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn begin_if_needed(&self) -> Result<(), IngestError> {
        self.ensure_transaction_intact()?;
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }

    /// Classify a failed write, escalating when it took staged work with it
    fn write_failed(&self, err: rusqlite::Error) -> IngestError {
        match self.ensure_transaction_intact() {
            Err(IngestError::StagedWritesLost(reason)) => {
                IngestError::StagedWritesLost(format!("{} after: {}", reason, err))
            }
            _ => err.into(),
        }
    }
}

/// SQLite-backed trade and symbol store
///
/// Clones share one connection, so symbol creation joins whatever trade
/// transaction is currently open.
pub struct SqliteTradeStore {
    db: Arc<Mutex<StoreConn>>,
}

impl SqliteTradeStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, IngestError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        create_schema(&conn)?;

        log::info!("✅ Trade store initialized with WAL mode");

        Ok(Self {
            db: Arc::new(Mutex::new(StoreConn {
                conn,
                staged: false,
            })),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreConn>, IngestError> {
        self.db
            .lock()
            .map_err(|_| IngestError::Database("trade store connection poisoned".to_string()))
    }

    /// Load one stored trade (staged rows are visible on this connection)
    pub fn get(&self, id: i64) -> Result<Option<TradeRecord>, IngestError> {
        let db = self.lock()?;
        let record = db
            .conn
            .query_row(
                "SELECT id, price, size, bid, ask, symbol_name, timestamp,
                        analysis_date, source_hash, flagged
                 FROM trades WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Whether a transaction is currently open
    pub fn has_staged_writes(&self) -> Result<bool, IngestError> {
        Ok(!self.lock()?.conn.is_autocommit())
    }
}

impl Clone for SqliteTradeStore {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

fn create_schema(conn: &Connection) -> Result<(), IngestError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS symbols (
            name TEXT PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS trades (
            id            INTEGER PRIMARY KEY,
            price         REAL NOT NULL,
            size          REAL NOT NULL,
            bid           REAL NOT NULL,
            ask           REAL NOT NULL,
            symbol_name   TEXT NOT NULL REFERENCES symbols(name),
            flagged       INTEGER NOT NULL DEFAULT 0,
            timestamp     TEXT NOT NULL,
            analysis_date TEXT NOT NULL,
            source_hash   TEXT
        );
        CREATE TABLE IF NOT EXISTS sources (
            hash         TEXT PRIMARY KEY,
            completed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trades_analysis_date ON trades(analysis_date, symbol_name);
        CREATE INDEX IF NOT EXISTS idx_trades_source_hash ON trades(source_hash);",
    )?;
    Ok(())
}

pub(crate) fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
    Ok(TradeRecord {
        id: row.get(0)?,
        price: row.get(1)?,
        size: row.get(2)?,
        bid: row.get(3)?,
        ask: row.get(4)?,
        symbol: row.get(5)?,
        timestamp: row.get::<_, DateTime<Utc>>(6)?,
        analysis_date: row.get::<_, NaiveDate>(7)?,
        source_hash: row.get(8)?,
        flagged: row.get(9)?,
    })
}

fn insert_batch(conn: &mut Connection, records: &[TradeRecord]) -> rusqlite::Result<()> {
    // A failed batch rolls back to here, so a retry never sees half of it
    let batch = conn.savepoint()?;
    {
        let mut stmt = batch.prepare_cached(
            "INSERT INTO trades
             (id, price, size, bid, ask, symbol_name, flagged, timestamp, analysis_date, source_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;

        for record in records {
            stmt.execute(params![
                record.id,
                record.price,
                record.size,
                record.bid,
                record.ask,
                record.symbol,
                record.flagged,
                record.timestamp,
                record.analysis_date,
                record.source_hash,
            ])?;
        }
    }
    batch.commit()
}

fn set_flag(conn: &Connection, id: i64) -> rusqlite::Result<FlagOutcome> {
    let current: Option<bool> = conn
        .query_row("SELECT flagged FROM trades WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;

    match current {
        None => Ok(FlagOutcome::NotFound),
        Some(true) => Ok(FlagOutcome::AlreadyFlagged),
        Some(false) => {
            conn.execute("UPDATE trades SET flagged = 1 WHERE id = ?1", params![id])?;
            Ok(FlagOutcome::Flagged)
        }
    }
}

#[async_trait]
impl TradeStore for SqliteTradeStore {
    async fn highest_persisted_id(&self) -> Result<i64, IngestError> {
        let db = self.lock()?;
        let id: i64 = db
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM trades", [], |row| row.get(0))?;
        Ok(id)
    }

    async fn bulk_insert(&mut self, records: &[TradeRecord]) -> Result<(), IngestError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut db = self.lock()?;
        db.begin_if_needed()?;

        if let Err(e) = insert_batch(&mut db.conn, records) {
            return Err(db.write_failed(e));
        }
        db.staged = true;

        log::debug!("✅ Staged {} trades", records.len());
        Ok(())
    }

    async fn update_flag(&mut self, id: i64) -> Result<FlagOutcome, IngestError> {
        let mut db = self.lock()?;
        db.begin_if_needed()?;

        match set_flag(&db.conn, id) {
            Ok(outcome) => {
                if outcome == FlagOutcome::Flagged {
                    db.staged = true;
                }
                Ok(outcome)
            }
            Err(e) => Err(db.write_failed(e)),
        }
    }

    async fn stage_without_commit(&mut self) -> Result<(), IngestError> {
        self.lock()?.begin_if_needed()
    }

    async fn commit(&mut self) -> Result<(), IngestError> {
        let mut db = self.lock()?;
        if let Err(lost) = db.ensure_transaction_intact() {
            // Reported once; the next transaction starts clean
            db.staged = false;
            return Err(lost);
        }

        if !db.conn.is_autocommit() {
            if let Err(e) = db.conn.execute_batch("COMMIT") {
                return Err(db.write_failed(e));
            }
            log::debug!("✅ Committed staged trades");
        }
        db.staged = false;
        Ok(())
    }

    async fn source_progress(&self, content_hash: &str) -> Result<SourceProgress, IngestError> {
        let db = self.lock()?;
        let stored_trades: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE source_hash = ?1",
            params![content_hash],
            |row| row.get(0),
        )?;
        let completed = db
            .conn
            .prepare_cached("SELECT 1 FROM sources WHERE hash = ?1")?
            .exists(params![content_hash])?;

        Ok(SourceProgress {
            stored_trades: stored_trades as u64,
            completed,
        })
    }

    async fn mark_source_complete(&mut self, content_hash: &str) -> Result<(), IngestError> {
        let mut db = self.lock()?;
        db.begin_if_needed()?;

        let result = db.conn.execute(
            "INSERT OR REPLACE INTO sources (hash, completed_at) VALUES (?1, ?2)",
            params![content_hash, Utc::now()],
        );
        if let Err(e) = result {
            return Err(db.write_failed(e));
        }
        db.staged = true;
        Ok(())
    }
}

#[async_trait]
impl SymbolStore for SqliteTradeStore {
    async fn get_or_create_symbol(&mut self, name: &str) -> Result<Symbol, IngestError> {
        let mut db = self.lock()?;
        db.ensure_transaction_intact()?;

        let inserted = match db
            .conn
            .execute("INSERT OR IGNORE INTO symbols (name) VALUES (?1)", params![name])
        {
            Ok(inserted) => inserted,
            Err(e) => return Err(db.write_failed(e)),
        };
        if inserted > 0 {
            log::debug!("➕ Registered symbol {}", name);
            // Inside an open transaction the new row is only staged
            if !db.conn.is_autocommit() {
                db.staged = true;
            }
        }
        Ok(Symbol {
            name: name.to_string(),
        })
    }
}
