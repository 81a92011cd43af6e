//! Shared SQLite connection tuning
//!
//! Every connection opened by the crate goes through `apply_optimized_pragmas`
//! so the trade store, the read-only reader and the alert store agree on
//! journal mode and checkpoint behaviour.

use rusqlite::Connection;
use std::time::Duration;

pub const WAL_AUTOCHECKPOINT_PAGES: i64 = 1000;
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// WAL journal, NORMAL sync, in-memory temp store, 64MB cache, 1000-page checkpoint
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -64_000)?;
    conn.pragma_update(None, "wal_autocheckpoint", WAL_AUTOCHECKPOINT_PAGES)?;
    Ok(())
}
