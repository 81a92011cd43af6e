//! Persistence layer
//!
//! - `trades` - primary store (trades + symbols), staged writes and commits
//! - `reader` - read-only view of committed trades
//! - `alerts` / `jsonl_alerts` - secondary alert stores
//! - `backend` - alert backend selection

pub mod alerts;
pub mod backend;
pub mod jsonl_alerts;
pub mod reader;
pub mod trades;

pub use alerts::{AlertStore, SqliteAlertStore};
pub use backend::{AlertBackend, BackendType};
pub use jsonl_alerts::JsonlAlertStore;
pub use reader::SqliteTradeReader;
pub use trades::{FlagOutcome, SourceProgress, SqliteTradeStore, SymbolStore, TradeStore};
