//! Trade ingestion pipeline
//!
//! ```text
//! reader ──mpsc──► run_ingestion ──► IngestionAccumulator
//!                                       ├─ SymbolResolver ──► symbols
//!                                       ├─ buffer ──flush──► trades
//!                                       ├─ AnomalyDetector
//!                                       └─ AlertDispatcher ──► flag (trades)
//!                                                          └─► alert (alert store)
//! ```

pub mod accumulator;
pub mod dispatcher;
pub mod error;
pub mod hashing;
pub mod progress;
pub mod retry;
pub mod runtime;
pub mod source;
pub mod symbols;
pub mod types;

pub use accumulator::{AccumulatorConfig, AddOutcome, DispatchSummary, Evaluation, IngestionAccumulator};
pub use dispatcher::AlertDispatcher;
pub use error::IngestError;
pub use progress::{ConsoleProgress, LogProgress, NoProgress, ProgressSink};
pub use runtime::{build_accumulator, run_ingestion, IngestMessage, IngestOptions, IngestReport};
pub use source::{open_trade_file, read_trades, ReadStats};
pub use symbols::SymbolResolver;
pub use types::{Alert, Anomaly, AnomalyCode, AnomalySubject, Durability, SourceKind, Trade, TradeRecord};
