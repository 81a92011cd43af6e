//! tradesentry - trade ingestion with anomaly flagging
//!
//! - `ingest` - accumulator, alert dispatch, runtime driver
//! - `detector` - anomaly detection contract and reference detector
//! - `store` - SQLite trade store, alert stores
//! - `config` - environment configuration

pub mod config;
pub mod detector;
pub mod ingest;
pub mod sqlite_pragma;
pub mod store;
