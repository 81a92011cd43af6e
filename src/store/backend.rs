//! Alert backend selection
//!
//! Routes alert writes to either the SQLite or the JSONL store based on
//! configuration.

use super::alerts::{AlertStore, SqliteAlertStore};
use super::jsonl_alerts::JsonlAlertStore;
use crate::ingest::error::IngestError;
use crate::ingest::types::{Alert, Durability};
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendType {
    Sqlite,
    Jsonl,
}

impl BackendType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "sqlite" => Some(BackendType::Sqlite),
            "jsonl" => Some(BackendType::Jsonl),
            _ => None,
        }
    }
}

/// Unified alert writer that routes to either backend
pub enum AlertBackend {
    Sqlite(SqliteAlertStore),
    Jsonl(JsonlAlertStore),
}

impl AlertBackend {
    pub fn open(backend: BackendType, path: impl AsRef<Path>) -> Result<Self, IngestError> {
        match backend {
            BackendType::Sqlite => Ok(AlertBackend::Sqlite(SqliteAlertStore::open(path)?)),
            BackendType::Jsonl => Ok(AlertBackend::Jsonl(JsonlAlertStore::open(path)?)),
        }
    }
}

#[async_trait]
impl AlertStore for AlertBackend {
    async fn insert_alert(&mut self, alert: &Alert, durability: Durability) -> Result<(), IngestError> {
        match self {
            AlertBackend::Sqlite(store) => store.insert_alert(alert, durability).await,
            AlertBackend::Jsonl(store) => store.insert_alert(alert, durability).await,
        }
    }

    fn backend_type(&self) -> &'static str {
        match self {
            AlertBackend::Sqlite(store) => store.backend_type(),
            AlertBackend::Jsonl(store) => store.backend_type(),
        }
    }
}
