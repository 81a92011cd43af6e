use rusqlite::ErrorCode;

/// Errors raised while ingesting, persisting, and alerting
///
/// Classification decides what the caller does next:
/// - `TransientStore` - retry the operation with backoff, keep the buffer
/// - `Integrity` - fatal for the current batch, buffer kept for recovery
/// - `StagedWritesLost` - SQLite dropped the open transaction; everything
///   flushed since the last commit is gone and the session must restart
/// - `Adapter` - isolated to the failing detector call
/// - `AlertWrite` - logged and ignored (alerts are advisory)
#[derive(Debug)]
pub enum IngestError {
    TransientStore(String),
    Integrity(String),
    StagedWritesLost(String),
    Adapter(String),
    AlertWrite(String),
    Database(String),
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl IngestError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::TransientStore(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Integrity(_)
                | IngestError::StagedWritesLost(_)
                | IngestError::Database(_)
                | IngestError::TransientStore(_)
        )
    }

    /// Re-label a store failure as an alert write failure
    pub fn into_alert_write(self) -> Self {
        match self {
            IngestError::AlertWrite(msg) => IngestError::AlertWrite(msg),
            other => IngestError::AlertWrite(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull,
            ) => IngestError::TransientStore(err.to_string()),
            Some(ErrorCode::ConstraintViolation) => IngestError::Integrity(err.to_string()),
            _ => IngestError::Database(err.to_string()),
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Io(err)
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Serialization(err)
    }
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::TransientStore(e) => write!(f, "Transient store error: {}", e),
            IngestError::Integrity(e) => write!(f, "Integrity error: {}", e),
            IngestError::StagedWritesLost(e) => write!(f, "Staged writes lost: {}", e),
            IngestError::Adapter(e) => write!(f, "Anomaly detector error: {}", e),
            IngestError::AlertWrite(e) => write!(f, "Alert write failed: {}", e),
            IngestError::Database(e) => write!(f, "Database error: {}", e),
            IngestError::Io(e) => write!(f, "IO error: {}", e),
            IngestError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}
