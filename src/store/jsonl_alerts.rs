use super::alerts::AlertStore;
use crate::ingest::error::IngestError;
use crate::ingest::types::{Alert, Durability};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only JSON-lines alert log
///
/// Soft writes leave the data in the OS page cache; hard writes `fsync`.
pub struct JsonlAlertStore {
    file: BufWriter<File>,
    path: PathBuf,
    written: u64,
}

impl JsonlAlertStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        log::info!("✅ Alert store initialized (JSONL: {})", path.display());

        Ok(Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl AlertStore for JsonlAlertStore {
    async fn insert_alert(&mut self, alert: &Alert, durability: Durability) -> Result<(), IngestError> {
        let json = serde_json::to_string(alert)?;
        writeln!(self.file, "{}", json)?;
        self.file.flush()?;

        if durability == Durability::Hard {
            self.file.get_ref().sync_data()?;
        }

        self.written += 1;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}
