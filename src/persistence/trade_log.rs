use crate::model::TradeRecord;
use anyhow::{Context, Result};
use csv::Writer;
use std::collections::VecDeque;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Append-only CSV of executed trades.
#[derive(Clone)]
pub struct TradeLog {
    path: PathBuf,
    writer: Arc<Mutex<Writer<File>>>,
}

impl TradeLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_dir_all(dir).context("Failed to create trade log directory")?;
        }

        let file_exists = path.exists()
            && std::fs::metadata(&path)
                .map(|m| m.len() > 0)
                .unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let writer = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn append(&self, record: &TradeRecord) -> Result<()> {
        let mut w = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("trade log writer is poisoned"))?;
        w.serialize(record).context("Failed to write trade record")?;
        w.flush().context("Failed to flush trade log")?;
        Ok(())
    }

    /// Newest `limit` trades, oldest first. Unparseable rows are skipped.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        if limit == 0 || !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let mut recent = VecDeque::with_capacity(limit);
        for row in reader.deserialize::<TradeRecord>() {
            match row {
                Ok(record) => {
                    if recent.len() == limit {
                        recent.pop_front();
                    }
                    recent.push_back(record);
                }
                Err(e) => log::warn!("[PERSIST] Skipping malformed trade row: {}", e),
            }
        }
        Ok(recent.into())
    }
}
