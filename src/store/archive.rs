//! Archive sinks for the retention engine.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::Result;
use crate::store::{ArchiveSink, Reading, RollupBucket};

/// Writes archived units as JSON-lines files under a base directory. The
/// entry id names the file, so re-exporting after a partial failure
/// overwrites the previous attempt.
#[derive(Debug)]
pub struct FsArchiveSink {
    base_dir: PathBuf,
}

impl FsArchiveSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    async fn write_lines<T: serde::Serialize>(&self, entry_id: &str, items: &[T]) -> Result<String> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.base_dir.join(format!("{entry_id}.jsonl"));
        let mut body = String::new();
        for item in items {
            body.push_str(&serde_json::to_string(item)?);
            body.push('\n');
        }
        tokio::fs::write(&path, body).await?;
        Ok(path.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl ArchiveSink for FsArchiveSink {
    async fn export_readings(&self, entry_id: &str, readings: &[Reading]) -> Result<String> {
        self.write_lines(entry_id, readings).await
    }

    async fn export_buckets(&self, entry_id: &str, buckets: &[RollupBucket]) -> Result<String> {
        self.write_lines(entry_id, buckets).await
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemoryArchiveSink {
    pub readings: Mutex<HashMap<String, Vec<Reading>>>,
    pub buckets: Mutex<HashMap<String, Vec<RollupBucket>>>,
}

impl MemoryArchiveSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reading_entry_count(&self) -> usize {
        self.readings.lock().len()
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchiveSink {
    async fn export_readings(&self, entry_id: &str, readings: &[Reading]) -> Result<String> {
        self.readings
            .lock()
            .insert(entry_id.to_string(), readings.to_vec());
        Ok(format!("mem://readings/{entry_id}"))
    }

    async fn export_buckets(&self, entry_id: &str, buckets: &[RollupBucket]) -> Result<String> {
        self.buckets
            .lock()
            .insert(entry_id.to_string(), buckets.to_vec());
        Ok(format!("mem://buckets/{entry_id}"))
    }
}
