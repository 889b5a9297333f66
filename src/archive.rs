//! Submission snapshot archive
//!
//! Each median batch archives the raw submissions that contributed to it.
//! The archive returns a content id that is stored on the batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Batch cid when no archive is configured
pub const LOCAL_SKIP_UPLOAD: &str = "LOCAL_SKIP_UPLOAD";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Empty snapshot")]
    Empty,

    #[error("Snapshot encoding failed: {0}")]
    Encode(#[from] csv::Error),

    #[error("Snapshot write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One archived submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub submission_id: Uuid,
    pub provider: Address,
    pub feed_timestamp: i64,
    pub created_datetime: DateTime<Utc>,
    pub json_content: String,
}

#[async_trait]
pub trait SnapshotArchive: Send + Sync {
    /// Persist the snapshot and return its content id
    async fn archive(&self, entries: &[SnapshotEntry]) -> Result<String, ArchiveError>;
}

/// Content-addressed CSV files under `<data_dir>/snapshots`
pub struct CsvSnapshotArchive {
    dir: PathBuf,
}

impl CsvSnapshotArchive {
    pub fn new(data_dir: &str) -> Result<Self, ArchiveError> {
        let dir = PathBuf::from(data_dir).join("snapshots");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_of(&self, cid: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", cid))
    }

    fn encode(entries: &[SnapshotEntry]) -> Result<Vec<u8>, ArchiveError> {
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
        for entry in entries {
            writer.serialize(entry)?;
        }
        writer
            .into_inner()
            .map_err(|e| ArchiveError::Io(e.into_error()))
    }
}

#[async_trait]
impl SnapshotArchive for CsvSnapshotArchive {
    async fn archive(&self, entries: &[SnapshotEntry]) -> Result<String, ArchiveError> {
        if entries.is_empty() {
            return Err(ArchiveError::Empty);
        }
        let bytes = Self::encode(entries)?;
        let cid = hex::encode(Sha256::digest(&bytes));
        let path = self.path_of(&cid);
        tokio::fs::write(&path, &bytes).await?;

        tracing::info!(
            cid = %cid,
            submissions = entries.len(),
            path = %path.display(),
            "Archived submission snapshot"
        );
        Ok(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> SnapshotEntry {
        SnapshotEntry {
            submission_id: Uuid::new_v4(),
            provider: Address::repeat_byte(byte),
            feed_timestamp: 1_700_000_000,
            created_datetime: Utc::now(),
            json_content: r#"{"quotes":{"USDBTC":"0.0000155"}}"#.to_string(),
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("tab-oracle-archive-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn archive_writes_content_addressed_file() {
        let dir = temp_dir();
        let archive = CsvSnapshotArchive::new(dir.to_str().unwrap()).unwrap();
        let entries = vec![entry(1), entry(2)];

        let cid = archive.archive(&entries).await.unwrap();
        assert_eq!(cid.len(), 64);

        let written = std::fs::read(archive.path_of(&cid)).unwrap();
        assert_eq!(hex::encode(Sha256::digest(&written)), cid);

        let mut reader = csv::Reader::from_reader(written.as_slice());
        let rows: Vec<SnapshotEntry> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].provider, Address::repeat_byte(2));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn empty_snapshot_is_rejected() {
        let dir = temp_dir();
        let archive = CsvSnapshotArchive::new(dir.to_str().unwrap()).unwrap();
        assert!(matches!(archive.archive(&[]).await, Err(ArchiveError::Empty)));
        std::fs::remove_dir_all(dir).ok();
    }
}
