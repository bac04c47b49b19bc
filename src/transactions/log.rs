//! Durable, append-only transaction log on the local file system.
//!
//! Record `k` lives at `volume-<n>/chapter-<m>/tx-<k>` where
//! `n = k / (records_per_chapter * chapters_per_volume)` and `m = k / records_per_chapter`.
//! Records are written to a staging file, synced, and renamed into place, so a record file is
//! either complete or absent.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::core::{current_millis, CallerContext, RecordMetadata, Statement};
use crate::error::{Error, Result};
use crate::transactions::codec::TransactionCodec;
use crate::transactions::record::{RecordListener, TransactionRecord};

const STAGING_FILE: &str = "current";
const VOLUME_PREFIX: &str = "volume-";
const CHAPTER_PREFIX: &str = "chapter-";
const RECORD_PREFIX: &str = "tx-";

/// Sharding of record files into directories
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardLayout {
    pub records_per_chapter: u64,
    pub chapters_per_volume: u64,
}

impl Default for ShardLayout {
    fn default() -> Self {
        Self { records_per_chapter: 1000, chapters_per_volume: 1000 }
    }
}

impl ShardLayout {
    pub fn relative_path(&self, index: u64) -> PathBuf {
        let records_per_chapter = self.records_per_chapter.max(1);
        let records_per_volume = records_per_chapter * self.chapters_per_volume.max(1);
        PathBuf::from(format!("{}{}", VOLUME_PREFIX, index / records_per_volume))
            .join(format!("{}{}", CHAPTER_PREFIX, index / records_per_chapter))
            .join(format!("{}{}", RECORD_PREFIX, index))
    }
}

struct PendingRecord {
    record: TransactionRecord,
    /// whether a caller already supplied the record's user
    claimed: bool,
}

struct LogState {
    size: u64,
    pending: Option<PendingRecord>,
}

pub struct LocalTransactionLog {
    directory: PathBuf,
    layout: ShardLayout,
    codec: Box<dyn TransactionCodec>,
    state: Mutex<LogState>,
}

impl LocalTransactionLog {
    pub fn new(directory: impl AsRef<Path>, codec: Box<dyn TransactionCodec>) -> Result<Self> {
        Self::with_layout(directory, codec, ShardLayout::default())
    }

    /// Open (or create) a log; removes an interrupted staging file and recounts the records
    pub fn with_layout(
        directory: impl AsRef<Path>,
        codec: Box<dyn TransactionCodec>,
        layout: ShardLayout,
    ) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let staging = directory.join(STAGING_FILE);
        if staging.exists() {
            warn!("Removing incomplete transaction record {}", staging.display());
            fs::remove_file(&staging)?;
        }

        let log = Self {
            directory,
            layout,
            codec,
            state: Mutex::new(LogState { size: 0, pending: None }),
        };
        let (size, last) = log.count_records()?;
        if let Some(last) = last.filter(|last| last + 1 != size) {
            return Err(Error::CorruptLog(format!(
                "{} records found in {} but the last one is record {}",
                size,
                log.directory.display(),
                last
            )));
        }
        log.state()?.size = size;
        info!("Transaction log {} contains {} records", log.directory.display(), size);
        Ok(log)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn record_path(&self, index: u64) -> PathBuf {
        self.directory.join(self.layout.relative_path(index))
    }

    /// Number of durably committed records
    pub fn size(&self) -> u64 {
        self.state().map(|state| state.size).unwrap_or(0)
    }

    pub fn on_begin(&self, metadata: &RecordMetadata) -> Result<()> {
        let mut state = self.state()?;
        if state.pending.is_some() {
            warn!("Discarding unfinished transaction record");
        }
        state.pending = Some(PendingRecord { record: TransactionRecord::new(metadata), claimed: false });
        Ok(())
    }

    /// Attach a caller's identity to the open record. The first caller becomes the record's user;
    /// commit messages of later callers are appended.
    pub fn on_metadata(&self, context: &CallerContext) -> Result<()> {
        let mut state = self.state()?;
        let pending = state
            .pending
            .as_mut()
            .ok_or_else(|| Error::Store("No open transaction record".into()))?;
        if !pending.claimed {
            pending.record.user_id = context.user_id.clone();
            pending.record.user_name = context.user_name.clone();
            pending.claimed = true;
        }
        if let Some(message) = &context.commit_message {
            pending.record.append_commit_message(message);
        }
        Ok(())
    }

    pub fn on_add(&self, statement: &Statement) -> Result<()> {
        if let Some(pending) = self.state()?.pending.as_mut() {
            pending.record.on_add(statement);
        }
        Ok(())
    }

    pub fn on_delete(&self, statement: &Statement) -> Result<()> {
        if let Some(pending) = self.state()?.pending.as_mut() {
            pending.record.on_delete(statement);
        }
        Ok(())
    }

    pub fn on_abort(&self) {
        if let Ok(mut state) = self.state() {
            state.pending = None;
        }
    }

    /// Persist the open record. Returns its sequence number, or `None` when the transaction
    /// changed nothing.
    pub fn on_commit(&self) -> Result<Option<u64>> {
        let mut state = self.state()?;
        let Some(pending) = state.pending.take() else {
            return Ok(None);
        };
        let mut record = pending.record;
        if record.is_empty() {
            debug!("Nothing changed, no transaction record written");
            return Ok(None);
        }
        record.commit_timestamp = current_millis();

        let index = state.size;
        let target = self.record_path(index);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = self.directory.join(STAGING_FILE);
        let file = File::create(&staging)?;
        let mut writer = BufWriter::new(file);
        self.codec.write(&record, &mut writer)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staging, &target)?;

        state.size = index + 1;
        debug!(
            "Wrote transaction record {} (+{} -{})",
            index,
            record.added.len(),
            record.deleted.len()
        );
        Ok(Some(index))
    }

    pub fn read_record(&self, index: u64) -> Result<TransactionRecord> {
        let size = self.size();
        if index >= size {
            return Err(Error::InvalidRequest(format!(
                "Record {} does not exist, the log holds {} records",
                index, size
            )));
        }
        let mut file = File::open(self.record_path(index))?;
        self.codec.read(&mut file)
    }

    /// Replay record `index` into `listener`
    pub fn read(&self, index: u64, listener: &mut dyn RecordListener) -> Result<()> {
        self.read_record(index)?.replay(listener)
    }

    fn state(&self) -> Result<MutexGuard<'_, LogState>> {
        self.state.lock().map_err(|_| Error::Store("transaction log state poisoned".into()))
    }

    /// Number of record files and the highest sequence number among them
    fn count_records(&self) -> Result<(u64, Option<u64>)> {
        let mut count = 0;
        let mut last = None;
        for (volume, _) in prefixed_entries(&self.directory, VOLUME_PREFIX)? {
            for (chapter, _) in prefixed_entries(&volume, CHAPTER_PREFIX)? {
                for (_, index) in prefixed_entries(&chapter, RECORD_PREFIX)? {
                    count += 1;
                    last = last.max(Some(index));
                }
            }
        }
        Ok((count, last))
    }
}

/// Entries of `directory` named `<prefix><number>`
fn prefixed_entries(directory: &Path, prefix: &str) -> Result<Vec<(PathBuf, u64)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let number = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(prefix))
            .and_then(|suffix| suffix.parse::<u64>().ok());
        if let Some(number) = number {
            entries.push((path, number));
        }
    }
    Ok(entries)
}
