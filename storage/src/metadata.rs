use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::object::StorageObject;
use crate::{Result, StorageError};

const SNAPSHOT_FILE: &str = "objects.json";
const LOG_FILE: &str = "objects.wal";

/// One line of the metadata log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub(crate) enum LogRecord {
    Upsert { object: StorageObject },
    Remove { key: String },
}

impl LogRecord {
    fn apply(self, index: &mut HashMap<String, StorageObject>) {
        match self {
            LogRecord::Upsert { object } => {
                index.insert(object.key.clone(), object);
            }
            LogRecord::Remove { key } => {
                index.remove(&key);
            }
        }
    }
}

struct LogWriter {
    file: File,
    records: usize,
}

/// Append-only metadata log on top of a periodically compacted snapshot.
///
/// The index on disk is `objects.json` (a full key -> object map) followed by
/// every record in `objects.wal`. Replaying records is idempotent, so a record
/// that is already reflected in the snapshot does no harm.
pub(crate) struct MetadataLog {
    dir: PathBuf,
    writer: Mutex<LogWriter>,
    sync_writes: bool,
}

impl MetadataLog {
    /// Opens the log in `dir` and returns it with the recovered index.
    pub async fn open<P: AsRef<Path>>(
        dir: P,
        sync_writes: bool,
    ) -> Result<(Self, HashMap<String, StorageObject>)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let mut index = load_snapshot(&dir.join(SNAPSHOT_FILE)).await?;
        let (records, torn) = replay_log(&dir.join(LOG_FILE), &mut index).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .await?;

        tracing::info!(
            "Recovered {} objects from {:?} ({} log records)",
            index.len(),
            dir,
            records
        );

        let log = Self {
            dir,
            writer: Mutex::new(LogWriter { file, records }),
            sync_writes,
        };

        if torn {
            // Later appends would land behind the torn line and never be replayed.
            log.compact(|| index.clone()).await?;
        }

        Ok((log, index))
    }

    /// Appends `record` and returns the number of records since the last
    /// compaction.
    pub async fn append(&self, record: &LogRecord) -> Result<usize> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.file.write_all(&line).await?;
        writer.file.flush().await?;
        if self.sync_writes {
            writer.file.sync_data().await?;
        }
        writer.records += 1;

        Ok(writer.records)
    }

    /// Writes the index returned by `snapshot` as the new snapshot and
    /// truncates the log.
    ///
    /// `snapshot` runs with the writer locked, so no append can slip between
    /// taking the snapshot and truncating the log it supersedes.
    pub async fn compact<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> HashMap<String, StorageObject>,
    {
        let mut writer = self.writer.lock().await;
        let index = snapshot();

        let data = serde_json::to_vec_pretty(&index)?;
        let tmp_path = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&data).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, self.dir.join(SNAPSHOT_FILE)).await?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.dir.join(LOG_FILE))
            .await?;
        writer.file = file;
        writer.records = 0;

        tracing::debug!("Compacted metadata snapshot with {} objects", index.len());
        Ok(())
    }
}

async fn load_snapshot(path: &Path) -> Result<HashMap<String, StorageObject>> {
    match fs::read(path).await {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| {
            StorageError::Corruption(format!("unreadable snapshot {:?}: {}", path, e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(StorageError::Io(e)),
    }
}

async fn replay_log(
    path: &Path,
    index: &mut HashMap<String, StorageObject>,
) -> Result<(usize, bool)> {
    let data = match fs::read(path).await {
        Ok(data) => String::from_utf8_lossy(&data).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, false)),
        Err(e) => return Err(StorageError::Io(e)),
    };

    let mut applied = 0;
    for (line_no, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => {
                record.apply(index);
                applied += 1;
            }
            Err(e) => {
                // A crash mid-append leaves a torn last line; nothing after it is trusted.
                tracing::warn!("Stopping metadata replay at line {}: {}", line_no + 1, e);
                return Ok((applied, true));
            }
        }
    }

    Ok((applied, false))
}
