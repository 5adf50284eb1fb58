use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

use crate::metadata::{LogRecord, MetadataLog};
use crate::object::{generate_id, ReplicaInfo, StorageObject};
use crate::{Result, StorageError, StoreStats};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Number of striped key locks.
    pub lock_stripes: usize,
    /// Log records after which the snapshot is rewritten.
    pub compact_after: usize,
    /// fsync payload files and log appends.
    pub sync_writes: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_stripes: 64,
            compact_after: 1000,
            sync_writes: true,
        }
    }
}

/// Local object store: one payload file per object version under `root`,
/// plus an in-memory index made durable by a [`MetadataLog`].
///
/// Operations on the same key are serialized by a striped lock held across
/// file I/O and the log append. The index lock itself is only held for map
/// updates, so operations on unrelated keys proceed concurrently.
pub struct ObjectStore {
    root: PathBuf,
    node_id: String,
    index: RwLock<HashMap<String, StorageObject>>,
    stripes: Vec<Mutex<()>>,
    log: MetadataLog,
    options: StoreOptions,
}

impl ObjectStore {
    pub async fn open<P: AsRef<Path>>(root: P, node_id: &str, options: StoreOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let (log, index) = MetadataLog::open(root.join("metadata"), options.sync_writes).await?;
        let stripes = (0..options.lock_stripes.max(1)).map(|_| Mutex::new(())).collect();

        tracing::info!("Object store opened at {:?} with {} objects", root, index.len());

        Ok(Self {
            root,
            node_id: node_id.to_string(),
            index: RwLock::new(index),
            stripes,
            log,
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn put<R>(&self, key: &str, payload: R, content_type: &str) -> Result<StorageObject>
    where
        R: AsyncRead + Unpin,
    {
        self.put_with_metadata(key, payload, content_type, HashMap::new()).await
    }

    /// Streams `payload` into a new backing file, hashing it in the same pass,
    /// then publishes the descriptor under `key`.
    ///
    /// A previous version under the same key is replaced in the index; its
    /// backing file is left on disk.
    pub async fn put_with_metadata<R>(
        &self,
        key: &str,
        payload: R,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<StorageObject>
    where
        R: AsyncRead + Unpin,
    {
        self.write_object(key, payload, content_type, metadata, None).await
    }

    /// Like [`put_with_metadata`](Self::put_with_metadata), but the object is
    /// only published if the streamed bytes hash to `expected_checksum`.
    /// On a mismatch the new file is removed and any previous version under
    /// `key` stays in place.
    pub async fn put_verified<R>(
        &self,
        key: &str,
        payload: R,
        content_type: &str,
        metadata: HashMap<String, String>,
        expected_checksum: &str,
    ) -> Result<StorageObject>
    where
        R: AsyncRead + Unpin,
    {
        self.write_object(key, payload, content_type, metadata, Some(expected_checksum))
            .await
    }

    async fn write_object<R>(
        &self,
        key: &str,
        mut payload: R,
        content_type: &str,
        metadata: HashMap<String, String>,
        expected_checksum: Option<&str>,
    ) -> Result<StorageObject>
    where
        R: AsyncRead + Unpin,
    {
        let _guard = self.lock_key(key).await;

        let now = Utc::now();
        let id = generate_id(key, now);
        let path = self.root.join(&id);

        let (size, checksum) = match self.write_payload(&path, &mut payload).await {
            Ok(written) => written,
            Err(e) => {
                remove_quietly(&path).await;
                return Err(StorageError::Io(e));
            }
        };

        if let Some(expected) = expected_checksum {
            if !expected.eq_ignore_ascii_case(&checksum) {
                remove_quietly(&path).await;
                return Err(StorageError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: checksum,
                });
            }
        }

        let object = StorageObject::new(
            id,
            key,
            size,
            content_type,
            checksum,
            metadata,
            ReplicaInfo::local(&self.node_id, &path),
            now,
        );

        let previous = self.index_write().insert(key.to_string(), object.clone());

        let record = LogRecord::Upsert { object: object.clone() };
        if let Err(e) = self.append(&record).await {
            {
                let mut index = self.index_write();
                match previous {
                    Some(previous) => index.insert(key.to_string(), previous),
                    None => index.remove(key),
                };
            }
            remove_quietly(&path).await;
            return Err(e);
        }

        tracing::info!("Stored object {} as {} ({} bytes)", key, object.id, size);
        Ok(object)
    }

    /// Opens the payload of `key` for reading.
    ///
    /// Every call counts as an access: the updated statistics are logged
    /// before the file is handed out.
    pub async fn get(&self, key: &str) -> Result<(File, StorageObject)> {
        let _guard = self.lock_key(key).await;

        let object = {
            let mut index = self.index_write();
            let object = index
                .get_mut(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            object.record_access(Utc::now());
            object.clone()
        };

        let record = LogRecord::Upsert { object: object.clone() };
        if let Err(e) = self.append(&record).await {
            tracing::warn!("Failed to persist access statistics for {}: {}", key, e);
        }

        let file = File::open(self.payload_path(&object)).await?;
        Ok((file, object))
    }

    /// Descriptor lookup that does not count as an access.
    pub fn head(&self, key: &str) -> Result<StorageObject> {
        self.index_read()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    /// Opens a fresh read handle on the payload described by `object`.
    pub async fn open_payload(&self, object: &StorageObject) -> Result<File> {
        Ok(File::open(self.payload_path(object)).await?)
    }

    /// Removes the index entry for `key` and every backing file it lists.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock_key(key).await;

        let object = self
            .index_write()
            .remove(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        let record = LogRecord::Remove { key: key.to_string() };
        if let Err(e) = self.append(&record).await {
            self.index_write().insert(key.to_string(), object);
            return Err(e);
        }

        for replica in &object.replicas {
            match fs::remove_file(&replica.location).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to remove {} for {}: {}", replica.location, key, e);
                    return Err(StorageError::Io(e));
                }
            }
        }

        tracing::info!("Deleted object {} ({})", key, object.id);
        Ok(())
    }

    /// Point-in-time copy of the index.
    pub fn list(&self) -> HashMap<String, StorageObject> {
        self.index_read().clone()
    }

    pub fn stats(&self) -> StoreStats {
        let index = self.index_read();
        let mut stats = StoreStats::default();
        for object in index.values() {
            stats.total_objects += 1;
            stats.total_size_bytes += object.size;
            *stats.tier_distribution.entry(object.storage_tier).or_insert(0) += 1;
        }
        stats
    }

    pub fn used_bytes(&self) -> u64 {
        self.index_read().values().map(|object| object.size).sum()
    }

    /// Rewrites the metadata snapshot and truncates the log.
    pub async fn compact(&self) -> Result<()> {
        self.log.compact(|| self.list()).await
    }

    async fn append(&self, record: &LogRecord) -> Result<()> {
        let pending = self.log.append(record).await?;
        if pending >= self.options.compact_after {
            if let Err(e) = self.compact().await {
                tracing::warn!("Metadata compaction failed: {}", e);
            }
        }
        Ok(())
    }

    async fn write_payload<R>(&self, path: &Path, payload: &mut R) -> std::io::Result<(u64, String)>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = File::create(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut size = 0u64;

        loop {
            let n = payload.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n as u64;
        }

        file.flush().await?;
        if self.options.sync_writes {
            file.sync_all().await?;
        }

        Ok((size, format!("{:x}", hasher.finalize())))
    }

    fn payload_path(&self, object: &StorageObject) -> PathBuf {
        match object.local_replica(&self.node_id) {
            Some(replica) => PathBuf::from(&replica.location),
            None => self.root.join(&object.id),
        }
    }

    async fn lock_key(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[stripe].lock().await
    }

    fn index_read(&self) -> RwLockReadGuard<'_, HashMap<String, StorageObject>> {
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn index_write(&self) -> RwLockWriteGuard<'_, HashMap<String, StorageObject>> {
        self.index.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove partial file {:?}: {}", path, e);
        }
    }
}
