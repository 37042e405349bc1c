use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use whispr_core::StorageError;

use crate::item::Item;

/// Sharded file-per-key persistence layer. A key lives at
/// `root/<2-hex-char shard>/<sanitized key>_<hash>/record.json`, with an
/// advisory lock file alongside it used the same way for both
/// reads-before-write and writes: acquire, run, drop.
///
/// The shard level exists because a single [`crate::Appstorage`] prefix can
/// accumulate far more keys than a one-off artifact store ever would — one
/// flat directory holding tens of thousands of entries gets slow to list on
/// some filesystems, so entries fan out across 256 shard directories.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
    const LOCK_RETRY_DELAY_FLOOR: Duration = Duration::from_millis(2);
    const LOCK_RETRY_DELAY_CEIL: Duration = Duration::from_millis(40);
    const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        let (shard, segment) = shard_for_key(key);
        self.root.join(shard).join(segment)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.key_dir(key).join("record.json")
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.key_dir(key).join(".lock")
    }

    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Item<T>>, StorageError> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| StorageError::Io(e.to_string()))?;
        let item = serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialize(e.to_string()))?;
        Ok(Some(item))
    }

    /// Writes `item` under its own advisory lock, rejecting the write with
    /// a conflict if the on-disk `rev` has since overtaken `expected_rev`.
    pub fn save<T: Serialize + DeserializeOwned>(
        &self,
        item: &Item<T>,
        expected_rev: Option<u64>,
    ) -> Result<(), StorageError> {
        self.with_lock(&item.key, || {
            let dir = self.key_dir(&item.key);
            fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e.to_string()))?;

            if let Some(expected) = expected_rev {
                if let Some(existing) = self.load::<T>(&item.key)? {
                    if existing.rev > expected {
                        return Err(StorageError::Conflict {
                            expected,
                            actual: existing.rev,
                        });
                    }
                }
            }

            let bytes = serde_json::to_vec(item).map_err(|e| StorageError::Serialize(e.to_string()))?;
            write_atomic(&self.record_path(&item.key), &bytes)
        })
    }

    /// Recovers every live key by reading the `key` field back out of each
    /// `record.json` rather than reconstructing it from the shard/segment
    /// path — the path is a one-way hash of the key, not a re-derivable
    /// encoding of it, so the directory layout alone can never answer "what
    /// keys exist".
    pub fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for shard_entry in fs::read_dir(&self.root).map_err(|e| StorageError::Io(e.to_string()))? {
            let shard_entry = shard_entry.map_err(|e| StorageError::Io(e.to_string()))?;
            if !shard_entry.path().is_dir() {
                continue;
            }
            for segment_entry in
                fs::read_dir(shard_entry.path()).map_err(|e| StorageError::Io(e.to_string()))?
            {
                let segment_entry = segment_entry.map_err(|e| StorageError::Io(e.to_string()))?;
                let record_path = segment_entry.path().join("record.json");
                let Ok(bytes) = fs::read(&record_path) else { continue };
                if let Ok(record) = serde_json::from_slice::<RecordKey>(&bytes) {
                    keys.push(record.key);
                }
            }
        }
        Ok(keys)
    }

    fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> Result<T, StorageError>) -> Result<T, StorageError> {
        let lock = self.acquire_lock(key)?;
        let result = f();
        drop(lock);
        result
    }

    /// Retries with exponential backoff (floor..=ceiling) rather than a
    /// fixed poll interval: an `Appstorage` prefix issues a lock-acquire on
    /// every `set`/`delete`/flush tick for any of its keys, so contention is
    /// frequent-but-brief and a fixed 5ms poll either busy-spins too hard at
    /// the start or waits too long right before the lock frees up.
    fn acquire_lock(&self, key: &str) -> Result<FileLock, StorageError> {
        let lock_path = self.lock_path(key);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let started = Instant::now();
        let mut retry_delay = Self::LOCK_RETRY_DELAY_FLOOR;
        loop {
            match fs::OpenOptions::new().create_new(true).write(true).open(&lock_path) {
                Ok(mut file) => {
                    write_lock_metadata(&mut file, key)?;
                    return Ok(FileLock { path: lock_path, file });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path, Self::LOCK_STALE_AFTER) && fs::remove_file(&lock_path).is_ok() {
                        retry_delay = Self::LOCK_RETRY_DELAY_FLOOR;
                        continue;
                    }
                    if started.elapsed() >= Self::LOCK_WAIT_TIMEOUT {
                        return Err(StorageError::Io(format!(
                            "lock timed out: {}",
                            lock_path.to_string_lossy()
                        )));
                    }
                    thread::sleep(retry_delay);
                    retry_delay = (retry_delay * 2).min(Self::LOCK_RETRY_DELAY_CEIL);
                }
                Err(err) => return Err(StorageError::Io(err.to_string())),
            }
        }
    }
}

#[derive(Deserialize)]
struct RecordKey {
    key: String,
}

/// Splits a key into a 2-hex-char shard and a sanitized, hash-suffixed leaf
/// segment. The shard fans keys out across up to 256 directories so a
/// prefix with a large key count never lands every entry in one directory;
/// the leaf keeps a human-legible prefix for anyone browsing the store by
/// hand, with the hash suffix guaranteeing two different keys with the same
/// sanitized prefix (e.g. `a/b` and `a_b`) never collide.
fn shard_for_key(key: &str) -> (String, String) {
    let mut sanitized = String::with_capacity(key.len());
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            sanitized.push(ch);
        } else {
            sanitized.push('_');
        }
    }
    if sanitized.is_empty() {
        sanitized.push_str("key");
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let shard = digest[..2].to_owned();
    let segment = format!("{sanitized}_{}", &digest[2..14]);
    (shard, segment)
}

/// Embeds `pid:created_unix_ms:key` so a stale-lock check can trust the
/// lock's own claimed creation time over filesystem mtime, which some
/// network/overlay filesystems update on reads, not just writes; the key is
/// included purely so a lock file left behind after a crash is legible on
/// its own (`cat .lock`) instead of just a bare `pid:timestamp` pair.
fn write_lock_metadata(file: &mut fs::File, key: &str) -> Result<(), StorageError> {
    let payload = format!("{}:{}:{key}\n", std::process::id(), now_unix_millis());
    file.write_all(payload.as_bytes()).map_err(|e| StorageError::Io(e.to_string()))?;
    file.sync_all().map_err(|e| StorageError::Io(e.to_string()))
}

fn lock_is_stale(path: &Path, stale_after: Duration) -> bool {
    if let Ok(raw) = fs::read_to_string(path) {
        if let Some(created_unix_ms) = parse_lock_created_unix_ms(&raw) {
            return now_unix_millis().saturating_sub(created_unix_ms) >= stale_after.as_millis() as u64;
        }
    }
    if let Ok(metadata) = fs::metadata(path) {
        if let Ok(modified) = metadata.modified() {
            if let Ok(elapsed) = modified.elapsed() {
                return elapsed >= stale_after;
            }
        }
    }
    false
}

fn parse_lock_created_unix_ms(raw: &str) -> Option<u64> {
    let mut fields = raw.trim().splitn(3, ':');
    let _pid = fields.next()?;
    fields.next()?.parse::<u64>().ok()
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let temp = path.with_file_name(format!(
        "{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp"),
        std::process::id()
    ));
    fs::write(&temp, bytes).map_err(|e| StorageError::Io(e.to_string()))?;
    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        StorageError::Io(e.to_string())
    })
}

struct FileLock {
    path: PathBuf,
    file: fs::File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
        let _ = fs::remove_file(&self.path);
    }
}
