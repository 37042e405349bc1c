use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use whispr_cell::Cell;
use whispr_core::StorageError;

use crate::file_store::FileStore;
use crate::item::Item;

const REFRESH_INTERVAL: Duration = Duration::from_millis(200);
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Process-wide registry of [`Appstorage`] instances, one per prefix. A
/// prefix is the partition boundary: every `Appstorage::for_prefix` call
/// with the same prefix returns the same running instance.
static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<dyn std::any::Any + Send + Sync>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<dyn std::any::Any + Send + Sync>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A live, revisioned key/value namespace backed by a [`FileStore`] at
/// `root/prefix`. `index` excludes tombstoned items and is kept current by
/// a background refresh task; writes go through [`Appstorage::set`]
/// immediately in memory and are flushed to disk on a debounce.
pub struct Appstorage<T> {
    store: FileStore,
    index: Cell<HashMap<String, Item<T>>>,
    dirty: Arc<Mutex<HashMap<String, u64>>>,
}

impl<T> Appstorage<T>
where
    T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Returns the process-wide singleton for `prefix` under `root`,
    /// creating it (and spawning its background tasks) on first access.
    pub fn for_prefix(root: impl Into<std::path::PathBuf>, prefix: &str) -> Arc<Self> {
        let mut guard = registry().lock().expect("appstorage registry poisoned");
        if let Some(existing) = guard.get(prefix) {
            if let Ok(typed) = existing.clone().downcast::<Self>() {
                return typed;
            }
        }

        let instance = Arc::new(Self::new(root.into().join(prefix)));
        instance.clone().spawn_background_tasks();
        guard.insert(prefix.to_owned(), instance.clone());
        instance
    }

    fn new(root: std::path::PathBuf) -> Self {
        let store = FileStore::new(root);
        let mut initial = HashMap::new();
        if let Ok(keys) = store.list_keys() {
            for key in keys {
                if let Ok(Some(item)) = store.load::<T>(&key) {
                    if !item.deleted {
                        initial.insert(key, item);
                    }
                }
            }
        }
        Self {
            store,
            index: Cell::new(initial),
            dirty: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn index_cell(&self) -> Cell<HashMap<String, Item<T>>> {
        self.index.clone()
    }

    pub fn get(&self, key: &str) -> Option<Item<T>> {
        self.index.get().get(key).cloned()
    }

    pub fn add(&self, key: &str, data: T) -> Result<(), StorageError> {
        if self.index.get().contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_owned()));
        }
        self.put(Item::new(key, data));
        Ok(())
    }

    pub fn set(&self, key: &str, data: T) {
        let next = match self.index.get().get(key) {
            Some(existing) => existing.bump(data),
            None => Item::new(key, data),
        };
        self.put(next);
    }

    pub fn delete(&self, key: &str) {
        if let Some(existing) = self.index.get().get(key).cloned() {
            let tombstoned = existing.tombstone();
            self.mark_dirty(key, tombstoned.rev);
            let mut map = self.index.get();
            map.remove(key);
            self.index.set(map);
            // The tombstone itself must still reach disk so other
            // processes observe the deletion on their next refresh.
            let _ = self.store.save(&tombstoned, Some(existing.rev));
        }
    }

    fn put(&self, item: Item<T>) {
        self.mark_dirty(&item.key, item.rev);
        let mut map = self.index.get();
        map.insert(item.key.clone(), item);
        self.index.set(map);
    }

    fn mark_dirty(&self, key: &str, rev: u64) {
        self.dirty.lock().expect("appstorage dirty set poisoned").insert(key.to_owned(), rev);
    }

    /// Forces every pending write to disk, surfacing the first I/O error
    /// encountered. The background flush task swallows the same errors so
    /// a transient failure never drops state from memory.
    pub fn flush(&self) -> Result<(), StorageError> {
        let pending: Vec<String> = {
            let mut dirty = self.dirty.lock().expect("appstorage dirty set poisoned");
            dirty.drain().map(|(k, _)| k).collect()
        };
        for key in pending {
            if let Some(item) = self.index.get().get(&key).cloned() {
                self.store.save(&item, None)?;
            }
        }
        Ok(())
    }

    /// Folds every on-disk key into the in-memory index. Subscribers are
    /// only woken when a key genuinely new to this process showed up — a
    /// rev bump on a key this process already knew about is not worth a
    /// wakeup, since nothing about the set of known keys changed.
    fn refresh_from_disk(&self) {
        let Ok(keys) = self.store.list_keys() else { return };
        let mut map = self.index.get();
        let mut new_key_seen = false;
        for key in keys {
            let Ok(Some(on_disk)) = self.store.load::<T>(&key) else { continue };
            let is_new = !map.contains_key(&key);
            let merged = Item::merge_on_disk(map.get(&key), on_disk);
            if merged.deleted {
                map.remove(&key);
            } else {
                if is_new {
                    new_key_seen = true;
                }
                map.insert(key, merged);
            }
        }
        self.index.set_notify_if(map, new_key_seen);
    }

    fn spawn_background_tasks(self: Arc<Self>) {
        let refresh_target = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                ticker.tick().await;
                refresh_target.refresh_from_disk();
            }
        });

        let flush_target = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_DEBOUNCE);
            loop {
                ticker.tick().await;
                if let Err(error) = flush_target.flush() {
                    tracing::warn!(%error, "background appstorage flush failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_rejects_duplicate_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Appstorage::<String>::for_prefix(dir.path(), "widgets");
        storage.add("a", "one".to_owned()).unwrap();
        let result = storage.add("a", "two".to_owned());
        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn set_bumps_revision_and_flush_persists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Appstorage::<String>::for_prefix(dir.path(), "docs");
        storage.add("a", "v1".to_owned()).unwrap();
        storage.set("a", "v2".to_owned());
        assert_eq!(storage.get("a").unwrap().rev, 2);

        storage.flush().unwrap();
        let reopened = Appstorage::<String>::for_prefix(dir.path(), "docs");
        assert_eq!(reopened.get("a").unwrap().data, "v2");
    }

    #[tokio::test]
    async fn refresh_notifies_only_when_a_new_key_appears() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let storage = Appstorage::<String>::for_prefix(dir.path(), "notify");
        storage.add("a", "v1".to_owned()).unwrap();
        storage.flush().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_listener = calls.clone();
        let _sub = storage.index_cell().subscribe(move |_| {
            calls_for_listener.fetch_add(1, Ordering::SeqCst);
        });

        // Another process bumps the existing key on disk.
        let external = FileStore::new(dir.path().join("notify"));
        external.save(&Item::new("a", "v1".to_owned()).bump("v2".to_owned()), None).unwrap();
        storage.refresh_from_disk();
        assert_eq!(calls.load(Ordering::SeqCst), 0, "an existing key's rev bump must not notify");
        assert_eq!(storage.get("a").unwrap().data, "v2", "the merge still applies");

        // Another process adds a brand-new key.
        external.save(&Item::new("b", "v1".to_owned()), None).unwrap();
        storage.refresh_from_disk();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "a newly-discovered key must notify");
    }

    #[tokio::test]
    async fn delete_tombstones_and_removes_from_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Appstorage::<String>::for_prefix(dir.path(), "tombstones");
        storage.add("a", "v1".to_owned()).unwrap();
        storage.delete("a");
        assert_eq!(storage.get("a"), None);
    }
}
