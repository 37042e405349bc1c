use serde::{Deserialize, Serialize};

/// A single revisioned record in the key/value store. `rev` increases
/// monotonically per key; `deleted` tombstones the key without removing its
/// history, so a concurrent writer that missed the delete still loses to it
/// on the next rev comparison.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Item<T> {
    pub key: String,
    pub data: T,
    pub rev: u64,
    pub deleted: bool,
}

impl<T> Item<T> {
    pub fn new(key: impl Into<String>, data: T) -> Self {
        Self {
            key: key.into(),
            data,
            rev: 1,
            deleted: false,
        }
    }

    pub fn bump(&self, data: T) -> Self {
        Self {
            key: self.key.clone(),
            data,
            rev: self.rev + 1,
            deleted: false,
        }
    }

    pub fn tombstone(&self) -> Self
    where
        T: Clone,
    {
        Self {
            key: self.key.clone(),
            data: self.data.clone(),
            rev: self.rev + 1,
            deleted: true,
        }
    }

    /// Merge policy for reconciling an in-memory view against a
    /// freshly-read on-disk record: strictly higher `rev` wins; ties keep
    /// the in-memory copy since it is the one already observed by
    /// subscribers.
    pub fn merge_on_disk(in_memory: Option<&Item<T>>, on_disk: Item<T>) -> Item<T>
    where
        T: Clone,
    {
        match in_memory {
            Some(mem) if mem.rev >= on_disk.rev => mem.clone(),
            _ => on_disk,
        }
    }
}
