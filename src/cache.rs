//! Caches the last-observed revision of each object and classifies changes

use crate::resource::{ObjectId, Resource};
use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

/// How an incoming snapshot relates to the cached revision of the same object
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    /// No cached revision exists for this uid
    New,
    /// The revision changed and the metadata/spec payload differs
    SpecModified,
    /// Only the status payload differs
    StatusModified,
    /// Nothing relevant changed
    NotModified,
    /// Deletion has been requested; overrides every other outcome because
    /// teardown must be surfaced even when the payload is unchanged
    Finalizing,
}

struct Entry<K> {
    object: Arc<K>,
    spec_hash: u64,
    status_hash: u64,
}

/// Last-observed snapshots per object identity.
///
/// Cloning produces another handle to the same backing map. The store itself
/// only guards the single read-modify-write inside [`Store::upsert`]; callers
/// serialize access per resource type.
pub struct Store<K> {
    entries: Arc<RwLock<AHashMap<ObjectId, Entry<K>>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            entries: Arc::default(),
        }
    }
}

impl<K: Resource> Store<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a snapshot and classify it against the cached revision.
    ///
    /// The entry is replaced whenever something changed; an unchanged
    /// snapshot leaves the stored `Arc` untouched, so repeated upserts of the
    /// same revision return the same allocation.
    pub fn upsert(&self, obj: K) -> (Arc<K>, Classification) {
        let id = ObjectId::from_obj(&obj);
        let terminating = obj.meta().deletion_timestamp.is_some();
        let (spec_hash, status_hash) = payload_hashes(&obj);

        let mut entries = self.entries.write();
        let change = match entries.get(&id) {
            None => Classification::New,
            Some(prev) => {
                if prev.object.meta().resource_version != obj.meta().resource_version
                    && prev.spec_hash != spec_hash
                {
                    Classification::SpecModified
                } else if prev.status_hash != status_hash {
                    Classification::StatusModified
                } else {
                    Classification::NotModified
                }
            }
        };

        let stored = if change == Classification::NotModified {
            // unwrap is fine: NotModified implies an existing entry
            Arc::clone(&entries[&id].object)
        } else {
            let object = Arc::new(obj);
            entries.insert(
                id,
                Entry {
                    object: Arc::clone(&object),
                    spec_hash,
                    status_hash,
                },
            );
            object
        };
        drop(entries);

        let classification = if terminating {
            Classification::Finalizing
        } else {
            change
        };
        (stored, classification)
    }

    #[must_use]
    pub fn get(&self, id: &ObjectId) -> Option<Arc<K>> {
        self.entries.read().get(id).map(|entry| Arc::clone(&entry.object))
    }

    pub fn remove(&self, id: &ObjectId) -> Option<Arc<K>> {
        self.entries.write().remove(id).map(|entry| entry.object)
    }

    /// Evict every entry `keep` rejects, returning the evicted ids so the
    /// caller can cancel their timers. Used when a relist replaces the view.
    pub fn retain(&self, keep: impl Fn(&ObjectId) -> bool) -> Vec<ObjectId> {
        let mut evicted = Vec::new();
        self.entries.write().retain(|id, _| {
            if keep(id) {
                true
            } else {
                evicted.push(id.clone());
                false
            }
        });
        evicted
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all cached objects
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.entries
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.object))
            .collect()
    }
}

/// Hashes of the two comparison payloads: everything but status (with the
/// resource version dropped, since it changes on every write), and status.
fn payload_hashes<K: Resource>(obj: &K) -> (u64, u64) {
    let value = match serde_json::to_value(obj) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, kind = K::kind(), "failed to serialize object for comparison");
            Value::Null
        }
    };
    let (rest, status) = split_status(value);
    (hash_value(&rest), hash_value(&status))
}

fn split_status(mut value: Value) -> (Value, Value) {
    let status = match value.as_object_mut() {
        Some(map) => {
            if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.remove("resourceVersion");
            }
            map.remove("status").unwrap_or(Value::Null)
        }
        None => Value::Null,
    };
    (value, status)
}

fn hash_value(value: &Value) -> u64 {
    // serde_json maps are sorted, so the rendered text is canonical
    let mut hasher = ahash::AHasher::default();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}
