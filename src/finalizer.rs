//! Cleanup obligations that must complete before an object is removed
//!
//! A finalizer's identifier lives in the object's persisted metadata; the
//! control plane refuses to remove the object while any identifier remains.
//! [`register`] attaches identifiers, [`finalize`] runs the cleanups once
//! deletion has been requested and strips the identifiers that succeeded.

use crate::{
    client::{ClientError, ResourceClient},
    resource::{Resource, ResourceExt},
    BoxError,
};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Longest label the control plane accepts; identifiers are truncated to fit
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum Error {
    /// Persisting the updated finalizer list failed
    #[error("failed to persist finalizer list: {0}")]
    Persist(#[source] ClientError),
    /// A cleanup callback failed; its identifier was retained so the object
    /// stays in terminating state until the cleanup is retried
    #[error("cleanup {identifier} failed: {reason}")]
    Cleanup { identifier: String, reason: BoxError },
}

/// One named cleanup obligation for entities of kind `K`
#[async_trait]
pub trait Finalizer<K: Resource>: Send + Sync + 'static {
    /// Short name of the obligation, unique for the kind within its group
    fn name(&self) -> &str;

    /// Release whatever external state the object holds. Must be idempotent:
    /// a crash between cleanup and persist replays it on the next pass.
    async fn finalize(&self, obj: Arc<K>) -> Result<(), BoxError>;

    /// The string persisted in the object's finalizer list
    fn identifier(&self) -> String {
        identifier_for(self.name(), K::group())
    }
}

/// Derive the persisted identifier from a finalizer name and resource group
#[must_use]
pub fn identifier_for(name: &str, group: &str) -> String {
    let mut identifier = format!("{name}.{group}");
    identifier.truncate(MAX_IDENTIFIER_LEN);
    identifier
}

/// The finalizers registered for one entity type, fixed at startup
pub struct FinalizerSet<K> {
    finalizers: Vec<Arc<dyn Finalizer<K>>>,
}

impl<K> Clone for FinalizerSet<K> {
    fn clone(&self) -> Self {
        Self {
            finalizers: self.finalizers.clone(),
        }
    }
}

impl<K> Default for FinalizerSet<K> {
    fn default() -> Self {
        Self {
            finalizers: Vec::new(),
        }
    }
}

impl<K: Resource> FinalizerSet<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more finalizer for the type
    #[must_use]
    pub fn with(mut self, finalizer: impl Finalizer<K>) -> Self {
        self.finalizers.push(Arc::new(finalizer));
        self
    }

    /// Identifiers of every registered finalizer
    #[must_use]
    pub fn identifiers(&self) -> Vec<String> {
        self.finalizers.iter().map(|f| f.identifier()).collect()
    }

    /// Registered finalizers whose identifier is still persisted on `obj`.
    /// Identifiers attached by other controllers are not ours to run.
    #[must_use]
    pub fn pending(&self, obj: &K) -> Vec<Arc<dyn Finalizer<K>>> {
        self.finalizers
            .iter()
            .filter(|f| {
                let identifier = f.identifier();
                obj.finalizers().iter().any(|present| *present == identifier)
            })
            .map(Arc::clone)
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.finalizers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.finalizers.len()
    }
}

/// Attach `identifier` to the object's persisted list if absent.
///
/// Returns the stored object; an already-attached identifier short-circuits
/// without a write.
pub async fn register_one<K: Resource>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    identifier: &str,
) -> Result<K, Error> {
    if obj.finalizers().iter().any(|f| f == identifier) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    updated.meta_mut().finalizers.push(identifier.to_string());
    client.update(&updated).await.map_err(Error::Persist)
}

/// Attach every registered identifier missing from the object, persisting at
/// most once
pub async fn register<K: Resource>(
    client: &dyn ResourceClient<K>,
    set: &FinalizerSet<K>,
    obj: &K,
) -> Result<K, Error> {
    let mut updated = obj.clone();
    let mut changed = false;
    for identifier in set.identifiers() {
        if !updated.finalizers().iter().any(|f| *f == identifier) {
            updated.meta_mut().finalizers.push(identifier);
            changed = true;
        }
    }
    if !changed {
        return Ok(updated);
    }
    client.update(&updated).await.map_err(Error::Persist)
}

/// Run every pending cleanup concurrently, then persist the surviving list
/// exactly once.
///
/// Each successful cleanup removes its identifier under a shared guard, so
/// two concurrently-completing finalizers cannot read a stale list and drop
/// each other's removal. A failed cleanup keeps its identifier; the object is
/// still persisted with whatever survived, and the first failure is returned
/// after the persist.
pub async fn finalize<K: Resource>(
    client: &dyn ResourceClient<K>,
    set: &FinalizerSet<K>,
    obj: Arc<K>,
) -> Result<K, Error> {
    let pending = set.pending(obj.as_ref());
    if pending.is_empty() {
        return Ok((*obj).clone());
    }

    let remaining = Mutex::new(obj.finalizers().to_vec());
    let remaining = &remaining;
    let failures = join_all(pending.iter().map(|finalizer| {
        let finalizer = Arc::clone(finalizer);
        let obj = Arc::clone(&obj);
        async move {
            let identifier = finalizer.identifier();
            match finalizer.finalize(obj).await {
                Ok(()) => {
                    remaining.lock().retain(|f| *f != identifier);
                    None
                }
                Err(reason) => Some(Error::Cleanup { identifier, reason }),
            }
        }
    }))
    .await;

    let mut updated = (*obj).clone();
    updated.meta_mut().finalizers = remaining.lock().clone();
    let persisted = client.update(&updated).await.map_err(Error::Persist)?;
    match failures.into_iter().flatten().next() {
        Some(err) => Err(err),
        None => Ok(persisted),
    }
}
