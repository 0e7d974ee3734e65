//! The dispatcher: one watch loop, one diff cache, one timer queue per kind,
//! and a drain loop that turns classified changes into callback invocations
//!
//! Events and timer firings for a kind are processed strictly one at a time,
//! which is what keeps a rapid Modified-then-Deleted pair in order. Separate
//! kinds run in their own dispatchers and proceed fully in parallel.

use crate::{
    backoff::WatchBackoff,
    cache::{Classification, Store},
    client::{ResourceClient, WatchParams},
    elector::LeaderState,
    finalizer::{self, FinalizerSet},
    metrics::{ControllerMetrics, WatchMetrics},
    resource::{ObjectId, Resource, ResourceExt},
    scheduler::{scheduler, DelayedEntry, Request},
    watcher::{Event, Watcher},
    BoxError,
};
use ahash::AHashSet;
use async_trait::async_trait;
use futures::{channel::mpsc as request_mpsc, SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// User-supplied hooks invoked by the dispatcher
#[async_trait]
pub trait EntityController<K: Resource>: Send + Sync + 'static {
    /// Drive external state toward the object's desired state.
    ///
    /// Must be idempotent: the same snapshot can be delivered again after a
    /// restart, a relist, or a brief dual-leadership window.
    async fn reconcile(&self, obj: Arc<K>, ctx: &Context<K>) -> Result<(), BoxError>;

    /// Called once every registered finalizer has completed on a terminating
    /// object. Defaults to a no-op.
    async fn deleted(&self, _obj: Arc<K>, _ctx: &Context<K>) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Capabilities handed to every callback invocation
pub struct Context<K: Resource> {
    client: Arc<dyn ResourceClient<K>>,
    store: Store<K>,
    finalizers: FinalizerSet<K>,
    requeue_tx: request_mpsc::Sender<Request<K>>,
}

impl<K: Resource> Clone for Context<K> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            store: self.store.clone(),
            finalizers: self.finalizers.clone(),
            requeue_tx: self.requeue_tx.clone(),
        }
    }
}

impl<K: Resource> Context<K> {
    /// The client the runtime itself uses
    #[must_use]
    pub fn client(&self) -> &Arc<dyn ResourceClient<K>> {
        &self.client
    }

    /// Read view of the last-observed snapshots
    #[must_use]
    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    /// Ask for the object to be reconsidered after `delay`.
    ///
    /// At most one timer exists per object: a later request replaces the
    /// pending one outright, and a genuine watch event cancels it.
    pub async fn requeue(&self, obj: Arc<K>, delay: Duration) {
        let entry = DelayedEntry {
            id: ObjectId::from_obj(obj.as_ref()),
            object: obj,
        };
        let request = Request::Schedule {
            entry,
            run_at: Instant::now() + delay,
        };
        // a send failure means the dispatcher is shutting down
        let _ = self.requeue_tx.clone().send(request).await;
    }

    /// Persist every registered finalizer identifier onto `obj`, returning
    /// the stored object
    pub async fn attach_finalizers(&self, obj: &K) -> Result<K, finalizer::Error> {
        finalizer::register(self.client.as_ref(), &self.finalizers, obj).await
    }

    /// Persist a single finalizer identifier onto `obj`
    pub async fn attach_finalizer(&self, obj: &K, identifier: &str) -> Result<K, finalizer::Error> {
        finalizer::register_one(self.client.as_ref(), obj, identifier).await
    }
}

/// Dispatcher for one resource kind.
///
/// Built with the typed client, optionally scoped and tuned, then driven by
/// [`Controller::run`] until its cancellation token fires.
pub struct Controller<K: Resource> {
    client: Arc<dyn ResourceClient<K>>,
    params: WatchParams,
    backoff: WatchBackoff,
    finalizers: FinalizerSet<K>,
    store: Store<K>,
    queue_capacity: usize,
    watch_metrics: Arc<WatchMetrics>,
    metrics: Arc<ControllerMetrics>,
}

impl<K: Resource> Controller<K> {
    #[must_use]
    pub fn new(client: Arc<dyn ResourceClient<K>>) -> Self {
        Self {
            client,
            params: WatchParams::default(),
            backoff: WatchBackoff::default(),
            finalizers: FinalizerSet::new(),
            store: Store::new(),
            queue_capacity: 64,
            watch_metrics: Arc::default(),
            metrics: Arc::default(),
        }
    }

    /// Scope the watch subscription (namespace, label selector, timeout)
    #[must_use]
    pub fn params(mut self, params: WatchParams) -> Self {
        self.params = params;
        self
    }

    /// Reconnect policy for the watch loop
    #[must_use]
    pub fn backoff(mut self, backoff: WatchBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Cleanup obligations enforced before deletion completes
    #[must_use]
    pub fn finalizers(mut self, finalizers: FinalizerSet<K>) -> Self {
        self.finalizers = finalizers;
        self
    }

    /// Capacity of the event queue between the watch task and the drain
    /// loop; a full queue suspends the watch task rather than dropping
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// A read handle onto the diff cache, usable before and while running
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn watch_metrics(&self) -> Arc<WatchMetrics> {
        Arc::clone(&self.watch_metrics)
    }

    /// Run the dispatch loop until `stop` is cancelled.
    ///
    /// Callbacks only run while `leadership` reads `Leader`; the cache is
    /// maintained either way so a newly promoted replica starts warm.
    /// Stopping cancels the watch subscription (interrupting an in-flight
    /// backoff wait), drops every pending timer, and lets an in-flight
    /// callback finish first.
    pub async fn run(
        self,
        handler: Arc<dyn EntityController<K>>,
        leadership: watch::Receiver<LeaderState>,
        stop: CancellationToken,
    ) {
        let (event_tx, mut event_rx) = mpsc::channel(self.queue_capacity);
        let mut watcher = Watcher::new(
            Arc::clone(&self.client),
            self.params.clone(),
            self.backoff.clone(),
            event_tx,
            Arc::clone(&self.watch_metrics),
        );
        watcher.start();

        let (requeue_tx, requeue_rx) = request_mpsc::channel(100);
        let mut timers = Box::pin(scheduler(requeue_rx));

        let dispatcher = Dispatcher {
            ctx: Context {
                client: Arc::clone(&self.client),
                store: self.store.clone(),
                finalizers: self.finalizers.clone(),
                requeue_tx: requeue_tx.clone(),
            },
            store: self.store,
            finalizers: self.finalizers,
            metrics: self.metrics,
            handler,
            leadership,
            requeue_tx,
        };

        let mut watch_ended = false;
        loop {
            // the chosen work item is awaited outside the select, so a stop
            // never interrupts an in-flight callback
            let work = tokio::select! {
                () = stop.cancelled() => break,
                event = event_rx.recv(), if !watch_ended => match event {
                    Some(event) => Work::Event(event),
                    // the subscription ended itself (unrecoverable failure);
                    // keep serving timers until stopped
                    None => {
                        watch_ended = true;
                        continue;
                    }
                },
                Some(fired) = timers.next() => Work::Timer(fired),
            };
            match work {
                Work::Event(event) => dispatcher.apply(event).await,
                Work::Timer(fired) => dispatcher.fire(fired).await,
            }
        }
        watcher.stop().await;
    }
}

/// Work items drained one at a time to preserve per-kind ordering
enum Work<K> {
    Event(Event<K>),
    Timer(DelayedEntry<K>),
}

struct Dispatcher<K: Resource> {
    store: Store<K>,
    finalizers: FinalizerSet<K>,
    metrics: Arc<ControllerMetrics>,
    handler: Arc<dyn EntityController<K>>,
    ctx: Context<K>,
    leadership: watch::Receiver<LeaderState>,
    requeue_tx: request_mpsc::Sender<Request<K>>,
}

impl<K: Resource> Dispatcher<K> {
    fn is_leader(&self) -> bool {
        self.leadership.borrow().is_leader()
    }

    async fn cancel_timer(&self, id: &ObjectId) {
        // a send failure means the scheduler is gone and nothing can fire
        let _ = self.requeue_tx.clone().send(Request::Cancel(id.clone())).await;
    }

    async fn apply(&self, event: Event<K>) {
        match event {
            Event::Added(obj) | Event::Modified(obj) => self.dispatch(obj).await,
            Event::Deleted(obj) => {
                let id = ObjectId::from_obj(&obj);
                self.store.remove(&id);
                self.cancel_timer(&id).await;
            }
            Event::Restarted(objects) => {
                // the listing replaces the view: evict what disappeared
                // during the outage, then classify everything listed
                let listed: AHashSet<ObjectId> = objects.iter().map(ObjectId::from_obj).collect();
                for id in self.store.retain(|id| listed.contains(id)) {
                    self.cancel_timer(&id).await;
                }
                for obj in objects {
                    self.dispatch(obj).await;
                }
            }
        }
    }

    /// Classify one snapshot and invoke the matching callback. The cache is
    /// maintained even while not leader; only callbacks are gated.
    async fn dispatch(&self, obj: K) {
        let id = ObjectId::from_obj(&obj);
        // a live update always preempts a stale scheduled reconsideration
        self.cancel_timer(&id).await;
        let (stored, classification) = self.store.upsert(obj);
        if !self.is_leader() {
            return;
        }
        self.invoke(&id, stored, classification).await;
    }

    /// A timer fired: re-check the cache and dispatch the current snapshot
    async fn fire(&self, fired: DelayedEntry<K>) {
        let Some(current) = self.store.get(&fired.id) else {
            // deleted since the delay was requested; drop silently
            tracing::trace!(object = %fired.id, kind = K::kind(), "dropping requeue for a removed object");
            return;
        };
        ControllerMetrics::add(&self.metrics.requeues);
        if !self.is_leader() {
            return;
        }
        let classification = if current.is_terminating() {
            Classification::Finalizing
        } else {
            Classification::SpecModified
        };
        self.invoke(&fired.id, current, classification).await;
    }

    async fn invoke(&self, id: &ObjectId, obj: Arc<K>, classification: Classification) {
        match classification {
            Classification::New | Classification::SpecModified | Classification::StatusModified => {
                ControllerMetrics::add(&self.metrics.reconciles);
                if let Err(error) = self.handler.reconcile(obj, &self.ctx).await {
                    ControllerMetrics::add(&self.metrics.reconcile_errors);
                    tracing::error!(object = %id, kind = K::kind(), error = %error, "reconcile failed");
                }
            }
            Classification::NotModified => {
                ControllerMetrics::add(&self.metrics.unchanged);
            }
            Classification::Finalizing => self.finalize(id, obj).await,
        }
    }

    /// Deletion-intent: run pending cleanups, and only once none remain let
    /// the delete hook observe the teardown
    async fn finalize(&self, id: &ObjectId, obj: Arc<K>) {
        let current = if self.finalizers.pending(obj.as_ref()).is_empty() {
            obj
        } else {
            match finalizer::finalize(self.ctx.client.as_ref(), &self.finalizers, obj).await {
                Ok(updated) => Arc::new(updated),
                Err(error) => {
                    ControllerMetrics::add(&self.metrics.finalize_errors);
                    tracing::error!(
                        object = %id,
                        kind = K::kind(),
                        error = %error,
                        "cleanup failed, object stays terminating until retried"
                    );
                    return;
                }
            }
        };
        ControllerMetrics::add(&self.metrics.deletes);
        if let Err(error) = self.handler.deleted(current, &self.ctx).await {
            tracing::error!(object = %id, kind = K::kind(), error = %error, "delete callback failed");
        }
    }
}
