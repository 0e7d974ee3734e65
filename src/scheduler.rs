//! Delayed requeue timers with last-writer-wins replacement

use crate::resource::ObjectId;
use ahash::AHashMap;
use futures::{
    stream::{Fuse, FusedStream},
    Stream, StreamExt,
};
use pin_project::pin_project;
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// A scheduled reconsideration of one object
#[derive(Debug)]
pub struct DelayedEntry<K> {
    pub id: ObjectId,
    /// Snapshot captured when the delay was requested; the dispatcher
    /// re-reads the cache on firing, this is context for logs
    pub object: Arc<K>,
}

impl<K> Clone for DelayedEntry<K> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            object: Arc::clone(&self.object),
        }
    }
}

/// Requests consumed by the [`Scheduler`]
#[derive(Debug)]
pub enum Request<K> {
    /// Install a timer for `entry.id`, replacing any live one outright
    Schedule {
        entry: DelayedEntry<K>,
        run_at: Instant,
    },
    /// Drop the live timer for `id`, if any
    Cancel(ObjectId),
}

/// Stream transformer turning schedule/cancel requests into timer firings.
///
/// Invariant: at most one live timer per object id. A `Schedule` for an id
/// that already has a timer removes the old timer and its snapshot entirely
/// (the newest request wins; delays are never coalesced), so a callback that
/// keeps asking for a short requeue does not accumulate timers. The stream
/// terminates once the request stream has ended and every timer has fired.
#[pin_project(project = SchedulerProj)]
pub struct Scheduler<K, R> {
    queue: DelayQueue<DelayedEntry<K>>,
    /// Live timer per id; kept strictly in sync with `queue`
    scheduled: AHashMap<ObjectId, delay_queue::Key>,
    #[pin]
    requests: Fuse<R>,
}

impl<K, R: Stream> Scheduler<K, R> {
    fn new(requests: R) -> Self {
        Self {
            queue: DelayQueue::new(),
            scheduled: AHashMap::new(),
            requests: requests.fuse(),
        }
    }
}

impl<K, R> Stream for Scheduler<K, R>
where
    R: Stream<Item = Request<K>>,
{
    type Item = DelayedEntry<K>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        while let Poll::Ready(Some(request)) = this.requests.as_mut().poll_next(cx) {
            match request {
                Request::Schedule { entry, run_at } => {
                    if let Some(key) = this.scheduled.remove(&entry.id) {
                        this.queue.remove(&key);
                    }
                    let id = entry.id.clone();
                    let key = this.queue.insert_at(entry, run_at);
                    this.scheduled.insert(id, key);
                }
                Request::Cancel(id) => {
                    if let Some(key) = this.scheduled.remove(&id) {
                        this.queue.remove(&key);
                    }
                }
            }
        }

        match this.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let entry = expired.into_inner();
                this.scheduled.remove(&entry.id);
                Poll::Ready(Some(entry))
            }
            Poll::Ready(None) => {
                if this.requests.is_terminated() {
                    Poll::Ready(None)
                } else {
                    // nothing queued right now; the request stream's waker
                    // will get us polled again
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a [`Scheduler`] driven by `requests`
pub fn scheduler<K, R>(requests: R) -> Scheduler<K, R>
where
    R: Stream<Item = Request<K>>,
{
    Scheduler::new(requests)
}
