//! Watches a resource kind for changes, with error recovery

use crate::{
    backoff::WatchBackoff,
    client::{ClientError, ResourceClient, WatchEvent, WatchParams, WatchStream},
    metrics::WatchMetrics,
    resource::{Resource, ResourceExt},
};
use async_stream::stream;
use backoff::backoff::Backoff;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Change events emitted by the watch loop
#[derive(Clone, Debug)]
pub enum Event<K> {
    /// An object appeared
    Added(K),
    /// An object changed (including deletion-intent updates)
    Modified(K),
    /// An object was removed
    ///
    /// NOTE: may be missed entirely across subscription restarts; cleanup
    /// that must run should be attached through finalizers instead.
    Deleted(K),
    /// The subscription was (re)established; carries the full listing.
    /// Cached objects absent from the listing should be treated as deleted.
    Restarted(Vec<K>),
}

/// The finite state machine driving one subscription
enum State<K> {
    /// Next step lists all existing objects
    Empty,
    /// Listing succeeded; next step opens the watch from its revision
    Listed { resource_version: String },
    /// Streaming events; errors fall back to `Listed` (or `Empty` when the
    /// revision window was lost) and the loop resumes from there
    Watching {
        resource_version: String,
        stream: WatchStream<K>,
    },
}

enum StepOutcome<K> {
    Event(Event<K>),
    /// Internal transition with nothing to report
    Quiet,
    Error(ClientError),
    /// Clean server-side close
    Closed,
}

async fn step<K: Resource>(
    client: &dyn ResourceClient<K>,
    params: &WatchParams,
    state: State<K>,
) -> (StepOutcome<K>, State<K>) {
    match state {
        State::Empty => match client.list(params).await {
            Ok(list) => {
                let resource_version = list.resource_version;
                (
                    StepOutcome::Event(Event::Restarted(list.items)),
                    State::Listed { resource_version },
                )
            }
            Err(err) => (StepOutcome::Error(err), State::Empty),
        },
        State::Listed { resource_version } => match client.watch(params, &resource_version).await {
            Ok(stream) => (StepOutcome::Quiet, State::Watching {
                resource_version,
                stream,
            }),
            Err(err) => (StepOutcome::Error(err), State::Listed { resource_version }),
        },
        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(event)) => {
                let (event, resource_version) = match event {
                    WatchEvent::Added(obj) => {
                        let rv = obj.resource_version().to_string();
                        (Event::Added(obj), rv)
                    }
                    WatchEvent::Modified(obj) => {
                        let rv = obj.resource_version().to_string();
                        (Event::Modified(obj), rv)
                    }
                    WatchEvent::Deleted(obj) => {
                        let rv = obj.resource_version().to_string();
                        (Event::Deleted(obj), rv)
                    }
                };
                (StepOutcome::Event(event), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Err(err)) => {
                // a lost revision window means the stored revision is useless,
                // start over with a fresh list
                let next = if matches!(err, ClientError::Api { code: 410, .. }) {
                    State::Empty
                } else {
                    State::Listed { resource_version }
                };
                (StepOutcome::Error(err), next)
            }
            None => (StepOutcome::Closed, State::Listed { resource_version }),
        },
    }
}

/// Produce an unbounded stream of [`Event`]s for one resource kind.
///
/// The loop lists, then watches from the listing's revision, reconnecting on
/// errors and clean closes after a [`WatchBackoff`] delay. Any successfully
/// received event resets the failure counter. Payload decode failures are the
/// one unrecoverable class: they are logged and the stream ends.
pub fn watch_events<K: Resource>(
    client: Arc<dyn ResourceClient<K>>,
    params: WatchParams,
    mut backoff: WatchBackoff,
    metrics: Arc<WatchMetrics>,
) -> impl Stream<Item = Event<K>> + Send {
    stream! {
        let mut state = State::Empty;
        loop {
            let (outcome, next_state) = step(client.as_ref(), &params, state).await;
            state = next_state;
            match outcome {
                StepOutcome::Event(event) => {
                    backoff.reset();
                    metrics.event();
                    yield event;
                }
                StepOutcome::Quiet => {}
                StepOutcome::Error(err) => {
                    metrics.error();
                    if err.is_fatal() {
                        tracing::error!(
                            error = %err,
                            kind = K::kind(),
                            "unrecoverable watch failure, ending subscription"
                        );
                        return;
                    }
                    let delay = backoff.next_backoff().unwrap_or_default();
                    tracing::warn!(
                        error = %err,
                        kind = K::kind(),
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "watch failed, backing off before reconnect"
                    );
                    tokio::time::sleep(delay).await;
                }
                StepOutcome::Closed => {
                    metrics.close();
                    let delay = backoff.next_backoff().unwrap_or_default();
                    tracing::debug!(
                        kind = K::kind(),
                        delay_ms = delay.as_millis() as u64,
                        "watch closed by server, re-subscribing"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Owns the background task running one watch loop and forwards its events
/// into a bounded channel (a full channel suspends the task rather than
/// dropping events).
pub struct Watcher<K: Resource> {
    client: Arc<dyn ResourceClient<K>>,
    params: WatchParams,
    backoff: WatchBackoff,
    metrics: Arc<WatchMetrics>,
    tx: mpsc::Sender<Event<K>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<K: Resource> Watcher<K> {
    pub fn new(
        client: Arc<dyn ResourceClient<K>>,
        params: WatchParams,
        backoff: WatchBackoff,
        tx: mpsc::Sender<Event<K>>,
        metrics: Arc<WatchMetrics>,
    ) -> Self {
        Self {
            client,
            params,
            backoff,
            metrics,
            tx,
            stop: CancellationToken::new(),
            task: None,
        }
    }

    /// Spawn the subscription task; calling again while running is a no-op
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let events = watch_events(
            Arc::clone(&self.client),
            self.params.clone(),
            self.backoff.clone(),
            Arc::clone(&self.metrics),
        );
        let tx = self.tx.clone();
        let stop = self.stop.clone();
        let metrics = Arc::clone(&self.metrics);
        self.task = Some(tokio::spawn(async move {
            metrics.set_running(true);
            futures::pin_mut!(events);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => {
                            // keep the stop signal live while backpressured
                            tokio::select! {
                                () = stop.cancelled() => break,
                                sent = tx.send(event) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        // the subscription ended itself (fatal failure)
                        None => break,
                    },
                }
            }
            metrics.set_running(false);
        }));
    }

    /// Cancel the subscription and any in-flight backoff wait.
    ///
    /// Safe to call repeatedly or before [`Watcher::start`].
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
