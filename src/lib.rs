//! Runtime building blocks for Kubernetes operators
//!
//! This crate turns a noisy, at-least-once change stream from the control
//! plane into ordered, de-duplicated, retryable reconcile invocations:
//!
//! - [`watcher`]: list-then-watch subscription per kind, reconnecting with
//!   bounded exponential [`backoff`]
//! - [`cache`]: last-observed snapshots per object, classifying each change
//! - [`scheduler`]: delayed requeues with last-writer-wins replacement
//! - [`elector`]: lease-based leader election gating all callbacks
//! - [`finalizer`]: cleanup obligations that must clear before deletion
//! - [`controller`]: the dispatcher wiring the above into user callbacks
//! - [`operator`]: explicit startup-time registration of controllers behind
//!   one shared election
//!
//! The control-plane API itself stays behind the [`client`] traits; bind them
//! to an HTTP client in production and to an in-memory implementation in
//! tests.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod controller;
pub mod elector;
pub mod finalizer;
pub mod metrics;
pub mod operator;
pub mod resource;
pub mod scheduler;
pub mod watcher;

#[cfg(test)]
pub(crate) mod fixtures;

pub use self::backoff::WatchBackoff;
pub use cache::{Classification, Store};
pub use controller::{Context, Controller, EntityController};
pub use elector::{ElectionConfig, Elector, ElectorHandle, LeaderState};
pub use finalizer::{Finalizer, FinalizerSet};
pub use operator::{Operator, OperatorHandle};
pub use resource::{Meta, ObjectId, Resource, ResourceExt};
pub use scheduler::scheduler;
pub use watcher::{watch_events, Event, Watcher};

/// Errors returned by user-supplied callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
