//! Hosts any number of controllers behind one shared leader election
//!
//! Registration is explicit: every entity type is wired in with a builder
//! call at startup, so the full set of controllers is plain configuration
//! with no runtime type scanning.

use crate::{
    client::LeaseClient,
    controller::{Controller, EntityController},
    elector::{ElectionConfig, Elector, ElectorHandle, InvalidConfig, LeaderState},
    resource::Resource,
};
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

type StartFn = Box<dyn FnOnce(watch::Receiver<LeaderState>, CancellationToken) -> JoinHandle<()> + Send>;

/// Collects controllers and election settings before anything runs
#[derive(Default)]
pub struct OperatorBuilder {
    election: Option<(ElectionConfig, Arc<dyn LeaseClient>)>,
    controllers: Vec<StartFn>,
}

impl OperatorBuilder {
    /// Gate every controller on holding the named lease.
    ///
    /// Without this, each replica behaves as the sole leader.
    pub fn leader_election(
        mut self,
        config: ElectionConfig,
        client: Arc<dyn LeaseClient>,
    ) -> Result<Self, InvalidConfig> {
        self.election = Some((config.validate()?, client));
        Ok(self)
    }

    /// Register one controller together with its callback handler
    #[must_use]
    pub fn controller<K: Resource>(
        mut self,
        controller: Controller<K>,
        handler: Arc<dyn EntityController<K>>,
    ) -> Self {
        self.controllers.push(Box::new(move |leadership, stop| {
            tokio::spawn(controller.run(handler, leadership, stop))
        }));
        self
    }

    #[must_use]
    pub fn build(self) -> Operator {
        Operator {
            election: self.election,
            controllers: self.controllers,
        }
    }
}

/// A fully configured operator, ready to spawn
pub struct Operator {
    election: Option<(ElectionConfig, Arc<dyn LeaseClient>)>,
    controllers: Vec<StartFn>,
}

impl Operator {
    #[must_use]
    pub fn builder() -> OperatorBuilder {
        OperatorBuilder::default()
    }

    /// Start the elector and one dispatch task per registered controller
    #[must_use = "dropping the handle leaks the spawned tasks"]
    pub fn spawn(self) -> OperatorHandle {
        let elector = match self.election {
            Some((config, client)) => Elector::spawn(config, client),
            None => ElectorHandle::always_leader(),
        };
        let stop = CancellationToken::new();
        let tasks = self
            .controllers
            .into_iter()
            .map(|start| start(elector.state(), stop.child_token()))
            .collect();
        OperatorHandle { elector, stop, tasks }
    }
}

/// Owns the running elector and controller tasks
pub struct OperatorHandle {
    elector: ElectorHandle,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl OperatorHandle {
    /// Latest observed election state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.elector.state()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    /// Stop every controller, wait for their in-flight callbacks, then shut
    /// the elector down (releasing the lease if held)
    pub async fn shutdown(self) {
        self.stop.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.elector.shutdown().await;
    }
}
