//! The Deployment exposure controller.
//!
//! A [`Controller`] owns the work queue and the reconciler. The watch feeds it
//! through [`Controller::router`]; [`Controller::run`] waits for the cache to
//! sync, then runs the worker loops until the stop token fires.
//!
//! ```ignore
//! let (cache, watch) = deployment_watch(client.clone(), None);
//! let controller = Controller::new(config, Arc::new(KubeClusterApi::new(client)), Arc::new(cache))?;
//! tokio::spawn(watch.run(controller.router(), stop.clone()));
//! controller.run(stop).await?;
//! ```

mod reconciler;
mod sync;
mod worker;

pub use reconciler::{ReconcileOutcome, Reconciler};
pub use sync::{SYNC_POLL_INTERVAL, wait_for_sync};
pub use worker::{WORKER_RESTART_DELAY, process_next_item, run_worker};

use crate::cluster::ClusterApi;
use crate::config::ControllerConfig;
use crate::error::{OperatorError, OperatorResult};
use crate::events::EventRouter;
use crate::queue::WorkQueue;
use crate::resources::ChildOptions;
use crate::watch::DeploymentCache;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Keeps a Service and an Ingress alongside every Deployment.
pub struct Controller {
    config: ControllerConfig,
    queue: Arc<WorkQueue<String>>,
    cache: Arc<dyn DeploymentCache>,
    reconciler: Reconciler,
}

impl Controller {
    /// Create a controller.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(
        config: ControllerConfig,
        api: Arc<dyn ClusterApi>,
        cache: Arc<dyn DeploymentCache>,
    ) -> OperatorResult<Self> {
        config.validate()?;

        let queue = Arc::new(WorkQueue::new(config.queue_name.clone(), &config.queue));
        let options = ChildOptions {
            ingress_class: config.ingress_class.clone(),
        };
        let reconciler = Reconciler::new(api, Arc::clone(&cache), options);

        Ok(Self {
            config,
            queue,
            cache,
            reconciler,
        })
    }

    /// Router that feeds Deployment events into this controller's queue.
    pub fn router(&self) -> EventRouter {
        EventRouter::new(Arc::clone(&self.queue))
    }

    /// The work queue.
    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// Controller configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run until `stop` is cancelled.
    ///
    /// Workers only start once the cache has synced. Keys already being
    /// reconciled when `stop` fires are finished before this returns.
    ///
    /// # Errors
    ///
    /// Returns `CacheNotSynced` if `stop` fires before the cache syncs. No
    /// worker is started in that case.
    pub async fn run(&self, stop: CancellationToken) -> OperatorResult<()> {
        tracing::info!(
            queue = %self.queue.name(),
            workers = self.config.workers,
            "Starting controller"
        );

        tracing::info!("Waiting for Deployment cache to sync");
        if !wait_for_sync(self.cache.as_ref(), &stop).await {
            tracing::error!("Deployment cache did not sync, not starting workers");
            self.queue.shut_down();
            return Err(OperatorError::CacheNotSynced("Deployments".to_string()));
        }

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            workers.spawn(run_worker(
                id,
                Arc::clone(&self.queue),
                self.reconciler.clone(),
                stop.clone(),
            ));
        }
        tracing::info!(workers = self.config.workers, "Workers started");

        stop.cancelled().await;
        tracing::info!("Shutting down controller");
        self.queue.shut_down();

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task failed");
            }
        }

        tracing::info!("Controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCache, MockCluster};

    #[test]
    fn rejects_invalid_config() {
        let result = Controller::new(
            ControllerConfig::new().workers(0),
            Arc::new(MockCluster::new()),
            Arc::new(MockCache::synced()),
        );
        assert!(matches!(result, Err(OperatorError::InvalidConfig(_))));
    }

    #[test]
    fn router_feeds_the_controller_queue() {
        let controller = Controller::new(
            ControllerConfig::new(),
            Arc::new(MockCluster::new()),
            Arc::new(MockCache::synced()),
        )
        .unwrap();

        controller
            .router()
            .on_add(Arc::new(crate::testing::deployment("ns1", "web", &[])));
        assert_eq!(controller.queue().len(), 1);
        assert_eq!(controller.queue().name(), "ekspose");
    }
}
