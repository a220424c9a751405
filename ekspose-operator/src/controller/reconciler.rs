//! Per-key reconciliation.
//!
//! For one key the reconciler:
//! 1. Splits it into namespace and name (malformed keys are dropped)
//! 2. Asks the API server whether the Deployment still exists
//! 3. If it does not, deletes the Service and the Ingress
//! 4. If it does, creates the Service and then the Ingress
//!
//! The existence check goes to the API server rather than the cache: a cache
//! lagging behind a deletion must never be what triggers a cascade, and a
//! cache lagging behind a creation must never hide one.

use crate::cluster::{ApiError, ClusterApi};
use crate::key::ReconcileKey;
use crate::resources::{self, ChildOptions};
use crate::watch::DeploymentCache;
use k8s_openapi::api::apps::v1::Deployment;
use std::fmt;
use std::sync::Arc;

/// Result of reconciling one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Both children exist.
    Applied,
    /// The Deployment is gone and so are both children.
    DeletedCascade,
    /// The key could not be decomposed into namespace and name.
    NotFoundTransient,
    /// A remote call failed; the key should be retried.
    Failed(String),
}

impl ReconcileOutcome {
    /// Whether the key reached its desired state.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Applied | Self::DeletedCascade)
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => f.write_str("applied"),
            Self::DeletedCascade => f.write_str("deleted"),
            Self::NotFoundTransient => f.write_str("dropped"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Drives one key towards its desired state.
#[derive(Clone)]
pub struct Reconciler {
    api: Arc<dyn ClusterApi>,
    cache: Arc<dyn DeploymentCache>,
    options: ChildOptions,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        cache: Arc<dyn DeploymentCache>,
        options: ChildOptions,
    ) -> Self {
        Self {
            api,
            cache,
            options,
        }
    }

    /// Reconcile the queue entry `raw_key`.
    ///
    /// Never returns an error: every failure becomes a [`ReconcileOutcome`].
    pub async fn reconcile(&self, raw_key: &str) -> ReconcileOutcome {
        let key = match ReconcileKey::parse(raw_key) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(key = %raw_key, error = %e, "Dropping malformed key");
                return ReconcileOutcome::NotFoundTransient;
            }
        };

        tracing::debug!(key = %key, "Reconciling Deployment");

        match self.api.get_deployment(key.namespace(), key.name()).await {
            Ok(Some(live)) => self.apply_children(&key, live).await,
            Ok(None) => self.delete_children(&key).await,
            Err(e) if e.is_not_found() => self.delete_children(&key).await,
            Err(e) => {
                tracing::error!(
                    key = %key,
                    operation = "get_deployment",
                    error = %e,
                    "Failed to read Deployment"
                );
                ReconcileOutcome::Failed(format!("get Deployment: {e}"))
            }
        }
    }

    async fn apply_children(&self, key: &ReconcileKey, live: Deployment) -> ReconcileOutcome {
        // Existence is already confirmed. The cache may not hold a brand-new
        // Deployment yet.
        let deployment = self
            .cache
            .get(key.namespace(), key.name())
            .unwrap_or_else(|| {
                tracing::debug!(key = %key, "Deployment not cached yet, using live copy");
                Arc::new(live)
            });

        let desired =
            resources::desired_children(key.namespace(), key.name(), &deployment, &self.options);

        match self.api.create_service(&desired.service).await {
            Ok(_) => tracing::info!(key = %key, "Created Service"),
            Err(e) if e.is_already_exists() => {
                tracing::debug!(key = %key, "Service already exists");
            }
            Err(e) => {
                log_failure(key, "create_service", &e);
                return ReconcileOutcome::Failed(format!("create Service: {e}"));
            }
        }

        match self.api.create_ingress(&desired.ingress).await {
            Ok(_) => tracing::info!(key = %key, "Created Ingress"),
            Err(e) if e.is_already_exists() => {
                tracing::debug!(key = %key, "Ingress already exists");
            }
            Err(e) => {
                log_failure(key, "create_ingress", &e);
                return ReconcileOutcome::Failed(format!("create Ingress: {e}"));
            }
        }

        ReconcileOutcome::Applied
    }

    async fn delete_children(&self, key: &ReconcileKey) -> ReconcileOutcome {
        tracing::info!(key = %key, "Deployment gone, deleting Service and Ingress");

        // Both deletes run regardless of the other's result.
        let service = self.api.delete_service(key.namespace(), key.name()).await;
        let ingress = self.api.delete_ingress(key.namespace(), key.name()).await;

        let mut failures = Vec::new();
        for (kind, operation, result) in [
            ("Service", "delete_service", service),
            ("Ingress", "delete_ingress", ingress),
        ] {
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    log_failure(key, operation, &e);
                    failures.push(format!("delete {kind}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            ReconcileOutcome::DeletedCascade
        } else {
            ReconcileOutcome::Failed(failures.join("; "))
        }
    }
}

fn log_failure(key: &ReconcileKey, operation: &'static str, error: &ApiError) {
    tracing::error!(key = %key, operation, error = %error, "Cluster API call failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCache, MockCluster, Op, deployment};

    fn reconciler(cluster: &Arc<MockCluster>, cache: &Arc<MockCache>) -> Reconciler {
        Reconciler::new(
            Arc::clone(cluster) as Arc<dyn ClusterApi>,
            Arc::clone(cache) as Arc<dyn DeploymentCache>,
            ChildOptions::default(),
        )
    }

    #[tokio::test]
    async fn uses_live_copy_when_cache_lags() {
        let cluster = Arc::new(MockCluster::new());
        let cache = Arc::new(MockCache::synced());
        cluster.put_deployment(deployment("ns1", "web", &[("app", "web")]));

        let outcome = reconciler(&cluster, &cache).reconcile("ns1/web").await;
        assert_eq!(outcome, ReconcileOutcome::Applied);

        let service = cluster.service("ns1", "web").unwrap();
        let selector = service.spec.unwrap().selector.unwrap();
        assert_eq!(selector["app"], "web");
    }

    #[tokio::test]
    async fn cached_template_labels_are_used() {
        let cluster = Arc::new(MockCluster::new());
        let cache = Arc::new(MockCache::synced());
        cluster.put_deployment(deployment("ns1", "web", &[("app", "live")]));
        cache.insert(deployment("ns1", "web", &[("app", "cached")]));

        reconciler(&cluster, &cache).reconcile("ns1/web").await;

        let service = cluster.service("ns1", "web").unwrap();
        assert_eq!(service.spec.unwrap().selector.unwrap()["app"], "cached");
    }

    #[tokio::test]
    async fn live_lookup_failure_is_retryable_and_touches_nothing() {
        let cluster = Arc::new(MockCluster::new());
        let cache = Arc::new(MockCache::synced());
        cluster.fail_next(Op::GetDeployment, ApiError::Remote("timeout".into()));

        let outcome = reconciler(&cluster, &cache).reconcile("ns1/web").await;
        assert!(matches!(outcome, ReconcileOutcome::Failed(ref r) if r.contains("timeout")));
        assert_eq!(cluster.calls(), vec![Op::GetDeployment]);
    }

    #[tokio::test]
    async fn delete_failures_are_reported_together() {
        let cluster = Arc::new(MockCluster::new());
        let cache = Arc::new(MockCache::synced());
        cluster.fail_next(Op::DeleteService, ApiError::Remote("svc down".into()));
        cluster.fail_next(Op::DeleteIngress, ApiError::Remote("ing down".into()));

        let outcome = reconciler(&cluster, &cache).reconcile("ns1/web").await;
        let ReconcileOutcome::Failed(reason) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("svc down"));
        assert!(reason.contains("ing down"));
    }

    #[test]
    fn outcome_display() {
        assert_eq!(ReconcileOutcome::Applied.to_string(), "applied");
        assert_eq!(
            ReconcileOutcome::Failed("x".into()).to_string(),
            "failed: x"
        );
        assert!(ReconcileOutcome::DeletedCascade.is_success());
        assert!(!ReconcileOutcome::NotFoundTransient.is_success());
    }
}
