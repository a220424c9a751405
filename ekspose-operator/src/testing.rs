//! In-memory stand-ins for the cluster and the Deployment cache.
//!
//! [`MockCluster`] keeps Deployments, Services and Ingresses in maps and
//! behaves like the API server where it matters to the reconciler: creating
//! an existing child fails with `AlreadyExists`, deleting a missing one
//! succeeds. Failures can be scripted per operation and every call is
//! recorded.

use crate::cluster::{ApiError, ApiFuture, ApiResult, ClusterApi};
use crate::watch::DeploymentCache;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

type ObjectKey = (String, String);

/// Build a Deployment whose selector and pod template carry `labels`.
pub fn deployment(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Deployment {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Cluster API operations, as recorded by [`MockCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `get_deployment`
    GetDeployment,
    /// `create_service`
    CreateService,
    /// `create_ingress`
    CreateIngress,
    /// `delete_service`
    DeleteService,
    /// `delete_ingress`
    DeleteIngress,
}

#[derive(Default)]
struct ClusterState {
    deployments: HashMap<ObjectKey, Deployment>,
    services: HashMap<ObjectKey, Service>,
    ingresses: HashMap<ObjectKey, Ingress>,
    failures: HashMap<Op, VecDeque<ApiError>>,
    calls: Vec<Op>,
}

/// In-memory [`ClusterApi`].
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<ClusterState>,
    latency: Option<Duration>,
    in_flight: Mutex<HashMap<ObjectKey, usize>>,
    max_in_flight_per_key: AtomicUsize,
}

impl MockCluster {
    /// Empty cluster answering instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty cluster where every call takes `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Create or replace a Deployment.
    pub fn put_deployment(&self, deployment: Deployment) {
        let key = object_key(&deployment);
        self.state.lock().deployments.insert(key, deployment);
    }

    /// Remove a Deployment.
    pub fn remove_deployment(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .deployments
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Seed a Service directly.
    pub fn put_service(&self, service: Service) {
        let key = object_key(&service);
        self.state.lock().services.insert(key, service);
    }

    /// Seed an Ingress directly.
    pub fn put_ingress(&self, ingress: Ingress) {
        let key = object_key(&ingress);
        self.state.lock().ingresses.insert(key, ingress);
    }

    /// Current Service `namespace/name`.
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Current Ingress `namespace/name`.
    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.state
            .lock()
            .ingresses
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Make the next call of `op` fail with `error`. Calls queue up.
    pub fn fail_next(&self, op: Op, error: ApiError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Op> {
        self.state.lock().calls.clone()
    }

    /// Number of calls made for `op`.
    pub fn call_count(&self, op: Op) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Highest number of calls ever in flight for a single object.
    pub fn max_in_flight_per_key(&self) -> usize {
        self.max_in_flight_per_key.load(Ordering::SeqCst)
    }

    fn call<T, F>(&self, op: Op, key: ObjectKey, apply: F) -> ApiFuture<'_, T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ClusterState) -> ApiResult<T> + Send + 'static,
    {
        Box::pin(async move {
            let _guard = InFlightGuard::enter(self, key);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }

            let mut state = self.state.lock();
            state.calls.push(op);
            if let Some(error) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
                return Err(error);
            }
            apply(&mut *state)
        })
    }
}

impl ClusterApi for MockCluster {
    fn get_deployment(&self, namespace: &str, name: &str) -> ApiFuture<'_, Option<Deployment>> {
        let key = (namespace.to_string(), name.to_string());
        let lookup = key.clone();
        self.call(Op::GetDeployment, key, move |state| {
            Ok(state.deployments.get(&lookup).cloned())
        })
    }

    fn create_service(&self, service: &Service) -> ApiFuture<'_, Service> {
        let key = object_key(service);
        let service = service.clone();
        let target = key.clone();
        self.call(Op::CreateService, key, move |state| {
            if state.services.contains_key(&target) {
                return Err(already_exists("Service", &target));
            }
            state.services.insert(target, service.clone());
            Ok(service)
        })
    }

    fn create_ingress(&self, ingress: &Ingress) -> ApiFuture<'_, Ingress> {
        let key = object_key(ingress);
        let ingress = ingress.clone();
        let target = key.clone();
        self.call(Op::CreateIngress, key, move |state| {
            if state.ingresses.contains_key(&target) {
                return Err(already_exists("Ingress", &target));
            }
            state.ingresses.insert(target, ingress.clone());
            Ok(ingress)
        })
    }

    fn delete_service(&self, namespace: &str, name: &str) -> ApiFuture<'_, ()> {
        let key = (namespace.to_string(), name.to_string());
        let target = key.clone();
        self.call(Op::DeleteService, key, move |state| {
            state.services.remove(&target);
            Ok(())
        })
    }

    fn delete_ingress(&self, namespace: &str, name: &str) -> ApiFuture<'_, ()> {
        let key = (namespace.to_string(), name.to_string());
        let target = key.clone();
        self.call(Op::DeleteIngress, key, move |state| {
            state.ingresses.remove(&target);
            Ok(())
        })
    }
}

struct InFlightGuard<'a> {
    cluster: &'a MockCluster,
    key: ObjectKey,
}

impl<'a> InFlightGuard<'a> {
    fn enter(cluster: &'a MockCluster, key: ObjectKey) -> Self {
        let count = {
            let mut in_flight = cluster.in_flight.lock();
            let count = in_flight.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        cluster
            .max_in_flight_per_key
            .fetch_max(count, Ordering::SeqCst);
        Self { cluster, key }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.cluster.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
    }
}

fn object_key<K: ResourceExt>(obj: &K) -> ObjectKey {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn already_exists(kind: &'static str, key: &ObjectKey) -> ApiError {
    ApiError::AlreadyExists {
        kind,
        namespace: key.0.clone(),
        name: key.1.clone(),
    }
}

/// In-memory [`DeploymentCache`].
#[derive(Default)]
pub struct MockCache {
    synced: AtomicBool,
    objects: RwLock<HashMap<ObjectKey, Arc<Deployment>>>,
}

impl MockCache {
    /// Empty cache that has not synced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty cache that reports synced.
    pub fn synced() -> Self {
        let cache = Self::new();
        cache.set_synced(true);
        cache
    }

    /// Flip the synced flag.
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Insert or replace a Deployment.
    pub fn insert(&self, deployment: Deployment) {
        let key = object_key(&deployment);
        self.objects.write().insert(key, Arc::new(deployment));
    }

    /// Remove a Deployment.
    pub fn remove(&self, namespace: &str, name: &str) {
        self.objects
            .write()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

impl DeploymentCache for MockCache {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.objects
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}
