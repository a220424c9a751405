//! Cluster-apply boundary.
//!
//! [`ClusterApi`] is everything the reconciler asks of the cluster: the live
//! existence check for a Deployment and the create/delete calls for its
//! children. [`KubeClusterApi`] implements it with `kube`; tests use
//! [`crate::testing::MockCluster`].

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by the cluster API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The object does not exist.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// Object namespace.
        namespace: String,
        /// Object name.
        name: String,
    },

    /// An object with the same name already exists.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// Object namespace.
        namespace: String,
        /// Object name.
        name: String,
    },

    /// Any other failure talking to the API server. Retryable.
    #[error("API request failed: {0}")]
    Remote(String),
}

impl ApiError {
    /// Whether the target object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the target object already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Classify a `kube` error for the object `kind` `namespace/name`.
    pub fn from_kube(err: kube::Error, kind: &'static str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => Self::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            other => Self::Remote(other.to_string()),
        }
    }
}

/// Result type for cluster API calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Type alias for cluster API futures.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = ApiResult<T>> + Send + 'a>>;

/// Operations the reconciler performs against the cluster.
///
/// Every call is a point-in-time request; none of them stream.
pub trait ClusterApi: Send + Sync {
    /// Read a Deployment from the API server, bypassing any cache.
    ///
    /// Returns `Ok(None)` when it does not exist.
    fn get_deployment(&self, namespace: &str, name: &str) -> ApiFuture<'_, Option<Deployment>>;

    /// Create a Service.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if a Service with that name exists
    /// - `Remote` for anything else
    fn create_service(&self, service: &Service) -> ApiFuture<'_, Service>;

    /// Create an Ingress.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if an Ingress with that name exists
    /// - `Remote` for anything else
    fn create_ingress(&self, ingress: &Ingress) -> ApiFuture<'_, Ingress>;

    /// Delete a Service. Succeeds if it is already gone.
    fn delete_service(&self, namespace: &str, name: &str) -> ApiFuture<'_, ()>;

    /// Delete an Ingress. Succeeds if it is already gone.
    fn delete_ingress(&self, namespace: &str, name: &str) -> ApiFuture<'_, ()>;
}

/// [`ClusterApi`] backed by a `kube` client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ClusterApi for KubeClusterApi {
    fn get_deployment(&self, namespace: &str, name: &str) -> ApiFuture<'_, Option<Deployment>> {
        let api: Api<Deployment> = self.api(namespace);
        let namespace = namespace.to_string();
        let name = name.to_string();
        Box::pin(async move {
            api.get_opt(&name)
                .await
                .map_err(|e| ApiError::from_kube(e, "Deployment", &namespace, &name))
        })
    }

    fn create_service(&self, service: &Service) -> ApiFuture<'_, Service> {
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = self.api(&namespace);
        let service = service.clone();
        Box::pin(async move { create(api, "Service", &namespace, service).await })
    }

    fn create_ingress(&self, ingress: &Ingress) -> ApiFuture<'_, Ingress> {
        let namespace = ingress.namespace().unwrap_or_default();
        let api: Api<Ingress> = self.api(&namespace);
        let ingress = ingress.clone();
        Box::pin(async move { create(api, "Ingress", &namespace, ingress).await })
    }

    fn delete_service(&self, namespace: &str, name: &str) -> ApiFuture<'_, ()> {
        let api: Api<Service> = self.api(namespace);
        let namespace = namespace.to_string();
        let name = name.to_string();
        Box::pin(async move { delete(api, "Service", &namespace, &name).await })
    }

    fn delete_ingress(&self, namespace: &str, name: &str) -> ApiFuture<'_, ()> {
        let api: Api<Ingress> = self.api(namespace);
        let namespace = namespace.to_string();
        let name = name.to_string();
        Box::pin(async move { delete(api, "Ingress", &namespace, &name).await })
    }
}

async fn create<K>(api: Api<K>, kind: &'static str, namespace: &str, obj: K) -> ApiResult<K>
where
    K: Resource + Clone + DeserializeOwned + serde::Serialize + Debug,
{
    let name = obj.name_any();
    api.create(&PostParams::default(), &obj)
        .await
        .map_err(|e| ApiError::from_kube(e, kind, namespace, &name))
}

async fn delete<K>(api: Api<K>, kind: &'static str, namespace: &str, name: &str) -> ApiResult<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let result = api.delete(name, &DeleteParams::default()).await;
    delete_outcome(result, kind, namespace, name)
}

/// Map a delete response: an object that is already gone counts as deleted.
fn delete_outcome<T>(
    result: Result<T, kube::Error>,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> ApiResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(e) => Err(ApiError::from_kube(e, kind, namespace, name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "Test".into(),
            code,
        })
    }

    #[test]
    fn classifies_status_codes() {
        let not_found = ApiError::from_kube(api_error(404), "Service", "ns1", "web");
        assert!(not_found.is_not_found());
        assert_eq!(not_found.to_string(), "Service ns1/web not found");

        let exists = ApiError::from_kube(api_error(409), "Ingress", "ns1", "web");
        assert!(exists.is_already_exists());
        assert_eq!(exists.to_string(), "Ingress ns1/web already exists");

        let remote = ApiError::from_kube(api_error(500), "Service", "ns1", "web");
        assert!(matches!(remote, ApiError::Remote(_)));
        assert!(!remote.is_not_found());
        assert!(!remote.is_already_exists());
    }

    #[test]
    fn delete_of_missing_object_succeeds() {
        assert_eq!(delete_outcome(Ok(()), "Service", "ns1", "web"), Ok(()));
        assert_eq!(
            delete_outcome::<()>(Err(api_error(404)), "Service", "ns1", "web"),
            Ok(())
        );
    }

    #[test]
    fn delete_failures_other_than_missing_are_reported() {
        let conflict = delete_outcome::<()>(Err(api_error(409)), "Ingress", "ns1", "web");
        assert!(matches!(conflict, Err(ApiError::AlreadyExists { .. })));

        let remote = delete_outcome::<()>(Err(api_error(503)), "Ingress", "ns1", "web");
        assert!(matches!(remote, Err(ApiError::Remote(_))));
    }
}
