//! Desired state of the child resources derived from a Deployment.
//!
//! Everything here is pure: the same Deployment always yields the same
//! Service and Ingress.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Label marking objects created by this controller.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`].
pub const MANAGED_BY: &str = "ekspose";

/// Name of the single Service port.
pub const SERVICE_PORT_NAME: &str = "http";

/// Port exposed by the Service and targeted by the Ingress.
pub const SERVICE_PORT: i32 = 80;

/// Knobs that shape the children but do not come from the Deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildOptions {
    /// `spec.ingressClassName` of the Ingress.
    pub ingress_class: Option<String>,
}

/// Service and Ingress a Deployment should have.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredChildren {
    /// Service selecting the Deployment's pods.
    pub service: Service,
    /// Ingress routing `/<service-name>` to the Service.
    pub ingress: Ingress,
}

/// Labels of the Deployment's pod template.
pub fn template_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default()
}

/// Compute both children for the Deployment `namespace/name`.
pub fn desired_children(
    namespace: &str,
    name: &str,
    deployment: &Deployment,
    options: &ChildOptions,
) -> DesiredChildren {
    let service = build_service(namespace, name, template_labels(deployment));
    let ingress = build_ingress(namespace, name, options.ingress_class.as_deref());
    DesiredChildren { service, ingress }
}

/// Service named after the Deployment, selecting `selector`, with one `http`
/// port on 80.
pub fn build_service(namespace: &str, name: &str, selector: BTreeMap<String, String>) -> Service {
    Service {
        metadata: child_metadata(namespace, name),
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some(SERVICE_PORT_NAME.to_string()),
                port: SERVICE_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress named after the Service, routing the `/<service>` prefix to
/// `<service>:80`.
pub fn build_ingress(namespace: &str, service_name: &str, ingress_class: Option<&str>) -> Ingress {
    Ingress {
        metadata: child_metadata(namespace, service_name),
        spec: Some(IngressSpec {
            ingress_class_name: ingress_class.map(str::to_string),
            rules: Some(vec![IngressRule {
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(route_path(service_name)),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service_name.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(SERVICE_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// URL path of the route for a Service.
pub fn route_path(service_name: &str) -> String {
    format!("/{service_name}")
}

fn child_metadata(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(
            LABEL_MANAGED_BY.to_string(),
            MANAGED_BY.to_string(),
        )])),
        ..Default::default()
    }
}
