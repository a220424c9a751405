//! ekspose: expose every Deployment through a Service and an Ingress.
//!
//! The operator watches Deployments. For each one it makes sure a Service
//! named after the Deployment selects its pods on port 80, and an Ingress
//! routes `/<name>` to that Service. When the Deployment goes away both
//! children are deleted.
//!
//! # Pipeline
//!
//! - [`watch`]: mirrors Deployments locally and reports changes
//! - [`events`]: turns changes into `namespace/name` keys
//! - [`queue`]: deduplicating, rate-limited work queue
//! - [`controller`]: cache-sync gate, reconciler and worker loops
//! - [`cluster`]: the calls made against the API server
//!
//! Children are only ever created; an existing Service or Ingress is left
//! untouched.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod key;
pub mod observability;
pub mod queue;
pub mod resources;
pub mod testing;
pub mod watch;

pub use cluster::{ApiError, ClusterApi, KubeClusterApi};
pub use config::{ControllerConfig, QueueConfig};
pub use controller::{Controller, ReconcileOutcome, Reconciler};
pub use error::{OperatorError, OperatorResult};
pub use events::{EventRouter, Notification};
pub use queue::WorkQueue;
pub use watch::{CacheFeed, DeploymentCache, WatchCache, deployment_watch, watch_cache};
