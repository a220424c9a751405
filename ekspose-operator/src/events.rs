//! Event routing from the Deployment watch into the work queue.
//!
//! Both kinds of notification enqueue the same key. Whether a key leads to
//! creation or deletion is decided later by the reconciler from live cluster
//! state, so a lost or reordered delete notification is repaired by the next
//! reconciliation of that key.

use crate::key::object_key;
use crate::queue::WorkQueue;
use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;

/// A change observed on a Deployment.
#[derive(Debug, Clone)]
pub enum Notification {
    /// The Deployment was created (or observed during a listing).
    Added(Arc<Deployment>),
    /// The Deployment was removed.
    Deleted(Arc<Deployment>),
}

impl Notification {
    /// The Deployment the notification is about.
    pub fn object(&self) -> &Deployment {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Turns notifications into queue keys.
///
/// Cheap to clone and safe to call from any task.
#[derive(Clone)]
pub struct EventRouter {
    queue: Arc<WorkQueue<String>>,
}

impl EventRouter {
    /// Route into `queue`.
    pub fn new(queue: Arc<WorkQueue<String>>) -> Self {
        Self { queue }
    }

    /// Enqueue the key of the notified Deployment.
    pub fn route(&self, notification: Notification) {
        let key = object_key(notification.object());
        tracing::debug!(
            queue = %self.queue.name(),
            key = %key,
            event = notification.kind(),
            "Deployment event"
        );
        self.queue.add(key);
    }

    /// Shorthand for routing [`Notification::Added`].
    pub fn on_add(&self, deployment: Arc<Deployment>) {
        self.route(Notification::Added(deployment));
    }

    /// Shorthand for routing [`Notification::Deleted`].
    pub fn on_delete(&self, deployment: Arc<Deployment>) {
        self.route(Notification::Deleted(deployment));
    }
}
