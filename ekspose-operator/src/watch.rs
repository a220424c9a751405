//! Local mirror of Deployments and the watch that feeds it.
//!
//! The watch/cache protocol itself is `kube::runtime`'s: [`DeploymentWatch`]
//! drives a `watcher` stream and hands every event to a [`CacheFeed`], which
//! applies it to a reflector store and forwards the interesting ones to the
//! [`EventRouter`]. The reconciler only sees the read side through
//! [`DeploymentCache`].

use crate::events::{EventRouter, Notification};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::WatchStreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, watcher};
use kube::{Api, Client};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Read side of the local Deployment mirror.
pub trait DeploymentCache: Send + Sync {
    /// Whether the initial listing has completed.
    fn has_synced(&self) -> bool;

    /// Cached copy of `namespace/name`, if any.
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>>;
}

/// [`DeploymentCache`] over a reflector store.
#[derive(Clone)]
pub struct WatchCache {
    store: Store<Deployment>,
    synced: Arc<AtomicBool>,
}

impl DeploymentCache for WatchCache {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }
}

/// Write side of a [`WatchCache`].
///
/// Applies watch events to the store and routes them. A listing that no
/// longer contains a previously cached Deployment routes it as deleted, so
/// deletions missed while the watch was down still reach the queue.
pub struct CacheFeed {
    writer: reflector::store::Writer<Deployment>,
    synced: Arc<AtomicBool>,
    before_relist: Option<Vec<Arc<Deployment>>>,
}

/// Create an empty cache and the feed that fills it.
pub fn watch_cache() -> (WatchCache, CacheFeed) {
    let (store, writer) = reflector::store();
    let synced = Arc::new(AtomicBool::new(false));

    let cache = WatchCache {
        store,
        synced: Arc::clone(&synced),
    };
    let feed = CacheFeed {
        writer,
        synced,
        before_relist: None,
    };
    (cache, feed)
}

impl CacheFeed {
    /// Apply `event` to the store and route it.
    pub fn apply(&mut self, router: &EventRouter, event: watcher::Event<Deployment>) {
        if matches!(event, watcher::Event::Init) {
            self.before_relist = Some(self.writer.as_reader().state());
        }

        self.writer.apply_watcher_event(&event);

        match event {
            // Modifications are routed like additions; reconciling an
            // unchanged Deployment is a no-op.
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                router.route(Notification::Added(Arc::new(obj)));
            }
            watcher::Event::Delete(obj) => {
                router.route(Notification::Deleted(Arc::new(obj)));
            }
            watcher::Event::Init => {
                debug!("Deployment listing started");
            }
            watcher::Event::InitDone => {
                self.route_vanished(router);
                if !self.synced.swap(true, Ordering::AcqRel) {
                    info!("Deployment cache synced");
                }
            }
        }
    }

    fn route_vanished(&mut self, router: &EventRouter) {
        let Some(previous) = self.before_relist.take() else {
            return;
        };
        let store = self.writer.as_reader();
        for obj in previous {
            if store.get(&ObjectRef::from_obj(obj.as_ref())).is_none() {
                debug!(
                    namespace = obj.metadata.namespace.as_deref().unwrap_or_default(),
                    name = obj.metadata.name.as_deref().unwrap_or_default(),
                    "Deployment missing from relist"
                );
                router.route(Notification::Deleted(obj));
            }
        }
    }
}

/// Background task keeping a [`WatchCache`] current.
pub struct DeploymentWatch {
    api: Api<Deployment>,
    feed: CacheFeed,
    config: watcher::Config,
}

/// Create the cache and the watch that fills it.
///
/// `namespace` restricts the watch; `None` watches the whole cluster.
pub fn deployment_watch(client: Client, namespace: Option<&str>) -> (WatchCache, DeploymentWatch) {
    let api = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let (cache, feed) = watch_cache();
    let watch = DeploymentWatch {
        api,
        feed,
        config: watcher::Config::default(),
    };
    (cache, watch)
}

impl DeploymentWatch {
    /// Run until `stop` is cancelled or the stream ends.
    pub async fn run(mut self, router: EventRouter, stop: CancellationToken) {
        let mut stream = watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .boxed();

        info!("Deployment watch started");

        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => self.feed.apply(&router, event),
                Some(Err(e)) => {
                    error!(error = %e, "Deployment watch error");
                }
                None => {
                    warn!("Deployment watch stream ended");
                    break;
                }
            }
        }

        info!("Deployment watch stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkQueue;
    use crate::testing::deployment;
    use kube::runtime::watcher::Event;

    fn setup() -> (WatchCache, CacheFeed, EventRouter, Arc<WorkQueue<String>>) {
        let (cache, feed) = watch_cache();
        let queue = Arc::new(WorkQueue::with_defaults("test"));
        let router = EventRouter::new(Arc::clone(&queue));
        (cache, feed, router, queue)
    }

    async fn drain(queue: &WorkQueue<String>) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            if let Some(key) = queue.get().await {
                queue.done(&key);
                keys.push(key);
            }
        }
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn synced_only_after_listing_completes() {
        let (cache, mut feed, router, queue) = setup();

        feed.apply(&router, Event::Init);
        feed.apply(&router, Event::InitApply(deployment("ns1", "web", &[])));
        feed.apply(&router, Event::InitApply(deployment("ns1", "api", &[])));
        assert!(!cache.has_synced());
        assert_eq!(queue.len(), 2);

        feed.apply(&router, Event::InitDone);
        assert!(cache.has_synced());
        assert!(cache.get("ns1", "web").is_some());
        assert_eq!(drain(&queue).await, ["ns1/api", "ns1/web"]);
    }

    #[tokio::test]
    async fn apply_and_delete_enqueue_the_key() {
        let (cache, mut feed, router, queue) = setup();

        feed.apply(&router, Event::Apply(deployment("ns1", "web", &[])));
        assert!(cache.get("ns1", "web").is_some());
        assert_eq!(drain(&queue).await, ["ns1/web"]);

        feed.apply(&router, Event::Delete(deployment("ns1", "web", &[])));
        assert!(cache.get("ns1", "web").is_none());
        assert_eq!(drain(&queue).await, ["ns1/web"]);
    }

    #[tokio::test]
    async fn relist_routes_deployments_deleted_while_disconnected() {
        let (cache, mut feed, router, queue) = setup();

        feed.apply(&router, Event::Init);
        feed.apply(&router, Event::InitApply(deployment("ns1", "web", &[])));
        feed.apply(&router, Event::InitApply(deployment("ns1", "api", &[])));
        feed.apply(&router, Event::InitDone);
        drain(&queue).await;

        // `web` was deleted while the watch was down.
        feed.apply(&router, Event::Init);
        feed.apply(&router, Event::InitApply(deployment("ns1", "api", &[])));
        assert!(cache.get("ns1", "web").is_some());
        assert_eq!(drain(&queue).await, ["ns1/api"]);

        feed.apply(&router, Event::InitDone);
        assert!(cache.get("ns1", "web").is_none());
        assert!(cache.has_synced());
        assert_eq!(drain(&queue).await, ["ns1/web"]);
    }

    #[tokio::test]
    async fn first_listing_routes_no_deletions() {
        let (_cache, mut feed, router, queue) = setup();

        feed.apply(&router, Event::Init);
        feed.apply(&router, Event::InitDone);
        assert!(queue.is_empty());
    }
}
