//! Node-scoped pod cache with deletion notifications
//!
//! Watches the pods scheduled to this node and keeps them in memory. Lookups
//! that miss the cache can be confirmed against the API server, which is what
//! the GC loop relies on before reclaiming anything.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::k8s::AssumedAnnotations;
use crate::k8s::KubernetesError;

/// Outcome of an authoritative pod lookup.
#[derive(Debug, Clone)]
pub enum PodLookup {
    Found(Box<Pod>),
    NotFound,
}

/// A pod left the node. `assumed` records whether it carried the scheduler's
/// marker annotation when it was last seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDeleted {
    pub namespace: String,
    pub name: String,
    pub assumed: bool,
}

pub type DeletionHook = Arc<dyn Fn(PodDeleted) + Send + Sync>;

/// Read access to the pods of this node.
#[async_trait]
pub trait PodSitter: Send + Sync {
    /// Cached lookup, never touches the network.
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;

    /// Asks the API server directly. `Err` means the answer is unknown, which
    /// callers must not treat as absence.
    async fn get_pod_from_api_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PodLookup, Report<KubernetesError>>;

    /// True once the first full listing has been loaded into the cache.
    fn has_synced(&self) -> bool;
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct PodKey {
    namespace: String,
    name: String,
}

impl PodKey {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn of(pod: &Pod) -> Option<Self> {
        Some(Self::new(
            pod.metadata.namespace.as_deref()?,
            pod.metadata.name.as_deref()?,
        ))
    }
}

/// Pods of this node, kept current from watch events.
pub struct PodCache {
    annotations: AssumedAnnotations,
    pods: DashMap<PodKey, Arc<Pod>>,
    synced: AtomicBool,
    on_delete: Option<DeletionHook>,
}

impl PodCache {
    pub fn new(annotations: AssumedAnnotations) -> Self {
        Self {
            annotations,
            pods: DashMap::new(),
            synced: AtomicBool::new(false),
            on_delete: None,
        }
    }

    /// Called for every pod that disappears from the node.
    pub fn with_deletion_hook(mut self, hook: DeletionHook) -> Self {
        self.on_delete = Some(hook);
        self
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods
            .get(&PodKey::new(namespace, name))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn apply(&self, event: Event<Pod>) {
        match event {
            Event::Applied(pod) => {
                if let Some(key) = PodKey::of(&pod) {
                    self.pods.insert(key, Arc::new(pod));
                }
            }
            Event::Deleted(pod) => {
                if let Some(key) = PodKey::of(&pod) {
                    self.pods.remove(&key);
                    self.notify_deleted(key, &pod);
                }
            }
            Event::Restarted(pods) => {
                let mut fresh = HashMap::with_capacity(pods.len());
                for pod in pods {
                    if let Some(key) = PodKey::of(&pod) {
                        fresh.insert(key, Arc::new(pod));
                    }
                }

                // pods deleted while the watch was down never get a Deleted event
                let vanished: Vec<(PodKey, Arc<Pod>)> = self
                    .pods
                    .iter()
                    .filter(|entry| !fresh.contains_key(entry.key()))
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect();
                for (key, pod) in vanished {
                    self.pods.remove(&key);
                    self.notify_deleted(key, &pod);
                }

                let count = fresh.len();
                for (key, pod) in fresh {
                    self.pods.insert(key, pod);
                }
                if !self.synced.swap(true, Ordering::SeqCst) {
                    info!(pods = count, "Pod cache synced");
                }
            }
        }
    }

    fn notify_deleted(&self, key: PodKey, pod: &Pod) {
        let event = PodDeleted {
            assumed: self.annotations.is_assumed(pod),
            namespace: key.namespace,
            name: key.name,
        };
        debug!(
            namespace = %event.namespace,
            pod = %event.name,
            assumed = event.assumed,
            "Pod deleted"
        );
        if let Some(hook) = &self.on_delete {
            hook(event);
        }
    }
}

/// [`PodSitter`] fed by a `spec.nodeName` field-selected pod watch.
pub struct KubePodSitter {
    client: Client,
    node_name: String,
    cache: PodCache,
}

impl KubePodSitter {
    pub fn new(client: Client, node_name: String, cache: PodCache) -> Self {
        Self {
            client,
            node_name,
            cache,
        }
    }

    /// Runs the watch until cancelled, restarting it after failures.
    #[tracing::instrument(skip(self, cancellation_token), fields(node_name = %self.node_name))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting pod sitter");

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod sitter shutdown requested");
                    break;
                }
                result = self.watch_pods() => {
                    match result {
                        Ok(()) => warn!("Pod watch stream ended unexpectedly, restarting..."),
                        Err(e) => {
                            error!("Pod watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    /// Resolves once the cache holds a full listing, or `false` when cancelled.
    pub async fn wait_for_sync(&self, cancellation_token: &CancellationToken) -> bool {
        while !self.has_synced() {
            select! {
                _ = cancellation_token.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
        true
    }

    async fn watch_pods(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = Config::default().fields(&format!("spec.nodeName={}", self.node_name));

        let mut stream = watcher(api, config).boxed();
        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| {
                Report::new(KubernetesError::WatchFailed {
                    message: format!("Watch stream error: {e}"),
                })
            })?;
            self.cache.apply(event);
        }
        Ok(())
    }
}

#[async_trait]
impl PodSitter for KubePodSitter {
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.cache.get(namespace, name)
    }

    async fn get_pod_from_api_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PodLookup, Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api.get_opt(name).await.map_err(|e| {
            Report::new(KubernetesError::RequestFailed {
                message: format!("Failed to get pod {namespace}/{name}"),
            })
            .attach_printable(format!("Kubernetes API error: {e}"))
        })?;

        Ok(match pod {
            Some(pod) => {
                debug!(namespace, pod = name, "Found pod on API server");
                PodLookup::Found(Box::new(pod))
            }
            None => PodLookup::NotFound,
        })
    }

    fn has_synced(&self) -> bool {
        self.cache.has_synced()
    }
}
