//! In-memory collaborators for exercising the binder and the GC loop without
//! a kubelet, an API server or GPUs.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::Device;
use error_stack::Report;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::fingerprint::DeviceFingerprint;
use crate::k8s::annotations::DEFAULT_ASSUMED_ANNOTATION;
use crate::k8s::annotations::DEFAULT_CONTAINER_ANNOTATION_PREFIX;
use crate::k8s::KubernetesError;
use crate::k8s::PodLookup;
use crate::k8s::PodSitter;
use crate::locator::DeviceLocator;
use crate::locator::LocatorError;
use crate::operator::OperatorError;
use crate::plugin::ResourcePlugin;
use crate::store::BindingStore;
use crate::store::StoreError;
use crate::types::OwnerRef;
use crate::types::PodRecord;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pod carrying the default scheduler annotations. `containers` pairs a
/// container name with its assumed-index value.
pub fn assumed_pod(namespace: &str, name: &str, containers: &[(&str, &str)]) -> Pod {
    let mut annotations = std::collections::BTreeMap::from([(
        DEFAULT_ASSUMED_ANNOTATION.to_string(),
        "true".to_string(),
    )]);
    for (container, value) in containers {
        annotations.insert(
            format!("{DEFAULT_CONTAINER_ANNOTATION_PREFIX}{container}"),
            value.to_string(),
        );
    }
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: containers
                .iter()
                .map(|(container, _)| Container {
                    name: container.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Resolves fingerprints registered with [`FakeLocator::assign`].
#[derive(Default)]
pub struct FakeLocator {
    owners: Mutex<HashMap<DeviceFingerprint, OwnerRef>>,
}

impl FakeLocator {
    pub fn assign(&self, device_ids: &[&str], owner: OwnerRef) {
        lock(&self.owners).insert(DeviceFingerprint::new(device_ids.iter().copied()), owner);
    }
}

#[async_trait]
impl DeviceLocator for FakeLocator {
    async fn locate(&self, fingerprint: &DeviceFingerprint) -> Result<OwnerRef, LocatorError> {
        lock(&self.owners)
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| LocatorError::OwnerNotFound {
                hash: fingerprint.hash.clone(),
            })
    }

    async fn list(&self) -> Result<Vec<PodRecord>, LocatorError> {
        Ok(Vec::new())
    }
}

/// Pods split between the watch cache (`insert`) and the API server
/// (`insert_remote`). Pods only in the cache count as present on the API
/// server too.
pub struct FakeSitter {
    cached: Mutex<HashMap<(String, String), Arc<Pod>>>,
    remote: Mutex<HashMap<(String, String), Pod>>,
    api_down: AtomicBool,
    synced: AtomicBool,
}

impl Default for FakeSitter {
    fn default() -> Self {
        Self {
            cached: Mutex::default(),
            remote: Mutex::default(),
            api_down: AtomicBool::new(false),
            synced: AtomicBool::new(true),
        }
    }
}

impl FakeSitter {
    pub fn insert(&self, pod: Pod) {
        lock(&self.cached).insert(key_of(&pod), Arc::new(pod));
    }

    pub fn insert_remote(&self, pod: Pod) {
        lock(&self.remote).insert(key_of(&pod), pod);
    }

    /// Drops the pod from both the cache and the API server.
    pub fn remove(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        lock(&self.cached).remove(&key);
        lock(&self.remote).remove(&key);
    }

    /// Makes every API server lookup fail.
    pub fn set_api_down(&self, down: bool) {
        self.api_down.store(down, Ordering::SeqCst);
    }
}

fn key_of(pod: &Pod) -> (String, String) {
    (
        pod.metadata.namespace.clone().unwrap_or_default(),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl PodSitter for FakeSitter {
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        lock(&self.cached)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    async fn get_pod_from_api_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PodLookup, Report<KubernetesError>> {
        if self.api_down.load(Ordering::SeqCst) {
            return Err(Report::new(KubernetesError::RequestFailed {
                message: "API server unavailable".to_string(),
            }));
        }
        let key = (namespace.to_string(), name.to_string());
        if let Some(pod) = lock(&self.remote).get(&key) {
            return Ok(PodLookup::Found(Box::new(pod.clone())));
        }
        Ok(match lock(&self.cached).get(&key) {
            Some(pod) => PodLookup::Found(Box::new(Pod::clone(pod))),
            None => PodLookup::NotFound,
        })
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Plugin that records every create and delete, with injectable failures.
pub struct RecordingPlugin {
    resource_name: String,
    created: Mutex<Vec<(u32, String)>>,
    deleted: Mutex<Vec<(u32, String)>>,
    creates: Mutex<usize>,
    fail_create_at: Mutex<Option<usize>>,
    fail_delete: Mutex<HashSet<String>>,
}

impl RecordingPlugin {
    pub fn new(resource_name: &str) -> Self {
        Self {
            resource_name: resource_name.to_string(),
            created: Mutex::default(),
            deleted: Mutex::default(),
            creates: Mutex::new(0),
            fail_create_at: Mutex::new(None),
            fail_delete: Mutex::default(),
        }
    }

    /// Fails the `n`-th create call (1-based) from now on.
    pub fn fail_create_at(&self, n: usize) {
        *lock(&self.fail_create_at) = Some(n);
    }

    pub fn fail_delete_of(&self, id: &str) {
        lock(&self.fail_delete).insert(id.to_string());
    }

    pub fn heal(&self) {
        *lock(&self.fail_create_at) = None;
        lock(&self.fail_delete).clear();
    }

    /// Devices created and not yet deleted, in creation order.
    pub fn created(&self) -> Vec<(u32, String)> {
        lock(&self.created).clone()
    }

    pub fn deleted(&self) -> Vec<(u32, String)> {
        lock(&self.deleted).clone()
    }
}

impl ResourcePlugin for RecordingPlugin {
    fn name(&self) -> &str {
        "recording"
    }

    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn pre_start_required(&self) -> bool {
        true
    }

    fn list(&self) -> Vec<Device> {
        Vec::new()
    }

    fn allocate(&self, _device_ids: &[String]) -> ContainerAllocateResponse {
        ContainerAllocateResponse::default()
    }

    fn create_binding(&self, index: u32, id: &str) -> Result<(), OperatorError> {
        let call = {
            let mut creates = lock(&self.creates);
            *creates += 1;
            *creates
        };
        if *lock(&self.fail_create_at) == Some(call) {
            return Err(OperatorError::UnknownIndex(index));
        }
        let mut created = lock(&self.created);
        if !created.iter().any(|(i, existing)| *i == index && existing == id) {
            created.push((index, id.to_string()));
        }
        Ok(())
    }

    fn delete_binding(&self, index: u32, id: &str) -> Result<(), OperatorError> {
        if lock(&self.fail_delete).contains(id) {
            return Err(OperatorError::Io {
                op: "remove",
                path: id.into(),
                source: std::io::Error::other("device busy"),
            });
        }
        lock(&self.created).retain(|(i, existing)| !(*i == index && existing == id));
        lock(&self.deleted).push((index, id.to_string()));
        Ok(())
    }

    fn check_binding(&self, index: u32, id: &str) -> bool {
        lock(&self.created)
            .iter()
            .any(|(i, existing)| *i == index && existing == id)
    }
}

/// Wraps a store and fails `save` while `fail_saves` is set.
pub struct FlakyStore<S> {
    inner: S,
    fail_saves: AtomicBool,
}

impl<S: BindingStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl<S: BindingStore> BindingStore for FlakyStore<S> {
    fn save(&self, record: &PodRecord) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(record)
    }

    fn load(&self, namespace: &str, name: &str) -> Result<PodRecord, StoreError> {
        self.inner.load(namespace, name)
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.inner.delete(namespace, name)
    }

    fn delete_if_unchanged(&self, expected: &PodRecord) -> Result<bool, StoreError> {
        self.inner.delete_if_unchanged(expected)
    }

    fn for_each(
        &self,
        visit: &mut dyn FnMut(Result<PodRecord, StoreError>),
    ) -> Result<(), StoreError> {
        self.inner.for_each(visit)
    }
}
