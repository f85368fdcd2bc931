//! PreStart binding: device set → container → physical GPUs → virtual devices.

use core::error::Error;
use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::Mutex;
use tonic::Code;
use tonic::Status;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::fingerprint::DeviceFingerprint;
use crate::k8s::annotations::parse_indices;
use crate::k8s::AssumedAnnotations;
use crate::k8s::PodLookup;
use crate::k8s::PodSitter;
use crate::locator::DeviceLocator;
use crate::plugin::ResourcePlugin;
use crate::store::BindingStore;
use crate::types::Binding;
use crate::types::OwnerRef;

#[derive(Debug, derive_more::Display)]
pub enum BindError {
    #[display("device list is empty")]
    EmptyRequest,
    #[display("no container holds device set {hash}")]
    OwnerNotFound { hash: String },
    #[display("pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },
    #[display("pod {namespace}/{name} lacks annotation {annotation}")]
    NotAssumed {
        namespace: String,
        name: String,
        annotation: String,
    },
    #[display("container {owner} isn't assumed, annotation {annotation} missing")]
    ContainerNotAssumed { owner: OwnerRef, annotation: String },
    #[display("assumed value {value:?} of container {owner} is not a GPU index list")]
    InvalidAssumedIndex { owner: OwnerRef, value: String },
    #[display("failed to create virtual device {id} on GPU {index}")]
    DeviceCreate { index: u32, id: String },
    #[display("failed to persist binding of {owner}")]
    Persist { owner: OwnerRef },
}

impl Error for BindError {}

impl BindError {
    pub fn code(&self) -> Code {
        match self {
            BindError::EmptyRequest | BindError::InvalidAssumedIndex { .. } => {
                Code::InvalidArgument
            }
            BindError::OwnerNotFound { .. } | BindError::PodNotFound { .. } => Code::NotFound,
            BindError::NotAssumed { .. } | BindError::ContainerNotAssumed { .. } => {
                Code::FailedPrecondition
            }
            BindError::DeviceCreate { .. } | BindError::Persist { .. } => Code::Internal,
        }
    }
}

/// gRPC status carrying the whole report chain as its message.
pub fn into_status(report: Report<BindError>) -> Status {
    Status::new(report.current_context().code(), format!("{report:#}"))
}

/// Serialized PreStart handling for one resource plugin.
pub struct Binder {
    plugin: Arc<dyn ResourcePlugin>,
    locator: Arc<dyn DeviceLocator>,
    sitter: Arc<dyn PodSitter>,
    store: Arc<dyn BindingStore>,
    annotations: AssumedAnnotations,
    lock: Mutex<()>,
}

impl Binder {
    pub fn new(
        plugin: Arc<dyn ResourcePlugin>,
        locator: Arc<dyn DeviceLocator>,
        sitter: Arc<dyn PodSitter>,
        store: Arc<dyn BindingStore>,
        annotations: AssumedAnnotations,
    ) -> Self {
        Self {
            plugin,
            locator,
            sitter,
            store,
            annotations,
            lock: Mutex::new(()),
        }
    }

    /// Binds `device_ids` to the container holding them. Nothing is persisted
    /// unless every device was created, and nothing created survives a failure.
    pub async fn pre_start(&self, device_ids: Vec<String>) -> Result<OwnerRef, Report<BindError>> {
        // one bind at a time: load, mutate and save of a pod record must not interleave
        let _guard = self.lock.lock().await;

        if device_ids.is_empty() {
            return Err(Report::new(BindError::EmptyRequest));
        }
        let fingerprint = DeviceFingerprint::new(device_ids);

        let owner = self.locator.locate(&fingerprint).await.map_err(|e| {
            error!(hash = %fingerprint, devices = %fingerprint.list.join(":"), "no pod with such device list: {e}");
            Report::new(BindError::OwnerNotFound {
                hash: fingerprint.hash.clone(),
            })
            .attach_printable(e.to_string())
        })?;

        let pod = self.fetch_pod(&owner).await?;
        let indices = self.assumed_indices(&owner, &pod)?;
        info!(
            namespace = %owner.namespace,
            pod = %owner.name,
            container = %owner.container,
            hash = %fingerprint,
            ?indices,
            "binding assumed GPUs"
        );

        let created = self.create_devices(&owner, &fingerprint, &indices)?;

        let mut record = self.store.load_or_create(&owner.namespace, &owner.name);
        let replaced = record.containers.insert(
            owner.container.clone(),
            Binding {
                indices,
                resources: self.requested_resources(&owner, &pod, fingerprint.len()),
                fingerprint: fingerprint.clone(),
            },
        );
        if let Err(e) = self.store.save(&record) {
            error!(
                namespace = %owner.namespace,
                pod = %owner.name,
                container = %owner.container,
                hash = %fingerprint,
                "failed to persist binding, rolling back: {e}"
            );
            self.rollback(&owner, &created);
            return Err(Report::new(e).change_context(BindError::Persist {
                owner: owner.clone(),
            }));
        }

        if let Some(replaced) = replaced {
            self.release_replaced(&owner, &replaced, &record.containers[&owner.container]);
        }
        Ok(owner)
    }

    /// Deletes the devices of a binding that was overwritten by a new one and
    /// are not part of the new binding. Nothing else points at them anymore.
    fn release_replaced(&self, owner: &OwnerRef, replaced: &Binding, current: &Binding) {
        let kept: Vec<(u32, String)> = current.devices().collect();
        for (index, id) in replaced.devices() {
            if kept.contains(&(index, id.clone())) {
                continue;
            }
            match self.plugin.delete_binding(index, &id) {
                Ok(()) => {
                    info!(container = %owner, hash = %replaced.fingerprint, index, %id, "deleted virtual device of replaced binding");
                }
                Err(e) => {
                    error!(
                        namespace = %owner.namespace,
                        pod = %owner.name,
                        container = %owner.container,
                        hash = %replaced.fingerprint,
                        index,
                        %id,
                        "failed to delete virtual device of replaced binding, it is leaked: {e}"
                    );
                }
            }
        }
    }

    async fn fetch_pod(&self, owner: &OwnerRef) -> Result<Arc<Pod>, Report<BindError>> {
        if let Some(pod) = self.sitter.get_pod(&owner.namespace, &owner.name) {
            return Ok(pod);
        }

        let not_found = || BindError::PodNotFound {
            namespace: owner.namespace.clone(),
            name: owner.name.clone(),
        };
        match self
            .sitter
            .get_pod_from_api_server(&owner.namespace, &owner.name)
            .await
        {
            Ok(PodLookup::Found(pod)) => Ok(Arc::new(*pod)),
            Ok(PodLookup::NotFound) => {
                error!(namespace = %owner.namespace, pod = %owner.name, "pod of located container not found");
                Err(Report::new(not_found()))
            }
            Err(e) => {
                error!(namespace = %owner.namespace, pod = %owner.name, "failed to get pod: {e:?}");
                Err(e.change_context(not_found()))
            }
        }
    }

    fn assumed_indices(&self, owner: &OwnerRef, pod: &Pod) -> Result<Vec<u32>, Report<BindError>> {
        if !self.annotations.is_assumed(pod) {
            error!(namespace = %owner.namespace, pod = %owner.name, "pod is not assumed by the GPU scheduler");
            return Err(Report::new(BindError::NotAssumed {
                namespace: owner.namespace.clone(),
                name: owner.name.clone(),
                annotation: self.annotations.pod_marker.clone(),
            }));
        }

        let Some(value) = self.annotations.container_value(pod, &owner.container) else {
            error!(container = %owner, "container is not assumed by the GPU scheduler");
            return Err(Report::new(BindError::ContainerNotAssumed {
                owner: owner.clone(),
                annotation: self.annotations.container_key(&owner.container),
            }));
        };

        parse_indices(value)
            .inspect_err(|e| error!(container = %owner, value, "malformed assumed index: {e}"))
            .change_context(BindError::InvalidAssumedIndex {
                owner: owner.clone(),
                value: value.to_string(),
            })
    }

    /// Creates one virtual device per index and returns those that did not
    /// exist before. On failure every device created by this call is deleted
    /// again; devices that were already present are left alone.
    fn create_devices(
        &self,
        owner: &OwnerRef,
        fingerprint: &DeviceFingerprint,
        indices: &[u32],
    ) -> Result<Vec<(u32, String)>, Report<BindError>> {
        let mut created = Vec::with_capacity(indices.len());
        for (ordinal, &index) in indices.iter().enumerate() {
            let id = fingerprint.binding_id(ordinal);
            let existed = self.plugin.check_binding(index, &id);
            if let Err(e) = self.plugin.create_binding(index, &id) {
                error!(container = %owner, hash = %fingerprint, index, "failed to create virtual device: {e}");
                self.rollback(owner, &created);
                return Err(Report::new(e).change_context(BindError::DeviceCreate { index, id }));
            }
            if !existed {
                created.push((index, id));
            }
        }
        Ok(created)
    }

    fn rollback(&self, owner: &OwnerRef, created: &[(u32, String)]) {
        for (index, id) in created {
            if let Err(e) = self.plugin.delete_binding(*index, id) {
                warn!(container = %owner, index, id, "rollback failed to delete virtual device: {e}");
            }
        }
    }

    /// The container's request for this plugin's resource, or the number of
    /// devices when the pod does not say.
    fn requested_resources(
        &self,
        owner: &OwnerRef,
        pod: &Pod,
        device_count: usize,
    ) -> BTreeMap<String, String> {
        let resource = self.plugin.resource_name();
        let quantity = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.iter().find(|c| c.name == owner.container))
            .and_then(|container| container.resources.as_ref())
            .and_then(|resources| {
                resources
                    .limits
                    .as_ref()
                    .and_then(|limits| limits.get(resource))
                    .or_else(|| resources.requests.as_ref()?.get(resource))
            })
            .map(|quantity| quantity.0.clone())
            .unwrap_or_else(|| device_count.to_string());
        BTreeMap::from([(resource.to_string(), quantity)])
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::store::LmdbBindingStore;
    use crate::testing::assumed_pod;
    use crate::testing::FakeLocator;
    use crate::testing::FakeSitter;
    use crate::testing::FlakyStore;
    use crate::testing::RecordingPlugin;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<LmdbBindingStore>,
        plugin: Arc<RecordingPlugin>,
        locator: Arc<FakeLocator>,
        sitter: Arc<FakeSitter>,
        binder: Binder,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LmdbBindingStore::open(dir.path().join("meta.db")).unwrap());
        let plugin = Arc::new(RecordingPlugin::new("elastic-gpu/gpu-percent"));
        let locator = Arc::new(FakeLocator::default());
        let sitter = Arc::new(FakeSitter::default());
        let binder = Binder::new(
            plugin.clone(),
            locator.clone(),
            sitter.clone(),
            store.clone(),
            AssumedAnnotations::default(),
        );
        Fixture {
            _dir: dir,
            store,
            plugin,
            locator,
            sitter,
            binder,
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_request_is_invalid_argument() {
        let f = fixture();

        let err = f.binder.pre_start(Vec::new()).await.unwrap_err();

        assert!(matches!(err.current_context(), BindError::EmptyRequest));
        assert_eq!(into_status(err).code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unknown_devices_are_not_found() {
        let f = fixture();

        let err = f.binder.pre_start(ids(&["0-00"])).await.unwrap_err();

        assert!(matches!(err.current_context(), BindError::OwnerNotFound { .. }));
        assert_eq!(err.current_context().code(), Code::NotFound);
    }

    #[tokio::test]
    async fn falls_back_to_api_server_on_cache_miss() {
        let f = fixture();
        f.locator.assign(&["0-00"], OwnerRef::new("ns", "p1", "c1"));
        f.sitter.insert_remote(assumed_pod("ns", "p1", &[("c1", "0")]));

        f.binder.pre_start(ids(&["0-00"])).await.unwrap();

        assert_eq!(f.store.load("ns", "p1").unwrap().containers["c1"].indices, vec![0]);
    }

    #[tokio::test]
    async fn pod_gone_everywhere_is_not_found() {
        let f = fixture();
        f.locator.assign(&["0-00"], OwnerRef::new("ns", "p1", "c1"));

        let err = f.binder.pre_start(ids(&["0-00"])).await.unwrap_err();

        assert!(matches!(err.current_context(), BindError::PodNotFound { .. }));
    }

    #[tokio::test]
    async fn unassumed_pod_is_rejected() {
        let f = fixture();
        f.locator.assign(&["0-00"], OwnerRef::new("ns", "p1", "c1"));
        let mut pod = assumed_pod("ns", "p1", &[("c1", "0")]);
        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .remove("elastic-gpu/assume");
        f.sitter.insert(pod);

        let err = f.binder.pre_start(ids(&["0-00"])).await.unwrap_err();

        assert!(matches!(err.current_context(), BindError::NotAssumed { .. }));
        assert_eq!(into_status(err).code(), Code::FailedPrecondition);
        assert!(f.plugin.created().is_empty());
    }

    #[tokio::test]
    async fn container_without_annotation_is_rejected() {
        let f = fixture();
        f.locator.assign(&["0-00"], OwnerRef::new("ns", "p1", "c2"));
        f.sitter.insert(assumed_pod("ns", "p1", &[("c1", "0")]));

        let err = f.binder.pre_start(ids(&["0-00"])).await.unwrap_err();

        assert!(matches!(err.current_context(), BindError::ContainerNotAssumed { .. }));
    }

    #[tokio::test]
    async fn binds_every_assumed_index_in_order() {
        let f = fixture();
        f.locator.assign(&["0-00", "1-00"], OwnerRef::new("ns", "p1", "c1"));
        f.sitter.insert(assumed_pod("ns", "p1", &[("c1", "1,0")]));

        f.binder.pre_start(ids(&["1-00", "0-00"])).await.unwrap();

        let hash = DeviceFingerprint::new(["0-00", "1-00"]).hash;
        assert_eq!(
            f.plugin.created(),
            vec![(1, format!("{hash}-0")), (0, format!("{hash}-1"))]
        );
        let binding = &f.store.load("ns", "p1").unwrap().containers["c1"];
        assert_eq!(binding.indices, vec![1, 0]);
        assert_eq!(binding.resources["elastic-gpu/gpu-percent"], "2");
    }

    #[tokio::test]
    async fn rebinding_a_container_replaces_its_binding() {
        let f = fixture();
        f.locator.assign(&["0-00"], OwnerRef::new("ns", "p1", "c1"));
        f.locator.assign(&["0-01"], OwnerRef::new("ns", "p1", "c1"));
        f.sitter.insert(assumed_pod("ns", "p1", &[("c1", "0")]));

        f.binder.pre_start(ids(&["0-00"])).await.unwrap();
        f.binder.pre_start(ids(&["0-01"])).await.unwrap();

        let record = f.store.load("ns", "p1").unwrap();
        assert_eq!(record.containers.len(), 1);
        assert_eq!(
            record.containers["c1"].fingerprint,
            DeviceFingerprint::new(["0-01"])
        );
        let old = DeviceFingerprint::new(["0-00"]).hash;
        let new = DeviceFingerprint::new(["0-01"]).hash;
        assert_eq!(f.plugin.deleted(), vec![(0, format!("{old}-0"))]);
        assert_eq!(f.plugin.created(), vec![(0, format!("{new}-0"))]);
    }

    #[tokio::test]
    async fn restarted_container_keeps_devices_on_persist_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(
            LmdbBindingStore::open(dir.path().join("meta.db")).unwrap(),
        ));
        let plugin = Arc::new(RecordingPlugin::new("elastic-gpu/gpu-percent"));
        let locator = Arc::new(FakeLocator::default());
        let sitter = Arc::new(FakeSitter::default());
        let binder = Binder::new(
            plugin.clone(),
            locator.clone(),
            sitter.clone(),
            store.clone(),
            AssumedAnnotations::default(),
        );
        locator.assign(&["0-00", "1-00"], OwnerRef::new("ns", "p1", "c1"));
        sitter.insert(assumed_pod("ns", "p1", &[("c1", "0,1")]));
        binder.pre_start(ids(&["0-00", "1-00"])).await.unwrap();

        // same devices again, but the store is failing this time
        store.set_fail_saves(true);
        let err = binder.pre_start(ids(&["0-00", "1-00"])).await.unwrap_err();

        assert!(matches!(err.current_context(), BindError::Persist { .. }));
        assert!(plugin.deleted().is_empty());
        assert_eq!(plugin.created().len(), 2);
        assert_eq!(store.load("ns", "p1").unwrap().containers["c1"].indices, vec![0, 1]);
    }
}
