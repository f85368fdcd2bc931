//! Resolves a device-ID set to the container the kubelet assigned it to.
//!
//! The kubelet pod-resources API is the only place that knows which container
//! received which device IDs. Depending on the kubelet version a container's
//! assignment is reported either as one `ContainerDevices` entry holding the
//! whole list or as one entry per device ID, so both shapes are compared as
//! fingerprints.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use device_plugin_pb::pod_resources::pod_resources_lister_client::PodResourcesListerClient;
use device_plugin_pb::pod_resources::ListPodResourcesRequest;
use device_plugin_pb::pod_resources::PodResources;
use thiserror::Error;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::debug;
use tracing::warn;

use crate::fingerprint::DeviceFingerprint;
use crate::types::Binding;
use crate::types::OwnerRef;
use crate::types::PodRecord;
use crate::uds;

pub const DEFAULT_POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("failed to connect to pod resources socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pod resources query failed: {0}")]
    Query(#[from] tonic::Status),
    #[error("no container holds device set {hash}")]
    OwnerNotFound { hash: String },
}

#[async_trait]
pub trait DeviceLocator: Send + Sync {
    /// The container currently holding exactly `fingerprint`'s devices.
    async fn locate(&self, fingerprint: &DeviceFingerprint) -> Result<OwnerRef, LocatorError>;

    /// Every container holding devices of the watched resource, grouped by pod.
    /// Bindings carry no physical indices.
    async fn list(&self) -> Result<Vec<PodRecord>, LocatorError>;
}

/// Finds the first container whose devices of `resource_name` match
/// `fingerprint`, accepting both the aggregated and the one-per-entry shape.
pub fn resolve_owner(
    pods: &[PodResources],
    resource_name: &str,
    fingerprint: &DeviceFingerprint,
) -> Option<OwnerRef> {
    for pod in pods {
        for container in &pod.containers {
            let mut accumulated = Vec::new();
            for entry in container
                .devices
                .iter()
                .filter(|entry| entry.resource_name == resource_name)
            {
                if DeviceFingerprint::new(entry.device_ids.iter().cloned()) == *fingerprint {
                    return Some(OwnerRef::new(&pod.namespace, &pod.name, &container.name));
                }
                accumulated.extend(entry.device_ids.iter().cloned());
            }
            if !accumulated.is_empty() && DeviceFingerprint::new(accumulated) == *fingerprint {
                return Some(OwnerRef::new(&pod.namespace, &pod.name, &container.name));
            }
        }
    }
    None
}

/// Groups the per-container assignments of `resource_name` into pod records.
pub fn collect_records(pods: &[PodResources], resource_name: &str) -> Vec<PodRecord> {
    let mut records = Vec::new();
    for pod in pods {
        let mut record = PodRecord::new(&pod.namespace, &pod.name);
        for container in &pod.containers {
            let ids: Vec<String> = container
                .devices
                .iter()
                .filter(|entry| entry.resource_name == resource_name)
                .flat_map(|entry| entry.device_ids.iter().cloned())
                .collect();
            if ids.is_empty() {
                continue;
            }
            let binding = Binding {
                indices: Vec::new(),
                resources: BTreeMap::from([(resource_name.to_string(), ids.len().to_string())]),
                fingerprint: DeviceFingerprint::new(ids),
            };
            record.containers.insert(container.name.clone(), binding);
        }
        if !record.containers.is_empty() {
            records.push(record);
        }
    }
    records
}

/// [`DeviceLocator`] backed by the kubelet pod-resources socket.
pub struct KubeletDeviceLocator {
    socket_path: PathBuf,
    resource_name: String,
    client: Mutex<Option<PodResourcesListerClient<Channel>>>,
}

impl KubeletDeviceLocator {
    pub fn new(socket_path: impl Into<PathBuf>, resource_name: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            resource_name: resource_name.into(),
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<PodResourcesListerClient<Channel>, LocatorError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let channel = uds::connect(&self.socket_path, CONNECT_TIMEOUT)
            .await
            .map_err(|source| LocatorError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        debug!(path = %self.socket_path.display(), "connected to pod resources API");
        let client = PodResourcesListerClient::new(channel);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn invalidate(&self) {
        self.client.lock().await.take();
    }

    async fn try_list(&self) -> Result<Vec<PodResources>, LocatorError> {
        let mut client = self.client().await?;
        let response = client.list(ListPodResourcesRequest {}).await?;
        Ok(response.into_inner().pod_resources)
    }

    /// One query, retried once on a fresh connection.
    async fn pod_resources(&self) -> Result<Vec<PodResources>, LocatorError> {
        match self.try_list().await {
            Ok(pods) => Ok(pods),
            Err(e) => {
                warn!(resource = %self.resource_name, "pod resources query failed, reconnecting: {e}");
                self.invalidate().await;
                let result = self.try_list().await;
                if result.is_err() {
                    self.invalidate().await;
                }
                result
            }
        }
    }
}

#[async_trait]
impl DeviceLocator for KubeletDeviceLocator {
    async fn locate(&self, fingerprint: &DeviceFingerprint) -> Result<OwnerRef, LocatorError> {
        let pods = self.pod_resources().await?;
        resolve_owner(&pods, &self.resource_name, fingerprint).ok_or_else(|| {
            LocatorError::OwnerNotFound {
                hash: fingerprint.hash.clone(),
            }
        })
    }

    async fn list(&self) -> Result<Vec<PodRecord>, LocatorError> {
        let pods = self.pod_resources().await?;
        Ok(collect_records(&pods, &self.resource_name))
    }
}

#[cfg(test)]
mod tests {
    use device_plugin_pb::pod_resources::ContainerDevices;
    use device_plugin_pb::pod_resources::ContainerResources;
    use similar_asserts::assert_eq;

    use super::*;

    const RESOURCE: &str = "elastic-gpu/gpu-percent";

    fn entry(resource: &str, ids: &[&str]) -> ContainerDevices {
        ContainerDevices {
            resource_name: resource.to_string(),
            device_ids: ids.iter().map(|id| id.to_string()).collect(),
            topology: None,
        }
    }

    fn pod(name: &str, containers: Vec<(&str, Vec<ContainerDevices>)>) -> PodResources {
        PodResources {
            name: name.to_string(),
            namespace: "ns".to_string(),
            containers: containers
                .into_iter()
                .map(|(name, devices)| ContainerResources {
                    name: name.to_string(),
                    devices,
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn aggregated_entry_matches_regardless_of_order() {
        let pods = vec![pod(
            "p1",
            vec![("c1", vec![entry(RESOURCE, &["d-02", "d-00", "d-01"])])],
        )];
        let fingerprint = DeviceFingerprint::new(["d-00", "d-01", "d-02"]);

        assert_eq!(
            resolve_owner(&pods, RESOURCE, &fingerprint),
            Some(OwnerRef::new("ns", "p1", "c1"))
        );
    }

    #[test]
    fn one_id_per_entry_matches_accumulated() {
        let pods = vec![pod(
            "p1",
            vec![(
                "c1",
                vec![
                    entry(RESOURCE, &["d-01"]),
                    entry("nvidia.com/gpu", &["GPU-abc"]),
                    entry(RESOURCE, &["d-00"]),
                ],
            )],
        )];
        let fingerprint = DeviceFingerprint::new(["d-00", "d-01"]);

        assert_eq!(
            resolve_owner(&pods, RESOURCE, &fingerprint),
            Some(OwnerRef::new("ns", "p1", "c1"))
        );
    }

    #[test]
    fn other_resources_and_subsets_do_not_match() {
        let pods = vec![
            pod("p1", vec![("c1", vec![entry("other/res", &["d-00", "d-01"])])]),
            pod("p2", vec![("c1", vec![entry(RESOURCE, &["d-00", "d-01", "d-02"])])]),
        ];

        let fingerprint = DeviceFingerprint::new(["d-00", "d-01"]);
        assert_eq!(resolve_owner(&pods, RESOURCE, &fingerprint), None);
    }

    #[test]
    fn picks_the_right_container() {
        let pods = vec![
            pod("p1", vec![("c1", vec![entry(RESOURCE, &["0-00"])])]),
            pod(
                "p2",
                vec![
                    ("a", vec![entry(RESOURCE, &["0-01"])]),
                    ("b", vec![entry(RESOURCE, &["0-02", "0-03"])]),
                ],
            ),
        ];

        let fingerprint = DeviceFingerprint::new(["0-03", "0-02"]);
        assert_eq!(
            resolve_owner(&pods, RESOURCE, &fingerprint),
            Some(OwnerRef::new("ns", "p2", "b"))
        );
    }

    #[test]
    fn collect_records_groups_by_pod() {
        let pods = vec![
            pod(
                "p1",
                vec![
                    ("a", vec![entry(RESOURCE, &["0-00"]), entry(RESOURCE, &["0-01"])]),
                    ("sidecar", vec![]),
                ],
            ),
            pod("p2", vec![("c", vec![entry("other/res", &["x"])])]),
        ];

        let records = collect_records(&pods, RESOURCE);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "p1");
        let binding = &records[0].containers["a"];
        assert_eq!(binding.fingerprint, DeviceFingerprint::new(["0-01", "0-00"]));
        assert_eq!(binding.resources[RESOURCE], "2");
    }

    #[tokio::test]
    async fn missing_socket_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let locator = KubeletDeviceLocator::new(dir.path().join("kubelet.sock"), RESOURCE);

        let err = locator
            .locate(&DeviceFingerprint::new(["0-00"]))
            .await
            .unwrap_err();

        assert!(matches!(err, LocatorError::Connect { .. }), "unexpected error: {err}");
    }
}
