//! Owner lookup against a kubelet pod-resources endpoint on a unix socket.

use std::path::Path;
use std::sync::Arc;

use device_plugin_pb::pod_resources::pod_resources_lister_server::PodResourcesLister;
use device_plugin_pb::pod_resources::pod_resources_lister_server::PodResourcesListerServer;
use device_plugin_pb::pod_resources::AllocatableResourcesRequest;
use device_plugin_pb::pod_resources::AllocatableResourcesResponse;
use device_plugin_pb::pod_resources::ContainerDevices;
use device_plugin_pb::pod_resources::ContainerResources;
use device_plugin_pb::pod_resources::ListPodResourcesRequest;
use device_plugin_pb::pod_resources::ListPodResourcesResponse;
use device_plugin_pb::pod_resources::PodResources;
use similar_asserts::assert_eq;
use test_log::test;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use vgpu_agent::fingerprint::DeviceFingerprint;
use vgpu_agent::locator::DeviceLocator;
use vgpu_agent::locator::KubeletDeviceLocator;
use vgpu_agent::locator::LocatorError;
use vgpu_agent::types::OwnerRef;

const RESOURCE: &str = "elastic-gpu/gpu-percent";

#[derive(Clone)]
struct FakePodResources {
    pods: Arc<Vec<PodResources>>,
}

#[tonic::async_trait]
impl PodResourcesLister for FakePodResources {
    async fn list(
        &self,
        _request: Request<ListPodResourcesRequest>,
    ) -> Result<Response<ListPodResourcesResponse>, Status> {
        Ok(Response::new(ListPodResourcesResponse {
            pod_resources: self.pods.as_ref().clone(),
        }))
    }

    async fn get_allocatable_resources(
        &self,
        _request: Request<AllocatableResourcesRequest>,
    ) -> Result<Response<AllocatableResourcesResponse>, Status> {
        Ok(Response::new(AllocatableResourcesResponse::default()))
    }
}

fn pod(namespace: &str, name: &str, containers: &[(&str, &[&str])]) -> PodResources {
    PodResources {
        namespace: namespace.to_string(),
        name: name.to_string(),
        containers: containers
            .iter()
            .map(|(container, ids)| ContainerResources {
                name: container.to_string(),
                devices: vec![ContainerDevices {
                    resource_name: RESOURCE.to_string(),
                    device_ids: ids.iter().map(|id| id.to_string()).collect(),
                    topology: None,
                }],
                ..Default::default()
            })
            .collect(),
    }
}

fn serve(socket: &Path, pods: Vec<PodResources>, token: CancellationToken) {
    let _ = std::fs::remove_file(socket);
    let listener = UnixListener::bind(socket).expect("should bind socket");
    let service = FakePodResources {
        pods: Arc::new(pods),
    };
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(PodResourcesListerServer::new(service))
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::UnixListenerStream::new(listener),
                token.cancelled_owned(),
            )
            .await
    });
}

#[test(tokio::test)]
async fn locates_the_container_holding_a_device_set() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("kubelet.sock");
    serve(
        &socket,
        vec![
            pod("ns", "p0", &[("c0", &["0-00"])]),
            pod("ns", "p1", &[("c0", &["0-01"]), ("c1", &["d-02", "d-00", "d-01"])]),
        ],
        CancellationToken::new(),
    );
    let locator = KubeletDeviceLocator::new(&socket, RESOURCE);

    let owner = locator
        .locate(&DeviceFingerprint::new(["d-00", "d-01", "d-02"]))
        .await
        .expect("owner should be found");

    assert_eq!(owner, OwnerRef::new("ns", "p1", "c1"));

    let err = locator
        .locate(&DeviceFingerprint::new(["d-00"]))
        .await
        .unwrap_err();
    assert!(matches!(err, LocatorError::OwnerNotFound { .. }));

    let records = locator.list().await.expect("list should succeed");
    let pods: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
    assert_eq!(pods, vec!["p0".to_string(), "p1".to_string()]);
    assert_eq!(records[1].containers.len(), 2);
}

#[test(tokio::test)]
async fn reconnects_after_kubelet_restart() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("kubelet.sock");
    let first = CancellationToken::new();
    serve(&socket, vec![pod("ns", "old", &[("c", &["0-00"])])], first.clone());
    let locator = KubeletDeviceLocator::new(&socket, RESOURCE);
    let fingerprint = DeviceFingerprint::new(["0-00"]);

    assert_eq!(
        locator.locate(&fingerprint).await.unwrap(),
        OwnerRef::new("ns", "old", "c")
    );

    first.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    serve(
        &socket,
        vec![pod("ns", "new", &[("c", &["0-00"])])],
        CancellationToken::new(),
    );

    assert_eq!(
        locator.locate(&fingerprint).await.unwrap(),
        OwnerRef::new("ns", "new", "c")
    );
}

#[test(tokio::test)]
async fn missing_socket_is_a_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    let locator = KubeletDeviceLocator::new(dir.path().join("absent.sock"), RESOURCE);

    let err = locator
        .locate(&DeviceFingerprint::new(["0-00"]))
        .await
        .unwrap_err();

    assert!(matches!(err, LocatorError::Connect { .. }));
}
