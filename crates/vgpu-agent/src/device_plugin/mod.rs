//! Kubelet device plugin for one resource plugin.
//!
//! [`DevicePluginService`] answers the kubelet's RPCs; [`registration`] keeps a
//! server incarnation bound to the plugin socket and registered with the
//! current kubelet.

use std::pin::Pin;
use std::sync::Arc;

use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::Device;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use futures::Stream;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::plugin::ResourcePlugin;
use crate::syncer::CatalogSync;

pub mod binder;
pub mod registration;

pub use binder::BindError;
pub use binder::Binder;
pub use registration::PluginServer;
pub use registration::PluginState;

/// RPC handlers for one resource. Cheap to clone; every server incarnation
/// gets its own copy bound to its own stop token.
#[derive(Clone)]
pub struct DevicePluginService {
    plugin: Arc<dyn ResourcePlugin>,
    binder: Option<Arc<Binder>>,
    syncer: Arc<dyn CatalogSync>,
    /// inventory snapshot taken at construction
    devices: Arc<Vec<Device>>,
    stop: CancellationToken,
}

impl DevicePluginService {
    /// `binder` is required when the plugin asks for PreStart calls.
    pub fn new(
        plugin: Arc<dyn ResourcePlugin>,
        binder: Option<Arc<Binder>>,
        syncer: Arc<dyn CatalogSync>,
    ) -> Self {
        let devices = Arc::new(plugin.list());
        Self {
            plugin,
            binder,
            syncer,
            devices,
            stop: CancellationToken::new(),
        }
    }

    pub fn with_stop_token(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn resource_name(&self) -> &str {
        self.plugin.resource_name()
    }

    pub fn options(&self) -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: self.plugin.pre_start_required(),
            get_preferred_allocation_available: false,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(self.options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Sends the inventory once, then holds the stream open until the kubelet
    /// goes away or this incarnation stops.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let resource = self.resource_name().to_string();
        info!(resource, devices = self.devices.len(), "kubelet started ListAndWatch");

        let (tx, rx) = mpsc::unbounded_channel();
        let devices = self.devices.as_ref().clone();
        let syncer = self.syncer.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            if let Err(e) = tx.send(Ok(ListAndWatchResponse { devices })) {
                error!(resource, "failed to send initial device list: {e}");
                return;
            }
            if let Err(e) = syncer.sync().await {
                error!(resource, "GPU catalog sync failed: {e:?}");
            }

            select! {
                _ = tx.closed() => info!(resource, "ListAndWatch closed by kubelet"),
                _ = stop.cancelled() => info!(resource, "ListAndWatch stopped"),
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        if req
            .container_requests
            .iter()
            .all(|container| container.devices_ids.is_empty())
        {
            return Err(Status::invalid_argument(BindError::EmptyRequest.to_string()));
        }

        let container_responses = req
            .container_requests
            .iter()
            .map(|container| {
                debug!(
                    resource = self.resource_name(),
                    devices = ?container.devices_ids,
                    "allocating devices to container"
                );
                self.plugin.allocate(&container.devices_ids)
            })
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        let device_ids = request.into_inner().devices_ids;
        let Some(binder) = &self.binder else {
            return Ok(Response::new(PreStartContainerResponse {}));
        };

        match binder.pre_start(device_ids).await {
            Ok(owner) => {
                info!(container = %owner, resource = self.resource_name(), "container bound");
                Ok(Response::new(PreStartContainerResponse {}))
            }
            Err(report) => {
                error!(resource = self.resource_name(), "PreStartContainer failed: {report:?}");
                Err(binder::into_status(report))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use device_plugin_pb::api::ContainerAllocateRequest;
    use futures::StreamExt;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::plugin::GpuCorePlugin;
    use crate::operator::PassthroughOperator;
    use crate::operator::PhysicalDevice;
    use crate::syncer::NoopSync;

    fn service() -> DevicePluginService {
        let gpu = PhysicalDevice {
            uuid: "gpu-0".to_string(),
            index: 0,
            minor: 0,
            memory_bytes: 16 << 30,
            model: "T4".to_string(),
        };
        let plugin = Arc::new(GpuCorePlugin::new(Arc::new(PassthroughOperator::new(vec![gpu]))));
        DevicePluginService::new(plugin, None, Arc::new(NoopSync))
    }

    #[tokio::test]
    async fn options_follow_plugin() {
        let options = service()
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();

        assert!(options.pre_start_required);
        assert!(!options.get_preferred_allocation_available);
    }

    #[tokio::test]
    async fn allocate_rejects_empty_request() {
        let request = AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec![],
            }],
        };

        let status = service().allocate(Request::new(request)).await.unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn allocate_answers_each_container() {
        let request = AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["0-00".to_string()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["0-01".to_string(), "0-02".to_string()],
                },
            ],
        };

        let response = service()
            .allocate(Request::new(request))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.container_responses.len(), 2);
        assert_ne!(
            response.container_responses[0].envs["GPU"],
            response.container_responses[1].envs["GPU"]
        );
    }

    #[tokio::test]
    async fn list_and_watch_sends_inventory_once_then_ends_on_stop() {
        let stop = CancellationToken::new();
        let service = service().with_stop_token(stop.clone());

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.devices.len(), 100);

        stop.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn preferred_allocation_is_empty() {
        let response = service()
            .get_preferred_allocation(Request::new(PreferredAllocationRequest {
                container_requests: vec![],
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(response.container_responses.is_empty());
    }
}
