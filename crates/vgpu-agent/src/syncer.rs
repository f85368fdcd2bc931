//! Publishes the node's physical GPUs as cluster-scoped `GPU` resources.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ClusterResourceScope;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use tracing::error;
use tracing::info;

use crate::k8s::KubernetesError;
use crate::operator::PhysicalDevice;

pub const NODE_LABEL: &str = "elasticgpu.io/node";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct GpuSpec {
    pub index: u32,
    pub uuid: String,
    pub model: String,
    pub path: String,
    pub memory: u64,
    pub node_name: String,
}

/// `elasticgpu.io/v1alpha1` GPU
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::upper_case_acronyms)]
pub struct GPU {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<GpuSpec>,
}

impl kube::Resource for GPU {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn group(_dt: &()) -> Cow<'_, str> {
        "elasticgpu.io".into()
    }

    fn version(_dt: &()) -> Cow<'_, str> {
        "v1alpha1".into()
    }

    fn kind(_dt: &()) -> Cow<'_, str> {
        "GPU".into()
    }

    fn plural(_dt: &()) -> Cow<'_, str> {
        "gpus".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl GPU {
    fn for_device(node_name: &str, device: &PhysicalDevice) -> Self {
        Self {
            api_version: "elasticgpu.io/v1alpha1".to_string(),
            kind: "GPU".to_string(),
            metadata: ObjectMeta {
                name: Some(format!("{node_name}-{:02}", device.index)),
                labels: Some(BTreeMap::from([(
                    NODE_LABEL.to_string(),
                    node_name.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(GpuSpec {
                index: device.index,
                uuid: device.uuid.clone(),
                model: device.model.clone(),
                path: format!("/dev/nvidia{}", device.minor),
                memory: device.memory_bytes,
                node_name: node_name.to_string(),
            }),
        }
    }

    fn uuid(&self) -> Option<&str> {
        self.spec.as_ref().map(|spec| spec.uuid.as_str())
    }

    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Changes that bring the published GPUs in line with the hardware.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub create: Vec<GPU>,
    pub replace: Vec<GPU>,
    pub delete: Vec<GPU>,
}

/// Matches published objects to devices by UUID.
pub fn plan(node_name: &str, devices: &[PhysicalDevice], existing: Vec<GPU>) -> SyncPlan {
    let mut desired: HashMap<String, GPU> = devices
        .iter()
        .map(|device| (device.uuid.clone(), GPU::for_device(node_name, device)))
        .collect();

    let mut plan = SyncPlan::default();
    for current in existing {
        let Some(mut wanted) = current.uuid().and_then(|uuid| desired.remove(uuid)) else {
            plan.delete.push(current);
            continue;
        };
        if wanted.spec != current.spec {
            // replace must target the stored object
            wanted.metadata.name = current.metadata.name.clone();
            wanted.metadata.resource_version = current.metadata.resource_version.clone();
            plan.replace.push(wanted);
        }
    }
    let mut create: Vec<GPU> = desired.into_values().collect();
    create.sort_by(|a, b| a.name().cmp(b.name()));
    plan.create = create;
    plan
}

#[async_trait]
pub trait CatalogSync: Send + Sync {
    async fn sync(&self) -> Result<(), Report<KubernetesError>>;
}

/// For nodes that do not publish a catalog.
pub struct NoopSync;

#[async_trait]
impl CatalogSync for NoopSync {
    async fn sync(&self) -> Result<(), Report<KubernetesError>> {
        Ok(())
    }
}

pub struct GpuSyncer {
    api: Api<GPU>,
    node_name: String,
    devices: Vec<PhysicalDevice>,
}

impl GpuSyncer {
    pub fn new(client: Client, node_name: String, devices: Vec<PhysicalDevice>) -> Self {
        Self {
            api: Api::all(client),
            node_name,
            devices,
        }
    }
}

#[async_trait]
impl CatalogSync for GpuSyncer {
    #[tracing::instrument(skip(self), fields(node_name = %self.node_name))]
    async fn sync(&self) -> Result<(), Report<KubernetesError>> {
        let existing = self
            .api
            .list(&ListParams::default().labels(&format!("{NODE_LABEL}={}", self.node_name)))
            .await
            .change_context(KubernetesError::RequestFailed {
                message: "Failed to list GPU resources".to_string(),
            })?;

        let plan = plan(&self.node_name, &self.devices, existing.items);
        for gpu in &plan.delete {
            if let Err(e) = self.api.delete(gpu.name(), &DeleteParams::default()).await {
                error!(gpu = gpu.name(), "Failed to delete GPU resource: {e}");
            }
        }
        for gpu in &plan.replace {
            if let Err(e) = self.api.replace(gpu.name(), &PostParams::default(), gpu).await {
                error!(gpu = gpu.name(), "Failed to update GPU resource: {e}");
            }
        }
        for gpu in &plan.create {
            if let Err(e) = self.api.create(&PostParams::default(), gpu).await {
                error!(gpu = gpu.name(), "Failed to create GPU resource: {e}");
            }
        }

        info!(
            created = plan.create.len(),
            updated = plan.replace.len(),
            deleted = plan.delete.len(),
            "GPU catalog synced"
        );
        Ok(())
    }
}
