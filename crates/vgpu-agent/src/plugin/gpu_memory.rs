//! GPU memory quota in GiB. Informational only: nothing is bound at
//! container start, the quota reaches the container through `QMEMSIZE`.

use std::collections::HashMap;
use std::sync::Arc;

use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::Device;
use device_plugin_pb::HEALTHY;

use super::ResourcePlugin;
use crate::operator::OperatorError;
use crate::operator::VirtualDeviceOperator;

pub const PLUGIN_NAME: &str = "gpu-memory";
pub const RESOURCE_NAME: &str = "elastic-gpu/gpu-memory";

const BYTES_PER_UNIT: u64 = 1 << 30;

pub struct GpuMemoryPlugin {
    operator: Arc<dyn VirtualDeviceOperator>,
    devices: Vec<Device>,
}

impl GpuMemoryPlugin {
    pub fn new(operator: Arc<dyn VirtualDeviceOperator>) -> Self {
        let devices = operator
            .devices()
            .iter()
            .enumerate()
            .flat_map(|(gpu, physical)| {
                (0..physical.memory_bytes / BYTES_PER_UNIT).map(move |unit| Device {
                    id: format!("m{gpu}-{unit:03}"),
                    health: HEALTHY.to_string(),
                    topology: None,
                })
            })
            .collect();
        Self { operator, devices }
    }
}

impl ResourcePlugin for GpuMemoryPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn resource_name(&self) -> &str {
        RESOURCE_NAME
    }

    fn pre_start_required(&self) -> bool {
        false
    }

    fn list(&self) -> Vec<Device> {
        self.devices.clone()
    }

    fn allocate(&self, device_ids: &[String]) -> ContainerAllocateResponse {
        ContainerAllocateResponse {
            envs: HashMap::from([("QMEMSIZE".to_string(), device_ids.len().to_string())]),
            ..Default::default()
        }
    }

    fn create_binding(&self, index: u32, id: &str) -> Result<(), OperatorError> {
        self.operator.create(index, id)
    }

    fn delete_binding(&self, index: u32, id: &str) -> Result<(), OperatorError> {
        self.operator.delete(index, id)
    }

    fn check_binding(&self, index: u32, id: &str) -> bool {
        self.operator.check(index, id)
    }
}
