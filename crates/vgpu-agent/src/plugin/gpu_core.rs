//! Fractional GPU compute, in percent of one card.

use std::collections::HashMap;
use std::sync::Arc;

use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::Device;
use device_plugin_pb::HEALTHY;

use super::char_device;
use super::nvidia_control_devices;
use super::ResourcePlugin;
use crate::fingerprint::DeviceFingerprint;
use crate::operator::OperatorError;
use crate::operator::VirtualDeviceOperator;
use crate::operator::VIRTUAL_DEVICE_PREFIX;

pub const PLUGIN_NAME: &str = "gpu-core";
pub const RESOURCE_NAME: &str = "elastic-gpu/gpu-percent";

/// Units advertised per physical GPU.
pub const UNITS_PER_GPU: usize = 100;

pub struct GpuCorePlugin {
    operator: Arc<dyn VirtualDeviceOperator>,
    devices: Vec<Device>,
}

impl GpuCorePlugin {
    /// Snapshots the inventory, `<gpu>-<NN>` for every percent of every GPU.
    pub fn new(operator: Arc<dyn VirtualDeviceOperator>) -> Self {
        let devices = (0..operator.devices().len())
            .flat_map(|gpu| {
                (0..UNITS_PER_GPU).map(move |unit| Device {
                    id: format!("{gpu}-{unit:02}"),
                    health: HEALTHY.to_string(),
                    topology: None,
                })
            })
            .collect();
        Self { operator, devices }
    }
}

impl ResourcePlugin for GpuCorePlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn resource_name(&self) -> &str {
        RESOURCE_NAME
    }

    fn pre_start_required(&self) -> bool {
        true
    }

    fn list(&self) -> Vec<Device> {
        self.devices.clone()
    }

    fn allocate(&self, device_ids: &[String]) -> ContainerAllocateResponse {
        let fingerprint = DeviceFingerprint::new(device_ids.iter().cloned());
        let whole_cards = (device_ids.len() / UNITS_PER_GPU).max(1);

        let mut devices = nvidia_control_devices();
        devices.extend((0..whole_cards).map(|ordinal| {
            let node = format!("{VIRTUAL_DEVICE_PREFIX}-{}", fingerprint.binding_id(ordinal));
            char_device(format!("/host/dev/{node}"), format!("/dev/{node}"))
        }));

        ContainerAllocateResponse {
            envs: HashMap::from([
                ("GPU".to_string(), fingerprint.hash.clone()),
                ("NVIDIA_VISIBLE_DEVICES".to_string(), "none".to_string()),
            ]),
            devices,
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
