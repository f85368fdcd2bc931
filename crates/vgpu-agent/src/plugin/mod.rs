//! Resource kinds advertised to the kubelet.
//!
//! Each [`ResourcePlugin`] owns one extended resource name: it decides the
//! device inventory, builds `Allocate` responses and materializes bindings
//! through the virtual device operator. The manager serves one device plugin
//! per entry of the [`PluginRegistry`].

use std::sync::Arc;

use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::Device;
use device_plugin_pb::api::DeviceSpec;
use thiserror::Error;

use crate::operator::OperatorError;
use crate::operator::VirtualDeviceOperator;
use crate::types::Binding;

pub mod gpu_core;
pub mod gpu_memory;

pub use gpu_core::GpuCorePlugin;
pub use gpu_memory::GpuMemoryPlugin;

pub trait ResourcePlugin: Send + Sync {
    /// Short name used on the command line, e.g. `gpu-core`.
    fn name(&self) -> &str;

    /// Extended resource name registered with the kubelet.
    fn resource_name(&self) -> &str;

    fn pre_start_required(&self) -> bool;

    /// Socket file created in the device plugin directory.
    fn socket_name(&self) -> String {
        format!("elastic-{}.sock", self.name())
    }

    fn list(&self) -> Vec<Device>;

    /// Response for one container request. Must not touch persistent state.
    fn allocate(&self, device_ids: &[String]) -> ContainerAllocateResponse;

    fn create_binding(&self, index: u32, id: &str) -> Result<(), OperatorError>;

    fn delete_binding(&self, index: u32, id: &str) -> Result<(), OperatorError>;

    /// Whether the virtual device of a binding is present on the host.
    fn check_binding(&self, index: u32, id: &str) -> bool;
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown plugin {0:?}, expected one of: gpu-core, gpu-memory")]
    Unknown(String),
    #[error("resource {0} is registered twice")]
    Duplicate(String),
}

/// The set of plugins this agent serves.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn ResourcePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the plugins named on the command line.
    pub fn from_names<S: AsRef<str>>(
        names: &[S],
        operator: Arc<dyn VirtualDeviceOperator>,
    ) -> Result<Self, PluginError> {
        let mut registry = Self::new();
        for name in names {
            let plugin: Arc<dyn ResourcePlugin> = match name.as_ref().trim() {
                gpu_core::PLUGIN_NAME => Arc::new(GpuCorePlugin::new(operator.clone())),
                gpu_memory::PLUGIN_NAME => Arc::new(GpuMemoryPlugin::new(operator.clone())),
                other => return Err(PluginError::Unknown(other.to_string())),
            };
            registry.register(plugin)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, plugin: Arc<dyn ResourcePlugin>) -> Result<(), PluginError> {
        if self.get(plugin.resource_name()).is_some() {
            return Err(PluginError::Duplicate(plugin.resource_name().to_string()));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn get(&self, resource_name: &str) -> Option<&Arc<dyn ResourcePlugin>> {
        self.plugins
            .iter()
            .find(|plugin| plugin.resource_name() == resource_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ResourcePlugin>> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// The plugin that created `binding`'s devices: the one whose resource the
    /// binding recorded, else the first plugin that binds at pre-start.
    pub fn binding_owner(&self, binding: &Binding) -> Option<&Arc<dyn ResourcePlugin>> {
        binding
            .resources
            .keys()
            .find_map(|resource| self.get(resource))
            .or_else(|| self.plugins.iter().find(|p| p.pre_start_required()))
    }
}

pub(crate) fn char_device(container_path: String, host_path: String) -> DeviceSpec {
    DeviceSpec {
        container_path,
        host_path,
        permissions: "rwm".to_string(),
    }
}

/// Control nodes every GPU container needs next to its virtual device.
pub(crate) fn nvidia_control_devices() -> Vec<DeviceSpec> {
    ["nvidiactl", "nvidia-uvm", "nvidia-uvm-tools"]
        .into_iter()
        .map(|node| char_device(format!("/host/dev/{node}"), format!("/dev/{node}")))
        .collect()
}
