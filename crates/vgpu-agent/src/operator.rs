//! Physical GPU discovery and virtual device node mechanics.

use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;

use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Prefix of the per-binding device node visible inside containers.
pub const VIRTUAL_DEVICE_PREFIX: &str = "elastic-gpu";
const VIRTUAL_CTL_PREFIX: &str = "elastic-gpuctl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub uuid: String,
    pub index: u32,
    pub minor: u32,
    pub memory_bytes: u64,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("NVML error: {0}")]
    Nvml(#[from] NvmlError),
    #[error("no physical GPU with index {0}")]
    UnknownIndex(u32),
}

/// Creates and removes the host-side node that stands for one binding.
///
/// `id` is a binding id (`<hash>-<ordinal>`); implementations must make
/// `create` idempotent and treat deleting an absent node as success.
pub trait VirtualDeviceOperator: Send + Sync {
    fn create(&self, index: u32, id: &str) -> Result<(), OperatorError>;

    fn delete(&self, index: u32, id: &str) -> Result<(), OperatorError>;

    fn check(&self, index: u32, id: &str) -> bool;

    fn devices(&self) -> &[PhysicalDevice];
}

/// NVML based GPU enumeration.
pub struct NvmlDevices;

impl NvmlDevices {
    pub fn init() -> Result<Nvml, OperatorError> {
        match Nvml::init() {
            Ok(nvml) => {
                info!("NVML initialized successfully");
                Ok(nvml)
            }
            Err(_) => {
                warn!("Standard NVML init failed, trying with explicit library path");
                let nvml = Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()?;
                info!("NVML initialized with explicit library path");
                Ok(nvml)
            }
        }
    }

    pub fn discover(nvml: &Nvml) -> Result<Vec<PhysicalDevice>, OperatorError> {
        let count = nvml.device_count()?;
        info!("Discovered {count} GPU device(s)");

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = nvml.device_by_index(index)?;
            let gpu = PhysicalDevice {
                uuid: device.uuid()?.to_lowercase(),
                index,
                minor: device.minor_number()?,
                memory_bytes: device.memory_info()?.total,
                model: device.name()?,
            };
            info!(index, uuid = %gpu.uuid, model = %gpu.model, "Found GPU");
            devices.push(gpu);
        }
        Ok(devices)
    }
}

/// Materializes bindings as symlinks in the host `/dev` mount:
/// `elastic-gpu-<id>` to the GPU node and `elastic-gpuctl-<id>` to the control
/// node. The container runtime hook later bind-mounts them.
pub struct SymlinkOperator {
    host_dev_dir: PathBuf,
    dev_dir: PathBuf,
    devices: Vec<PhysicalDevice>,
}

impl SymlinkOperator {
    pub fn new(host_dev_dir: impl Into<PathBuf>, devices: Vec<PhysicalDevice>) -> Self {
        Self {
            host_dev_dir: host_dev_dir.into(),
            dev_dir: PathBuf::from("/dev"),
            devices,
        }
    }

    /// Directory the links point into. `/dev` unless overridden.
    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self
    }

    fn links(&self, index: u32, id: &str) -> Result<[(PathBuf, PathBuf); 2], OperatorError> {
        let gpu = self
            .devices
            .iter()
            .find(|d| d.index == index)
            .ok_or(OperatorError::UnknownIndex(index))?;
        Ok([
            (
                self.host_dev_dir.join(format!("{VIRTUAL_DEVICE_PREFIX}-{id}")),
                self.dev_dir.join(format!("nvidia{}", gpu.minor)),
            ),
            (
                self.host_dev_dir.join(format!("{VIRTUAL_CTL_PREFIX}-{id}")),
                self.dev_dir.join("nvidiactl"),
            ),
        ])
    }
}

impl VirtualDeviceOperator for SymlinkOperator {
    fn create(&self, index: u32, id: &str) -> Result<(), OperatorError> {
        for (link, target) in self.links(index, id)? {
            ensure_symlink(&link, &target)?;
        }
        debug!(index, id, "virtual device created");
        Ok(())
    }

    fn delete(&self, index: u32, id: &str) -> Result<(), OperatorError> {
        // only the link names matter here, the GPU may be gone already
        let names = [
            self.host_dev_dir.join(format!("{VIRTUAL_DEVICE_PREFIX}-{id}")),
            self.host_dev_dir.join(format!("{VIRTUAL_CTL_PREFIX}-{id}")),
        ];
        for link in names {
            match std::fs::remove_file(&link) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(OperatorError::Io {
                        op: "remove",
                        path: link,
                        source,
                    })
                }
            }
        }
        debug!(index, id, "virtual device deleted");
        Ok(())
    }

    fn check(&self, index: u32, id: &str) -> bool {
        match self.links(index, id) {
            Ok(links) => links
                .iter()
                .all(|(link, target)| std::fs::read_link(link).is_ok_and(|t| &t == target)),
            Err(_) => false,
        }
    }

    fn devices(&self) -> &[PhysicalDevice] {
        &self.devices
    }
}

fn ensure_symlink(link: &Path, target: &Path) -> Result<(), OperatorError> {
    match std::fs::read_link(link) {
        Ok(existing) if existing == target => return Ok(()),
        Ok(_) => std::fs::remove_file(link).map_err(|source| OperatorError::Io {
            op: "remove",
            path: link.to_path_buf(),
            source,
        })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(OperatorError::Io {
                op: "readlink",
                path: link.to_path_buf(),
                source,
            })
        }
    }
    symlink(target, link).map_err(|source| OperatorError::Io {
        op: "symlink",
        path: link.to_path_buf(),
        source,
    })
}

/// Whole-GPU mode: the NVIDIA runtime exposes devices itself, nothing to
/// materialize.
pub struct PassthroughOperator {
    devices: Vec<PhysicalDevice>,
}

impl PassthroughOperator {
    pub fn new(devices: Vec<PhysicalDevice>) -> Self {
        Self { devices }
    }
}

impl VirtualDeviceOperator for PassthroughOperator {
    fn create(&self, _index: u32, _id: &str) -> Result<(), OperatorError> {
        Ok(())
    }

    fn delete(&self, _index: u32, _id: &str) -> Result<(), OperatorError> {
        Ok(())
    }

    fn check(&self, _index: u32, _id: &str) -> bool {
        true
    }

    fn devices(&self) -> &[PhysicalDevice] {
        &self.devices
    }
}
