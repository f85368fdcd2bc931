use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;

use crate::device_plugin::registration::DEFAULT_DEVICE_PLUGIN_DIR;
use crate::k8s::annotations::AssumedAnnotations;
use crate::k8s::annotations::DEFAULT_ASSUMED_ANNOTATION;
use crate::k8s::annotations::DEFAULT_CONTAINER_ANNOTATION_PREFIX;
use crate::locator::DEFAULT_POD_RESOURCES_SOCKET;

/// How virtual devices are materialized on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceMode {
    /// Per-container device symlinks under the host `/dev`
    Gpushare,
    /// Whole devices handed over by the NVIDIA runtime, nothing to create
    Nvidia,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent runs on, used to filter pods and label GPUs"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "VGPU_DB_FILE",
        default_value = "/var/lib/vgpu-agent/meta.db",
        value_hint = clap::ValueHint::FilePath,
        help = "LMDB file holding container bindings"
    )]
    pub db_file: PathBuf,

    #[arg(
        long,
        env = "VGPU_PLUGINS",
        value_delimiter = ',',
        default_value = "gpu-core",
        help = "Resource plugins to serve, e.g. gpu-core,gpu-memory"
    )]
    pub plugins: Vec<String>,

    #[arg(
        long,
        env = "VGPU_MODE",
        value_enum,
        default_value_t = DeviceMode::Gpushare,
        help = "How virtual devices are created on the host"
    )]
    pub mode: DeviceMode,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        default_value = DEFAULT_DEVICE_PLUGIN_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet device plugin directory holding kubelet.sock"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "POD_RESOURCES_SOCKET",
        default_value = DEFAULT_POD_RESOURCES_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet pod-resources socket"
    )]
    pub pod_resources_socket: PathBuf,

    #[arg(
        long,
        env = "HOST_DEV_DIR",
        default_value = "/host/dev",
        value_hint = clap::ValueHint::DirPath,
        help = "Host /dev as mounted into the agent container"
    )]
    pub host_dev_dir: PathBuf,

    #[arg(
        long,
        env = "VGPU_GC_INTERVAL_SECS",
        default_value = "60",
        help = "Seconds between two periodic GC passes"
    )]
    pub gc_interval_secs: u64,

    #[arg(
        long,
        env = "VGPU_RESTART_DELAY_MS",
        default_value = "1000",
        help = "Delay in milliseconds before a failed device plugin server is restarted"
    )]
    pub restart_delay_ms: u64,

    #[arg(
        long,
        env = "VGPU_ASSUMED_ANNOTATION",
        default_value = DEFAULT_ASSUMED_ANNOTATION,
        help = "Pod annotation marking a pod as placed by the GPU scheduler"
    )]
    pub assumed_annotation: String,

    #[arg(
        long,
        env = "VGPU_CONTAINER_ANNOTATION_PREFIX",
        default_value = DEFAULT_CONTAINER_ANNOTATION_PREFIX,
        help = "Prefix of the per-container annotation listing assigned GPU indices"
    )]
    pub container_annotation_prefix: String,

    #[arg(
        long,
        env = "VGPU_SYNC_GPUS",
        help = "Publish this node's GPUs as GPU resources",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub sync_gpus: bool,

    #[arg(
        long,
        env = "VGPU_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for daily rotated log files, stderr only when unset"
    )]
    pub log_dir: Option<PathBuf>,
}

impl DaemonArgs {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn annotations(&self) -> AssumedAnnotations {
        AssumedAnnotations::new(&self.assumed_annotation, &self.container_annotation_prefix)
    }
}
