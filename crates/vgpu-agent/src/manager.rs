//! Wires the agent together and owns its background tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::DaemonArgs;
use crate::config::DeviceMode;
use crate::device_plugin::Binder;
use crate::device_plugin::DevicePluginService;
use crate::device_plugin::PluginServer;
use crate::gc::GcReconciler;
use crate::gc::GcTrigger;
use crate::k8s::kube_client;
use crate::k8s::KubePodSitter;
use crate::k8s::PodCache;
use crate::k8s::PodSitter;
use crate::locator::KubeletDeviceLocator;
use crate::operator::NvmlDevices;
use crate::operator::PassthroughOperator;
use crate::operator::SymlinkOperator;
use crate::operator::VirtualDeviceOperator;
use crate::plugin::PluginRegistry;
use crate::store::BindingStore;
use crate::store::LmdbBindingStore;
use crate::syncer::CatalogSync;
use crate::syncer::GpuSyncer;
use crate::syncer::NoopSync;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Recreates the virtual devices of stored bindings that are missing on the
/// host. Returns how many devices could not be restored.
pub fn restore_bindings(store: &dyn BindingStore, plugins: &PluginRegistry) -> usize {
    let records = match store.list() {
        Ok(records) => records,
        Err(e) => {
            error!("failed to scan binding store for restore: {e}");
            return 0;
        }
    };

    let (mut intact, mut restored, mut failed) = (0, 0, 0);
    for record in &records {
        for (container, binding) in &record.containers {
            let Some(plugin) = plugins.binding_owner(binding) else {
                warn!(namespace = %record.namespace, pod = %record.name, container, "no plugin owns this binding, skipping restore");
                continue;
            };
            for (index, id) in binding.devices() {
                if plugin.check_binding(index, &id) {
                    intact += 1;
                    continue;
                }
                if let Err(e) = plugin.create_binding(index, &id) {
                    error!(
                        namespace = %record.namespace,
                        pod = %record.name,
                        container,
                        hash = %binding.fingerprint,
                        index,
                        "failed to restore virtual device: {e}"
                    );
                    failed += 1;
                } else {
                    restored += 1;
                }
            }
        }
    }
    info!(
        records = records.len(),
        intact,
        restored,
        failed,
        "restored virtual devices from binding store"
    );
    failed
}

/// Owns the agent's background tasks from startup to shutdown.
pub struct Manager {
    args: DaemonArgs,
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Manager {
    pub fn new(args: DaemonArgs) -> Self {
        Self {
            args,
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Starts every component, then blocks until a shutdown signal.
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.start().await {
            self.cancellation_token.cancel();
            self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
            return Err(e);
        }
        self.wait_for_completion().await
    }

    async fn start(&mut self) -> Result<()> {
        let args = self.args.clone();
        let annotations = args.annotations();

        let store: Arc<dyn BindingStore> = Arc::new(
            LmdbBindingStore::open(&args.db_file)
                .with_context(|| format!("open binding store {}", args.db_file.display()))?,
        );

        let client = kube_client::init_kube_client(args.kubeconfig.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize kubernetes client: {e:?}"))?;

        // pod sitter, feeding deletions of assumed pods to the GC loop
        let (gc_trigger, gc_signals) = GcTrigger::channel();
        let cache = PodCache::new(annotations.clone()).with_deletion_hook(Arc::new({
            let gc_trigger = gc_trigger.clone();
            move |event| gc_trigger.pod_deleted(event)
        }));
        let sitter = Arc::new(KubePodSitter::new(
            client.clone(),
            args.node_name.clone(),
            cache,
        ));
        self.tasks.push({
            let sitter = sitter.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                sitter.run(token).await;
                info!("Pod sitter task completed");
            })
        });
        info!("waiting for pod cache to sync");
        if !sitter.wait_for_sync(&self.cancellation_token).await {
            anyhow::bail!("shut down before the pod cache synced");
        }

        // physical GPUs and how virtual devices are made from them
        let nvml = NvmlDevices::init().context("initialize NVML")?;
        let devices = NvmlDevices::discover(&nvml).context("enumerate GPUs")?;
        info!(count = devices.len(), mode = ?args.mode, "discovered GPUs");
        let operator: Arc<dyn VirtualDeviceOperator> = match args.mode {
            DeviceMode::Gpushare => {
                Arc::new(SymlinkOperator::new(&args.host_dev_dir, devices.clone()))
            }
            DeviceMode::Nvidia => Arc::new(PassthroughOperator::new(devices.clone())),
        };

        let plugins = PluginRegistry::from_names(&args.plugins, operator)?;
        restore_bindings(store.as_ref(), &plugins);

        let syncer: Arc<dyn CatalogSync> = if args.sync_gpus {
            Arc::new(GpuSyncer::new(client, args.node_name.clone(), devices))
        } else {
            Arc::new(NoopSync)
        };

        let sitter: Arc<dyn PodSitter> = sitter;
        for plugin in plugins.iter() {
            let binder = plugin.pre_start_required().then(|| {
                Arc::new(Binder::new(
                    plugin.clone(),
                    Arc::new(KubeletDeviceLocator::new(
                        &args.pod_resources_socket,
                        plugin.resource_name(),
                    )),
                    sitter.clone(),
                    store.clone(),
                    annotations.clone(),
                ))
            });
            let service = DevicePluginService::new(plugin.clone(), binder, syncer.clone());
            let server = PluginServer::new(
                service,
                &args.device_plugin_dir,
                plugin.socket_name(),
                args.restart_delay(),
            );

            let token = self.cancellation_token.clone();
            let resource = plugin.resource_name().to_string();
            self.tasks.push(tokio::spawn(async move {
                info!(resource, "Starting device plugin task");
                server.run(token).await;
                info!(resource, "Device plugin task completed");
            }));
        }

        let gc = GcReconciler::new(store, sitter, plugins, args.gc_interval());
        // reclaim what was deleted while the agent was down
        gc_trigger.signal();
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            gc.run(gc_signals, token).await;
            info!("GC task completed");
        }));

        Ok(())
    }

    /// wait for a shutdown signal or for a task to end on its own
    async fn wait_for_completion(&mut self) -> Result<()> {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let finished = tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                None
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                None
            }
            (result, index, _) = futures::future::select_all(&mut self.tasks) => {
                match result {
                    Ok(()) => warn!("Task completed unexpectedly"),
                    Err(e) => error!("Task completed with error: {e}"),
                }
                Some(index)
            }
        };
        // a finished handle must not be awaited again
        if let Some(index) = finished {
            self.tasks.remove(index);
        }

        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::fingerprint::DeviceFingerprint;
    use crate::testing::RecordingPlugin;
    use crate::types::Binding;
    use crate::types::PodRecord;

    #[test]
    fn restore_recreates_every_stored_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbBindingStore::open(dir.path().join("meta.db")).unwrap();
        let plugin = Arc::new(RecordingPlugin::new("elastic-gpu/gpu-percent"));
        let mut plugins = PluginRegistry::new();
        plugins.register(plugin.clone()).unwrap();

        let fingerprint = DeviceFingerprint::new(["0-00", "0-01"]);
        let mut record = PodRecord::new("ns", "p1");
        record.containers.insert(
            "c1".to_string(),
            Binding {
                indices: vec![2, 3],
                resources: BTreeMap::new(),
                fingerprint: fingerprint.clone(),
            },
        );
        store.save(&record).unwrap();

        let failed = restore_bindings(&store, &plugins);

        assert_eq!(failed, 0);
        assert_eq!(
            plugin.created(),
            vec![(2, fingerprint.binding_id(0)), (3, fingerprint.binding_id(1))]
        );

        // a second restart finds everything in place
        plugin.fail_create_at(3);
        assert_eq!(restore_bindings(&store, &plugins), 0);
    }

    #[test]
    fn restore_counts_failures_and_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbBindingStore::open(dir.path().join("meta.db")).unwrap();
        let plugin = Arc::new(RecordingPlugin::new("elastic-gpu/gpu-percent"));
        plugin.fail_create_at(1);
        let mut plugins = PluginRegistry::new();
        plugins.register(plugin.clone()).unwrap();

        for name in ["p1", "p2"] {
            let mut record = PodRecord::new("ns", name);
            record.containers.insert(
                "c".to_string(),
                Binding {
                    indices: vec![0],
                    resources: BTreeMap::new(),
                    fingerprint: DeviceFingerprint::new([name]),
                },
            );
            store.save(&record).unwrap();
        }

        assert_eq!(restore_bindings(&store, &plugins), 1);
        assert_eq!(plugin.created().len(), 1);
    }
}
