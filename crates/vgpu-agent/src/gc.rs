//! Reclaims virtual devices of pods that no longer exist.
//!
//! A record is only collected once both the pod cache and the API server agree
//! the pod is gone, and only dropped from the store after every one of its
//! devices was deleted. Anything else waits for the next pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::k8s::PodDeleted;
use crate::k8s::PodLookup;
use crate::k8s::PodSitter;
use crate::plugin::PluginRegistry;
use crate::store::BindingStore;
use crate::types::PodRecord;

pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Wakes the GC loop. At most one wakeup is pending; extra signals are dropped.
#[derive(Clone)]
pub struct GcTrigger {
    tx: mpsc::Sender<()>,
}

impl GcTrigger {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn signal(&self) {
        // full means a pass is already pending
        let _ = self.tx.try_send(());
    }

    /// Deletion hook for the pod sitter.
    pub fn pod_deleted(&self, event: PodDeleted) {
        if event.assumed {
            debug!(namespace = %event.namespace, pod = %event.name, "assumed pod deleted, scheduling GC");
            self.signal();
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub scanned: usize,
    pub alive: usize,
    pub collected: usize,
    pub retained: usize,
    pub errors: usize,
}

pub struct GcReconciler {
    store: Arc<dyn BindingStore>,
    sitter: Arc<dyn PodSitter>,
    plugins: PluginRegistry,
    interval: Duration,
}

impl GcReconciler {
    pub fn new(
        store: Arc<dyn BindingStore>,
        sitter: Arc<dyn PodSitter>,
        plugins: PluginRegistry,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            sitter,
            plugins,
            interval,
        }
    }

    /// Runs a pass per signal or per interval until cancelled.
    #[tracing::instrument(skip_all, fields(interval = ?self.interval))]
    pub async fn run(&self, mut signals: mpsc::Receiver<()>, cancellation_token: CancellationToken) {
        info!("Starting GC loop");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("GC loop shutdown requested");
                    break;
                }
                _ = signals.recv() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }

            let report = self.pass().await;
            if report.collected > 0 || report.errors > 0 {
                info!(?report, "GC pass finished");
            } else {
                debug!(?report, "GC pass finished");
            }
        }
    }

    pub async fn pass(&self) -> GcReport {
        let mut report = GcReport::default();

        let mut records = Vec::new();
        let scan = self.store.for_each(&mut |entry| match entry {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("GC skipping undecodable binding record: {e}");
                report.errors += 1;
            }
        });
        if let Err(e) = scan {
            error!("GC failed to scan binding store: {e}");
            report.errors += 1;
            return report;
        }
        report.scanned = records.len();

        for record in records {
            match self.is_gone(&record).await {
                Some(true) => {}
                Some(false) => {
                    report.alive += 1;
                    continue;
                }
                None => {
                    report.errors += 1;
                    continue;
                }
            }

            if self.delete_devices(&record) {
                // a PreStart may have rebound the pod since the scan
                match self.store.delete_if_unchanged(&record) {
                    Ok(true) => {
                        info!(namespace = %record.namespace, pod = %record.name, "collected bindings of deleted pod");
                        report.collected += 1;
                    }
                    Ok(false) => {
                        info!(namespace = %record.namespace, pod = %record.name, "binding record rewritten during GC, keeping it");
                        report.retained += 1;
                    }
                    Err(e) => {
                        error!(namespace = %record.namespace, pod = %record.name, "failed to delete binding record: {e}");
                        report.errors += 1;
                        report.retained += 1;
                    }
                }
            } else {
                report.errors += 1;
                report.retained += 1;
            }
        }
        report
    }

    /// `None` when the API server could not be asked.
    async fn is_gone(&self, record: &PodRecord) -> Option<bool> {
        if self.sitter.get_pod(&record.namespace, &record.name).is_some() {
            return Some(false);
        }
        match self
            .sitter
            .get_pod_from_api_server(&record.namespace, &record.name)
            .await
        {
            Ok(PodLookup::Found(_)) => Some(false),
            Ok(PodLookup::NotFound) => Some(true),
            Err(e) => {
                warn!(namespace = %record.namespace, pod = %record.name, "cannot confirm pod deletion, keeping bindings: {e:?}");
                None
            }
        }
    }

    /// Deletes every device of every container. True when all succeeded.
    fn delete_devices(&self, record: &PodRecord) -> bool {
        let mut ok = true;
        for (container, binding) in &record.containers {
            let Some(plugin) = self.plugins.binding_owner(binding) else {
                error!(namespace = %record.namespace, pod = %record.name, container, "no plugin owns this binding");
                ok = false;
                continue;
            };
            for (index, id) in binding.devices() {
                if let Err(e) = plugin.delete_binding(index, &id) {
                    error!(
                        namespace = %record.namespace,
                        pod = %record.name,
                        container,
                        hash = %binding.fingerprint,
                        index,
                        "failed to delete virtual device: {e}"
                    );
                    ok = false;
                }
            }
        }
        ok
    }
}
