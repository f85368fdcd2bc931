//! Keeps one device plugin served on its socket and registered with the kubelet.
//!
//! The kubelet forgets every plugin when it restarts and recreates its
//! `kubelet.sock`, so the server watches the plugin directory and goes through
//! bind, self-check and register again whenever that happens. The watch is
//! set up before the first registration and outlives every server
//! incarnation, so a restart racing with `Register` is still seen.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::RegisterRequest;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::net::UnixListener;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::DevicePluginService;
use crate::uds;

pub const DEFAULT_DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";
pub const KUBELET_SOCKET: &str = "kubelet.sock";

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Serving,
    AwaitingSelfReady,
    Registering,
    Active,
    Restarting,
    Stopped,
}

/// Plugin directory events, collected for the whole life of a [`PluginServer`].
struct KubeletWatch {
    // dropping the watcher stops it
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<Event>,
}

impl KubeletWatch {
    fn new(dir: &Path) -> notify::Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!("Filesystem watch error: {e:?}"),
            },
            Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    /// Forgets events from before the current incarnation.
    fn drain(&mut self) {
        while self.events.try_recv().is_ok() {}
    }
}

/// Registration lifecycle of one [`DevicePluginService`].
pub struct PluginServer {
    service: DevicePluginService,
    plugin_dir: PathBuf,
    socket_name: String,
    restart_delay: Duration,
}

impl PluginServer {
    pub fn new(
        service: DevicePluginService,
        plugin_dir: impl Into<PathBuf>,
        socket_name: impl Into<String>,
        restart_delay: Duration,
    ) -> Self {
        Self {
            service,
            plugin_dir: plugin_dir.into(),
            socket_name: socket_name.into(),
            restart_delay,
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.socket_name)
    }

    fn kubelet_socket(&self) -> PathBuf {
        self.plugin_dir.join(KUBELET_SOCKET)
    }

    /// Drives the state machine until `stop` is cancelled. Failures only ever
    /// lead to another attempt.
    #[tracing::instrument(skip_all, fields(resource = %self.service.resource_name()))]
    pub async fn run(self, stop: CancellationToken) {
        let mut state = PluginState::Serving;
        let mut incarnation = stop.child_token();
        let mut watch: Option<KubeletWatch> = None;

        loop {
            if stop.is_cancelled() && state != PluginState::Stopped {
                state = PluginState::Stopped;
            }
            debug!(?state, "device plugin state");

            state = match state {
                PluginState::Serving => {
                    incarnation = stop.child_token();
                    if let Err(e) = self.prepare_watch(&mut watch) {
                        error!(dir = %self.plugin_dir.display(), "failed to watch device plugin directory: {e}");
                        PluginState::Restarting
                    } else {
                        match self.serve(incarnation.clone()) {
                            Ok(()) => PluginState::AwaitingSelfReady,
                            Err(e) => {
                                error!(socket = %self.socket_path().display(), "failed to serve device plugin: {e}");
                                PluginState::Restarting
                            }
                        }
                    }
                }
                PluginState::AwaitingSelfReady => {
                    match uds::connect(self.socket_path(), DIAL_TIMEOUT).await {
                        Ok(_) => PluginState::Registering,
                        Err(e) => {
                            warn!("device plugin socket is not accepting connections: {e}");
                            PluginState::Restarting
                        }
                    }
                }
                PluginState::Registering => match self.register().await {
                    Ok(()) => {
                        info!("registered device plugin with kubelet");
                        PluginState::Active
                    }
                    Err(e) => {
                        warn!("failed to register with kubelet: {e}");
                        PluginState::Restarting
                    }
                },
                PluginState::Active => match watch.as_mut() {
                    Some(watch) => self.watch_kubelet(watch, &stop).await,
                    None => PluginState::Restarting,
                },
                PluginState::Restarting => {
                    incarnation.cancel();
                    select! {
                        _ = stop.cancelled() => PluginState::Stopped,
                        _ = tokio::time::sleep(self.restart_delay) => PluginState::Serving,
                    }
                }
                PluginState::Stopped => {
                    incarnation.cancel();
                    remove_socket(&self.socket_path());
                    info!("device plugin stopped");
                    return;
                }
            };
        }
    }

    /// Starts the directory watch on first use, otherwise drops stale events.
    fn prepare_watch(&self, watch: &mut Option<KubeletWatch>) -> notify::Result<()> {
        match watch {
            Some(watch) => watch.drain(),
            None => *watch = Some(KubeletWatch::new(&self.plugin_dir)?),
        }
        Ok(())
    }

    /// Binds a fresh socket and spawns a server incarnation stopped by `token`.
    fn serve(&self, token: CancellationToken) -> std::io::Result<()> {
        let socket_path = self.socket_path();
        remove_socket(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;

        let service = self.service.clone().with_stop_token(token.clone());
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    token.cancelled(),
                )
                .await;
            if let Err(e) = result {
                error!("device plugin gRPC server failed: {e}");
            }
        });

        info!(socket = %socket_path.display(), "device plugin gRPC server started");
        Ok(())
    }

    async fn register(&self) -> anyhow::Result<()> {
        let channel = uds::connect(self.kubelet_socket(), DIAL_TIMEOUT).await?;
        let mut client = RegistrationClient::new(channel);
        client
            .register(RegisterRequest {
                version: device_plugin_pb::VERSION.to_string(),
                endpoint: self.socket_name.clone(),
                resource_name: self.service.resource_name().to_string(),
                options: Some(self.service.options()),
            })
            .await?;
        Ok(())
    }

    /// Waits in `Active` until the kubelet socket is recreated or `stop` fires.
    async fn watch_kubelet(
        &self,
        watch: &mut KubeletWatch,
        stop: &CancellationToken,
    ) -> PluginState {
        let kubelet_socket = self.kubelet_socket();
        loop {
            select! {
                _ = stop.cancelled() => return PluginState::Stopped,
                event = watch.events.recv() => match event {
                    Some(event) if is_socket_created(&event, &kubelet_socket) => {
                        info!("kubelet socket recreated, re-registering");
                        return PluginState::Restarting;
                    }
                    Some(_) => {}
                    None => return PluginState::Restarting,
                },
            }
        }
    }
}

fn is_socket_created(event: &Event, socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|p| p == socket)
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket = %path.display(), "failed to remove socket: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use device_plugin_pb::api::registration_server::Registration;
    use device_plugin_pb::api::registration_server::RegistrationServer;
    use device_plugin_pb::api::Empty;
    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio::sync::Mutex;
    use tonic::Request;
    use tonic::Response;
    use tonic::Status;

    use super::*;
    use crate::operator::PassthroughOperator;
    use crate::plugin::GpuCorePlugin;
    use crate::syncer::NoopSync;

    /// Kubelet registration endpoint that records every request.
    #[derive(Clone, Default)]
    struct FakeKubelet {
        requests: Arc<Mutex<Vec<RegisterRequest>>>,
        /// Socket to recreate while answering the first registration.
        restart_at: Option<PathBuf>,
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> Result<Response<Empty>, Status> {
            let first = {
                let mut requests = self.requests.lock().await;
                requests.push(request.into_inner());
                requests.len() == 1
            };
            if let Some(socket) = self.restart_at.as_ref().filter(|_| first) {
                serve_kubelet(self.clone(), socket, CancellationToken::new())
                    .map_err(|e| Status::internal(e.to_string()))?;
            }
            Ok(Response::new(Empty {}))
        }
    }

    fn serve_kubelet(
        kubelet: FakeKubelet,
        socket: &Path,
        token: CancellationToken,
    ) -> std::io::Result<()> {
        let _ = std::fs::remove_file(socket);
        let listener = UnixListener::bind(socket)?;
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RegistrationServer::new(kubelet))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    token.cancelled_owned(),
                )
                .await
        });
        Ok(())
    }

    fn start_kubelet(dir: &Path, token: CancellationToken) -> FakeKubelet {
        let kubelet = FakeKubelet::default();
        serve_kubelet(kubelet.clone(), &dir.join(KUBELET_SOCKET), token).unwrap();
        kubelet
    }

    fn server(dir: &Path) -> PluginServer {
        let plugin = Arc::new(GpuCorePlugin::new(Arc::new(PassthroughOperator::new(Vec::new()))));
        let service = DevicePluginService::new(plugin, None, Arc::new(NoopSync));
        PluginServer::new(service, dir, "elastic-gpu-core.sock", Duration::from_millis(50))
    }

    async fn wait_for_registrations(kubelet: &FakeKubelet, n: usize) -> Vec<RegisterRequest> {
        for _ in 0..200 {
            let requests = kubelet.requests.lock().await.clone();
            if requests.len() >= n {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("expected {n} registrations");
    }

    #[test(tokio::test)]
    async fn registers_and_re_registers_after_kubelet_restart() {
        let dir = tempfile::tempdir().unwrap();
        let kubelet_token = CancellationToken::new();
        let kubelet = start_kubelet(dir.path(), kubelet_token.clone());

        let stop = CancellationToken::new();
        let handle = tokio::spawn(server(dir.path()).run(stop.clone()));

        let first = wait_for_registrations(&kubelet, 1).await;
        assert_eq!(first[0].version, "v1beta1");
        assert_eq!(first[0].endpoint, "elastic-gpu-core.sock");
        assert_eq!(first[0].resource_name, "elastic-gpu/gpu-percent");
        assert!(first[0].options.unwrap().pre_start_required);

        // kubelet restart: its socket is recreated
        kubelet_token.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let restarted = start_kubelet(dir.path(), CancellationToken::new());

        let again = wait_for_registrations(&restarted, 1).await;
        assert_eq!(again[0].resource_name, "elastic-gpu/gpu-percent");

        stop.cancel();
        handle.await.unwrap();
        assert!(!dir.path().join("elastic-gpu-core.sock").exists());
    }

    #[test(tokio::test)]
    async fn kubelet_restart_during_register_is_not_missed() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(KUBELET_SOCKET);
        let kubelet = FakeKubelet {
            restart_at: Some(socket.clone()),
            ..Default::default()
        };
        serve_kubelet(kubelet.clone(), &socket, CancellationToken::new()).unwrap();

        let stop = CancellationToken::new();
        let handle = tokio::spawn(server(dir.path()).run(stop.clone()));

        // the second request can only come from noticing the recreated socket
        let requests = wait_for_registrations(&kubelet, 2).await;
        assert_eq!(requests[1].endpoint, "elastic-gpu-core.sock");

        stop.cancel();
        handle.await.unwrap();
    }

    #[test(tokio::test)]
    async fn keeps_retrying_without_kubelet_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(server(dir.path()).run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
