use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::RegisterRequest;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device::DeviceSet;
use crate::plugin::health::consume_unhealthy;
use crate::plugin::service::plugin_options;
use crate::plugin::uds;
use crate::plugin::DevicePluginService;
use crate::plugin::DeviceState;
use crate::plugin::HealthCheck;
use crate::plugin::UnhealthySender;

/// Upper bound for the listener task to wind down after the stop signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a plugin session listens and whom it registers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSettings {
    /// plugin socket, e.g. /var/lib/kubelet/device-plugins/qnib-rcuda.sock
    pub socket_path: PathBuf,
    /// kubelet registration socket
    pub kubelet_socket: PathBuf,
    /// resource name (e.g. "qnib.org/rcuda")
    pub resource_name: String,
    /// bound for the confirmation and registration dials
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PluginState {
    Created,
    Starting,
    Serving,
    Stopping,
    Stopped,
}

/// One device plugin session.
///
/// A session is started at most once; the supervisor builds a new one for
/// every restart and stops the previous one first.
#[derive(Debug)]
pub struct RcudaDevicePlugin {
    settings: PluginSettings,
    devices: Arc<DeviceState>,
    health_check: Option<Arc<dyn HealthCheck>>,
    unhealthy: UnhealthySender,
    unhealthy_rx: Option<mpsc::Receiver<String>>,
    cancellation_token: CancellationToken,
    server: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
    background: Vec<JoinHandle<()>>,
    state: PluginState,
}

impl RcudaDevicePlugin {
    pub fn new(
        settings: PluginSettings,
        devices: DeviceSet,
        health_check: Option<Arc<dyn HealthCheck>>,
    ) -> Self {
        let (unhealthy, unhealthy_rx) = UnhealthySender::channel(32);
        Self {
            settings,
            devices: DeviceState::new(devices),
            health_check,
            unhealthy,
            unhealthy_rx: Some(unhealthy_rx),
            cancellation_token: CancellationToken::new(),
            server: None,
            background: Vec::new(),
            state: PluginState::Created,
        }
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn devices(&self) -> &Arc<DeviceState> {
        &self.devices
    }

    pub fn socket_path(&self) -> &Path {
        &self.settings.socket_path
    }

    /// Handle for reporting devices as unhealthy.
    pub fn unhealthy_sender(&self) -> UnhealthySender {
        self.unhealthy.clone()
    }

    /// Binds the plugin socket and serves the device plugin API on it.
    ///
    /// Returns once a test connection to the socket succeeded. On failure the
    /// session is left stopped with no socket behind.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != PluginState::Created {
            anyhow::bail!("device plugin session already used ({})", self.state);
        }
        self.state = PluginState::Starting;

        if let Err(e) = self.start_listener().await {
            if let Err(stop_err) = self.stop().await {
                warn!("failed to clean up after start failure: {stop_err:#}");
            }
            self.state = PluginState::Stopped;
            return Err(e);
        }
        self.spawn_background_tasks().await;
        Ok(())
    }

    async fn start_listener(&mut self) -> Result<()> {
        let socket_path = self.settings.socket_path.clone();
        info!("start device plugin server: {}", socket_path.display());

        cleanup(&socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;

        let service =
            DevicePluginService::new(self.devices.clone(), self.cancellation_token.clone());
        let cancellation_token = self.cancellation_token.clone();

        self.server = Some(tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        cancellation_token.cancelled().await;
                        info!("shutting down gRPC server");
                    },
                )
                .await
        }));

        // Wait for the server to accept connections before declaring success
        let channel = uds::dial(&socket_path, self.settings.dial_timeout)
            .await
            .with_context(|| format!("device plugin socket {} not serving", socket_path.display()))?;
        drop(channel);

        info!("gRPC server is bound to: {}", socket_path.display());
        Ok(())
    }

    async fn spawn_background_tasks(&mut self) {
        if let Some(rx) = self.unhealthy_rx.take() {
            self.background.push(tokio::spawn(consume_unhealthy(
                self.devices.clone(),
                rx,
                self.cancellation_token.clone(),
            )));
        }

        if let Some(health_check) = &self.health_check {
            let devices = self.devices.read().await.ids();
            self.background.push(tokio::spawn(health_check.run(
                devices,
                self.unhealthy.clone(),
                self.cancellation_token.clone(),
            )));
        }
    }

    /// Registers the plugin for its resource name with the kubelet.
    pub async fn register(&self) -> Result<()> {
        let kubelet_socket = &self.settings.kubelet_socket;
        info!(
            "registering device plugin with kubelet: {}",
            kubelet_socket.display()
        );

        let endpoint = self
            .settings
            .socket_path
            .file_name()
            .with_context(|| {
                format!(
                    "plugin socket {} has no file name",
                    self.settings.socket_path.display()
                )
            })?
            .to_string_lossy()
            .into_owned();

        let channel = uds::dial(kubelet_socket, self.settings.dial_timeout).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: device_plugin_pb::VERSION.to_string(),
            endpoint,
            resource_name: self.settings.resource_name.clone(),
            options: Some(plugin_options()),
        };

        client.register(Request::new(request)).await.map_err(|status| {
            anyhow::anyhow!(
                "kubelet {} rejected registration of {}: {status}",
                kubelet_socket.display(),
                self.settings.resource_name
            )
        })?;
        Ok(())
    }

    /// Starts the plugin and registers it with the kubelet.
    ///
    /// A failed registration stops the plugin again.
    pub async fn serve(&mut self) -> Result<()> {
        if let Err(e) = self.start().await {
            error!("could not start device plugin: {e:#}");
            return Err(e);
        }
        info!("starting to serve on {}", self.settings.socket_path.display());

        if let Err(e) = self.register().await {
            error!("could not register device plugin: {e:#}");
            if let Err(stop_err) = self.stop().await {
                warn!("failed to stop device plugin: {stop_err:#}");
            }
            return Err(e);
        }
        info!("registered device plugin with kubelet");

        self.state = PluginState::Serving;
        Ok(())
    }

    /// Stops serving and removes the socket. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut server) = self.server.take() else {
            return Ok(());
        };
        self.state = PluginState::Stopping;
        info!("stopping device plugin on {}", self.settings.socket_path.display());

        self.cancellation_token.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("gRPC server exited with error: {e}"),
            Ok(Err(e)) => warn!("gRPC server task failed: {e}"),
            Err(_) => {
                warn!("gRPC server did not stop within {SHUTDOWN_TIMEOUT:?}, aborting");
                server.abort();
            }
        }
        for task in self.background.drain(..) {
            task.abort();
        }

        cleanup(&self.settings.socket_path).with_context(|| {
            format!(
                "failed to remove socket {}",
                self.settings.socket_path.display()
            )
        })?;
        self.state = PluginState::Stopped;
        Ok(())
    }
}

/// Removes the socket file; a missing file is fine.
fn cleanup(socket_path: &Path) -> io::Result<()> {
    match std::fs::remove_file(socket_path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
