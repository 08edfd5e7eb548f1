//! Lifecycle supervisor of the device plugin.
//!
//! A single loop owns the active [`RcudaDevicePlugin`]. It (re)starts the
//! plugin when a restart is pending and otherwise waits for the next
//! [`SupervisorEvent`]. Failed starts are only retried on the next event.

pub mod events;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device::DeviceRegistry;
use crate::plugin::HealthCheck;
use crate::plugin::PluginSettings;
use crate::plugin::RcudaDevicePlugin;

/// Inputs of the supervisor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The kubelet socket was (re)created, the kubelet restarted.
    KubeletRestarted,
    /// SIGHUP
    Reload,
    /// Any other handled signal, carrying its name.
    Terminate(&'static str),
    /// The filesystem watcher reported an error.
    WatchError(String),
}

pub struct Supervisor {
    registry: DeviceRegistry,
    settings: PluginSettings,
    health_check: Option<Arc<dyn HealthCheck>>,
    plugin: Option<RcudaDevicePlugin>,
}

impl Supervisor {
    pub fn new(
        registry: DeviceRegistry,
        settings: PluginSettings,
        health_check: Option<Arc<dyn HealthCheck>>,
    ) -> Self {
        Self {
            registry,
            settings,
            health_check,
            plugin: None,
        }
    }

    /// The plugin session started by the last restart, if it is still around.
    pub fn plugin(&self) -> Option<&RcudaDevicePlugin> {
        self.plugin.as_ref()
    }

    /// Runs until a terminate event arrives or all event senders are gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<SupervisorEvent>) -> Result<()> {
        let mut restart = true;

        loop {
            if restart {
                restart = !self.restart().await;
            }

            let Some(event) = events.recv().await else {
                info!("event sources closed, shutting down");
                break;
            };

            match event {
                SupervisorEvent::KubeletRestarted => {
                    info!(
                        "inotify: {} created, restarting.",
                        self.settings.kubelet_socket.display()
                    );
                    restart = true;
                }
                SupervisorEvent::Reload => {
                    info!("Received SIGHUP, restarting.");
                    restart = true;
                }
                SupervisorEvent::Terminate(signal) => {
                    info!("Received signal \"{signal}\", shutting down.");
                    break;
                }
                SupervisorEvent::WatchError(e) => warn!("inotify: {e}"),
            }
        }

        self.stop_plugin().await
    }

    /// Replaces the current plugin with a freshly resolved one.
    ///
    /// Returns true once the new plugin is registered with the kubelet.
    async fn restart(&mut self) -> bool {
        if let Err(e) = self.stop_plugin().await {
            error!("failed to stop previous device plugin: {e:#}");
        }

        let devices = match self.registry.resolve().await {
            Ok(devices) => devices,
            Err(report) => {
                error!(
                    configuration = report.current_context().is_configuration(),
                    "could not resolve devices, waiting for the next restart event: {report:?}"
                );
                return false;
            }
        };

        let mut plugin =
            RcudaDevicePlugin::new(self.settings.clone(), devices, self.health_check.clone());
        match plugin.serve().await {
            Ok(()) => {
                self.plugin = Some(plugin);
                true
            }
            Err(e) => {
                error!(
                    "Could not contact Kubelet at {}, retrying on the next kubelet restart or SIGHUP. Did you enable the device plugin feature gate? {e:#}",
                    self.settings.kubelet_socket.display()
                );
                false
            }
        }
    }

    async fn stop_plugin(&mut self) -> Result<()> {
        match self.plugin.take() {
            Some(mut plugin) => plugin.stop().await,
            None => Ok(()),
        }
    }
}
