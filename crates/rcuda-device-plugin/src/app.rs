//! Entry points of the command line front end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use error_stack::fmt::ColorMode;
use error_stack::Report;
use tokio::sync::mpsc;
use utils::version;

use crate::config::DaemonArgs;
use crate::config::DeviceSourceArgs;
use crate::config::SetDeviceArgs;
use crate::device::DeviceDirectory;
use crate::device::DeviceRegistry;
use crate::device::DeviceSet;
use crate::device::RegistryError;
use crate::plugin::HealthCheck;
use crate::plugin::NoopHealthCheck;
use crate::plugin::PluginSettings;
use crate::supervisor::events;
use crate::supervisor::Supervisor;

/// Runs the device plugin until a termination signal arrives.
///
/// Without any device to advertise the daemon idles forever instead of
/// registering with the kubelet.
pub async fn run_daemon(args: DaemonArgs) -> Result<()> {
    tracing::info!("Starting rcuda device plugin {}", &**version::VERSION);

    let registry = DeviceRegistry::from_args(&args.devices).map_err(report_to_anyhow)?;

    tracing::info!("Fetching devices.");
    if let Some(devices) = initial_devices(&registry).await? {
        if devices.is_empty() {
            tracing::warn!("No devices found. Waiting indefinitely.");
            std::future::pending::<()>().await;
        }
    }

    let settings = PluginSettings::from(&args);
    let (event_tx, event_rx) = mpsc::channel(16);

    tracing::info!("Starting FS watcher.");
    let _watcher =
        events::watch_kubelet_socket(&args.plugin_dir, &settings.kubelet_socket, event_tx.clone())?;

    tracing::info!("Starting OS watcher.");
    let signals = events::forward_signals(event_tx)?;

    let health_check: Option<Arc<dyn HealthCheck>> = if args.disable_healthchecks {
        tracing::info!("device health checks disabled");
        None
    } else {
        Some(Arc::new(NoopHealthCheck))
    };

    let result = Supervisor::new(registry, settings, health_check)
        .run(event_rx)
        .await;
    signals.abort();
    result
}

/// Resolves the device set before the supervisor starts.
///
/// Configuration errors are fatal. Any other failure returns `None` and
/// leaves the retry to the supervisor's restart loop.
pub async fn initial_devices(registry: &DeviceRegistry) -> Result<Option<DeviceSet>> {
    match registry.resolve().await {
        Ok(devices) => Ok(Some(devices)),
        Err(report) if report.current_context().is_configuration() => Err(
            report_to_anyhow(report).context("cannot determine the device configuration"),
        ),
        Err(report) => {
            tracing::warn!(
                "device source unavailable, retrying on the next restart event: {report:?}"
            );
            Ok(None)
        }
    }
}

/// Renders error reports as plain text, without ANSI styling.
pub fn init_error_reporting() {
    Report::<()>::set_color_mode(ColorMode::None);
}

fn report_to_anyhow(report: Report<RegistryError>) -> anyhow::Error {
    anyhow::anyhow!("{report:?}")
}

pub async fn set_device(args: SetDeviceArgs) -> Result<()> {
    let directory = DeviceDirectory::new(
        &args.etcd_endpoint,
        Duration::from_millis(args.etcd_timeout_ms),
    )
    .map_err(report_to_anyhow)?;

    directory
        .set_device(&args.host, &args.device_id, &args.state)
        .await
        .map_err(report_to_anyhow)
}

/// Prints `<id>\t<health>` for every device the daemon would advertise.
pub async fn list_devices(args: DeviceSourceArgs) -> Result<()> {
    let registry =
        DeviceRegistry::from_args(&args).map_err(report_to_anyhow)?;
    let devices = registry
        .resolve()
        .await
        .map_err(report_to_anyhow)?;

    for device in &devices {
        println!("{}\t{}", device.id(), device.health());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;
    use test_log::test;

    use super::*;
    use crate::config::Cli;
    use crate::config::Commands;

    /// An etcd endpoint nobody listens on.
    fn unreachable_endpoint() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    fn daemon_args(args: &[&str]) -> DaemonArgs {
        let cli = Cli::try_parse_from(["rcuda-device-plugin", "daemon"].iter().chain(args))
            .expect("should parse");
        match cli.command {
            Commands::Daemon(args) => *args,
            _ => panic!("expected daemon command"),
        }
    }

    #[test(tokio::test)]
    async fn unreachable_directory_defers_to_the_supervisor() {
        let endpoint = unreachable_endpoint();
        let args = daemon_args(&["--etcd-endpoint", &endpoint]);
        let registry = DeviceRegistry::from_args(&args.devices).expect("registry");

        let devices = initial_devices(&registry).await.expect("not fatal");
        assert!(devices.is_none());
    }

    #[test(tokio::test)]
    async fn missing_descriptor_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.yaml");
        let registry = DeviceRegistry::Static(path);

        let err = initial_devices(&registry).await.expect_err("fatal");
        assert!(format!("{err:#}").contains("cannot determine the device configuration"));
    }

    #[test(tokio::test)]
    async fn daemon_keeps_running_while_directory_is_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = unreachable_endpoint();
        let plugin_dir = dir.path().to_string_lossy().into_owned();
        let args = daemon_args(&["--etcd-endpoint", &endpoint, "--plugin-dir", &plugin_dir]);

        let daemon = tokio::spawn(run_daemon(args));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!daemon.is_finished());

        daemon.abort();
        assert!(!dir.path().join("qnib-rcuda.sock").exists());
    }

    #[test]
    fn reports_render_without_ansi_styling() {
        init_error_reporting();
        let report = Report::new(RegistryError::DirectoryUnavailable {
            message: "GET /rcuda".to_string(),
        });

        let message = format!("{:#}", report_to_anyhow(report));
        assert!(message.contains("Device directory request failed: GET /rcuda"));
        assert!(!message.contains('\x1b'));
    }
}
