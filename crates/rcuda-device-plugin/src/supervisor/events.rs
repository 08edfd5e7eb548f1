//! Producers feeding the supervisor's event queue.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::supervisor::SupervisorEvent;

/// Watches the device plugin directory for the kubelet socket being created.
///
/// The returned watcher must be kept alive for events to keep flowing.
pub fn watch_kubelet_socket(
    plugin_dir: &Path,
    kubelet_socket: &Path,
    events: mpsc::Sender<SupervisorEvent>,
) -> Result<RecommendedWatcher> {
    let kubelet_socket = kubelet_socket.to_path_buf();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) if is_socket_created(&event, &kubelet_socket) => {
                    SupervisorEvent::KubeletRestarted
                }
                Ok(event) => {
                    debug!("Filesystem event: {:?}", event);
                    return;
                }
                Err(e) => SupervisorEvent::WatchError(e.to_string()),
            };
            // Runs on the watcher's own thread, outside of the runtime
            if events.blocking_send(event).is_err() {
                debug!("supervisor gone, dropping filesystem event");
            }
        },
        Config::default(),
    )
    .context("failed to create filesystem watcher")?;

    watcher
        .watch(plugin_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", plugin_dir.display()))?;

    Ok(watcher)
}

fn is_socket_created(event: &Event, kubelet_socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|p| p == kubelet_socket)
}

/// Forwards SIGHUP as a reload and SIGINT, SIGTERM and SIGQUIT as termination.
///
/// The forwarder exits after the first termination signal.
pub fn forward_signals(events: mpsc::Sender<SupervisorEvent>) -> Result<JoinHandle<()>> {
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = sighup.recv() => SupervisorEvent::Reload,
                _ = sigint.recv() => SupervisorEvent::Terminate("SIGINT"),
                _ = sigterm.recv() => SupervisorEvent::Terminate("SIGTERM"),
                _ = sigquit.recv() => SupervisorEvent::Terminate("SIGQUIT"),
            };
            let terminal = matches!(event, SupervisorEvent::Terminate(_));
            if events.send(event).await.is_err() || terminal {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use notify::event::CreateKind;
    use notify::event::ModifyKind;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn only_kubelet_socket_creation_counts() {
        let socket = PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock");

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(socket.clone());
        let other = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/var/lib/kubelet/device-plugins/qnib-rcuda.sock"));
        let modified =
            Event::new(EventKind::Modify(ModifyKind::Any)).add_path(socket.clone());

        assert!(is_socket_created(&created, &socket));
        assert!(!is_socket_created(&other, &socket));
        assert!(!is_socket_created(&modified, &socket));
    }

    #[test(tokio::test)]
    async fn reports_kubelet_socket_creation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("kubelet.sock");
        let (tx, mut rx) = mpsc::channel(8);

        let _watcher = watch_kubelet_socket(dir.path(), &socket, tx).expect("watcher");
        std::fs::write(dir.path().join("unrelated.sock"), b"").expect("write");
        std::fs::write(&socket, b"").expect("write");

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert_eq!(event, SupervisorEvent::KubeletRestarted);
    }

    #[test]
    fn watching_a_missing_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing");
        let (tx, _rx) = mpsc::channel(1);

        assert!(watch_kubelet_socket(&missing, &missing.join("kubelet.sock"), tx).is_err());
    }
}
