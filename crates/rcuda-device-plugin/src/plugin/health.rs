use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::plugin::DeviceState;

/// Hook for device health polling.
///
/// An implementation receives the advertised device ids and reports failing
/// devices through the [`UnhealthySender`]. It runs as its own task for the
/// lifetime of a plugin session and must return once the token is cancelled.
pub trait HealthCheck: fmt::Debug + Send + Sync {
    fn run(
        &self,
        devices: Vec<String>,
        unhealthy: UnhealthySender,
        cancellation_token: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}

/// Default hook: remote devices are never probed, so they never report failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHealthCheck;

impl HealthCheck for NoopHealthCheck {
    fn run(
        &self,
        devices: Vec<String>,
        _unhealthy: UnhealthySender,
        _cancellation_token: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            debug!(
                devices = devices.len(),
                "health polling is not implemented for remote devices"
            );
        })
    }
}

/// Submits unhealthy-device signals to a plugin session.
///
/// Signals from one sender are applied in order.
#[derive(Debug, Clone)]
pub struct UnhealthySender {
    tx: mpsc::Sender<String>,
}

impl UnhealthySender {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn unhealthy(&self, device_id: impl Into<String>) -> Result<()> {
        self.tx
            .send(device_id.into())
            .await
            .map_err(|e| anyhow::anyhow!("device plugin stopped, dropping unhealthy signal for {}", e.0))
    }
}

/// Applies unhealthy signals to the live device set until the session stops.
pub(crate) async fn consume_unhealthy(
    state: Arc<DeviceState>,
    mut signals: mpsc::Receiver<String>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(id) => {
                    state.mark_unhealthy(&id).await;
                }
                None => break,
            },
        }
    }
    info!("unhealthy signal consumer stopped");
}
