use std::sync::Arc;

use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::sync::RwLockReadGuard;
use tracing::info;
use tracing::warn;

use crate::device::DeviceSet;

/// Live device set of a plugin session.
///
/// Streams and allocations read it concurrently; only the unhealthy-signal
/// consumer writes to it. Every effective change bumps a generation counter
/// that `ListAndWatch` streams wait on.
#[derive(Debug)]
pub struct DeviceState {
    devices: RwLock<DeviceSet>,
    generation: watch::Sender<u64>,
}

impl DeviceState {
    pub fn new(devices: DeviceSet) -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            devices: RwLock::new(devices),
            generation,
        })
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, DeviceSet> {
        self.devices.read().await
    }

    pub async fn snapshot(&self) -> DeviceSet {
        self.devices.read().await.clone()
    }

    /// Receiver that is notified after every health change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Flips a device to unhealthy, notifying subscribers only when the
    /// health actually changed.
    pub(crate) async fn mark_unhealthy(&self, id: &str) -> bool {
        let changed = {
            let mut devices = self.devices.write().await;
            devices.mark_unhealthy(id)
        };

        match changed {
            Some(true) => {
                info!(device = id, "device marked unhealthy");
                self.generation.send_modify(|g| *g += 1);
                true
            }
            Some(false) => false,
            None => {
                warn!(device = id, "unhealthy signal for unknown device ignored");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::device::Device;
    use crate::device::Health;

    fn state() -> Arc<DeviceState> {
        DeviceState::new(DeviceSet::from_iter([
            Device::on_host("h1", "0"),
            Device::on_host("h1", "1"),
        ]))
    }

    #[test(tokio::test)]
    async fn notifies_only_on_effective_changes() {
        let state = state();
        let mut changes = state.subscribe();

        assert!(state.mark_unhealthy("h1:0").await);
        assert!(changes.has_changed().expect("sender alive"));
        changes.borrow_and_update();

        assert!(!state.mark_unhealthy("h1:0").await);
        assert!(!state.mark_unhealthy("h9:0").await);
        assert!(!changes.has_changed().expect("sender alive"));

        let snapshot = state.snapshot().await;
        assert_eq!(
            snapshot.get("h1:0").map(Device::health),
            Some(Health::Unhealthy)
        );
        assert_eq!(
            snapshot.get("h1:1").map(Device::health),
            Some(Health::Healthy)
        );
    }
}
