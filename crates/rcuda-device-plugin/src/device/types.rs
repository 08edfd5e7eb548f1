use device_plugin_pb::api;

/// Health of an advertised device, as reported to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Health {
    #[display("{}", device_plugin_pb::HEALTHY)]
    Healthy,
    #[display("{}", device_plugin_pb::UNHEALTHY)]
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => device_plugin_pb::HEALTHY,
            Health::Unhealthy => device_plugin_pb::UNHEALTHY,
        }
    }
}

/// A remote CUDA device, identified as `<host>:<deviceId>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    id: String,
    health: Health,
}

impl Device {
    /// Every resolved device starts out healthy.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            health: Health::Healthy,
        }
    }

    pub fn on_host(host: &str, device_id: &str) -> Self {
        Self::new(device_id_for(host, device_id))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn health(&self) -> Health {
        self.health
    }

    /// Returns true if the health actually changed.
    fn mark_unhealthy(&mut self) -> bool {
        let changed = self.health == Health::Healthy;
        self.health = Health::Unhealthy;
        changed
    }
}

impl From<&Device> for api::Device {
    fn from(device: &Device) -> Self {
        api::Device {
            id: device.id.clone(),
            health: device.health.as_str().to_string(),
            topology: None,
        }
    }
}

/// Composes the kubelet-visible identifier of a device on a remote host.
pub fn device_id_for(host: &str, device_id: &str) -> String {
    format!("{host}:{device_id}")
}

/// Ordered set of devices, unique by identifier.
///
/// Order is insertion order and stays stable for the lifetime of the set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a device, returning false (and leaving the set untouched) when
    /// a device with the same identifier is already present.
    pub fn push(&mut self, device: Device) -> bool {
        if device_exists(self, device.id()) {
            return false;
        }
        self.devices.push(device);
        true
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Downgrades a device to unhealthy.
    ///
    /// Returns `None` for an unknown id, otherwise whether the health changed.
    /// There is no way back to healthy.
    pub fn mark_unhealthy(&mut self, id: &str) -> Option<bool> {
        self.devices
            .iter_mut()
            .find(|d| d.id == id)
            .map(Device::mark_unhealthy)
    }

    pub fn ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.id.clone()).collect()
    }

    pub fn to_api(&self) -> Vec<api::Device> {
        self.devices.iter().map(api::Device::from).collect()
    }
}

impl FromIterator<Device> for DeviceSet {
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        let mut set = DeviceSet::new();
        for device in iter {
            set.push(device);
        }
        set
    }
}

impl<'a> IntoIterator for &'a DeviceSet {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Linear membership check used to validate allocation requests.
pub fn device_exists(devices: &DeviceSet, id: &str) -> bool {
    devices.iter().any(|d| d.id == id)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn sample_set() -> DeviceSet {
        let mut set = DeviceSet::new();
        set.push(Device::on_host("h1", "0"));
        set.push(Device::on_host("h1", "1"));
        set.push(Device::on_host("h2", "0"));
        set
    }

    #[test]
    fn device_exists_matches_exact_ids_only() {
        let set = sample_set();

        assert!(device_exists(&set, "h1:0"));
        assert!(device_exists(&set, "h2:0"));
        assert!(!device_exists(&set, ""));
        assert!(!device_exists(&set, "h3:0"));
        assert!(!device_exists(&set, "h2:1"));
        assert!(!device_exists(&set, "0"));
        assert!(!device_exists(&DeviceSet::new(), "h1:0"));
    }

    #[test]
    fn push_rejects_duplicates_and_keeps_order() {
        let mut set = sample_set();

        assert!(!set.push(Device::on_host("h1", "1")));
        assert_eq!(set.ids(), vec!["h1:0", "h1:1", "h2:0"]);
    }

    #[test]
    fn mark_unhealthy_is_monotonic() {
        let mut set = sample_set();

        assert_eq!(set.mark_unhealthy("h1:1"), Some(true));
        assert_eq!(set.mark_unhealthy("h1:1"), Some(false));
        assert_eq!(set.mark_unhealthy("nope"), None);

        let health: Vec<_> = set.iter().map(Device::health).collect();
        assert_eq!(
            health,
            vec![Health::Healthy, Health::Unhealthy, Health::Healthy]
        );
    }

    #[test]
    fn converts_to_kubelet_devices() {
        let mut set = sample_set();
        set.mark_unhealthy("h2:0");

        let devices = set.to_api();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].id, "h1:0");
        assert_eq!(devices[0].health, "Healthy");
        assert_eq!(devices[2].health, "Unhealthy");
        assert!(devices.iter().all(|d| d.topology.is_none()));
    }
}
