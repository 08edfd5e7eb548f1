//! Static per-host device descriptors.
//!
//! The descriptor file is a YAML document with a `devices` mapping:
//!
//! ```yaml
//! devices:
//!   hosts: "gpu-a,gpu-b"
//!   gpu-a: "0,1"
//!   gpu-b: "0"
//! ```
//!
//! `hosts` lists the remote hosts, every host then lists its device ids.
//! INI descriptors with a `[devices]` section are not read; their keys move
//! unchanged under the `devices` mapping.

use std::collections::BTreeMap;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tracing::debug;
use tracing::warn;

use crate::device::Device;
use crate::device::DeviceSet;
use crate::device::RegistryError;

const HOSTS_KEY: &str = "hosts";

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    devices: BTreeMap<String, serde_yaml::Value>,
}

/// Parsed descriptor entries, keyed by `hosts` or a host name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticDescriptor {
    entries: BTreeMap<String, String>,
}

impl StaticDescriptor {
    pub async fn load(path: &Path) -> Result<Self, Report<RegistryError>> {
        let content = tokio::fs::read_to_string(path).await.change_context_lazy(|| {
            RegistryError::DescriptorUnreadable {
                message: format!("cannot read {}", path.display()),
            }
        })?;
        Self::from_yaml(&content).attach_printable_lazy(|| format!("path: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self, Report<RegistryError>> {
        let file: DescriptorFile =
            serde_yaml::from_str(content).change_context(RegistryError::DescriptorMalformed {
                message: "expected a `devices` mapping".to_string(),
            })?;

        let mut entries = BTreeMap::new();
        for (key, value) in file.devices {
            let value = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                other => {
                    return Err(Report::new(RegistryError::DescriptorMalformed {
                        message: format!("value of `{key}` must be a comma-separated list, got {other:?}"),
                    }));
                }
            };
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    pub fn from_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Expands every listed host into its `<host>:<deviceId>` devices.
    pub fn resolve(&self) -> Result<DeviceSet, Report<RegistryError>> {
        let hosts = self.entries.get(HOSTS_KEY).ok_or_else(|| {
            Report::new(RegistryError::DescriptorMalformed {
                message: "no key 'hosts' holding a list of hosts with remote GPUs".to_string(),
            })
        })?;

        let mut devices = DeviceSet::new();
        for host in split_list(hosts) {
            let ids = self.entries.get(host).ok_or_else(|| {
                Report::new(RegistryError::DescriptorMalformed {
                    message: format!("no key '{host}' holding a list of device IDs"),
                })
            })?;

            for device_id in split_list(ids) {
                let device = Device::on_host(host, device_id);
                debug!(device = device.id(), "add device");
                if !devices.push(device) {
                    warn!(host, device_id, "duplicate device in descriptor, skipping");
                }
            }
        }
        Ok(devices)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}
