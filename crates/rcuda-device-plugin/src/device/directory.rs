//! Device directory kept in etcd (v2 keys API).
//!
//! Each device is a key `/rcuda/<host>/<deviceId>` whose value is an opaque
//! state string written by whoever manages the remote hosts. Any key under
//! the prefix counts as an advertised device.

use std::collections::BTreeMap;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Device;
use crate::device::DeviceSet;
use crate::device::RegistryError;

pub const PREFIX: &str = "/rcuda";

/// etcd error code for "Key not found".
const KEY_NOT_FOUND: u64 = 100;

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Node,
}

#[derive(Debug, Deserialize)]
struct Node {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<Node>,
}

#[derive(Debug, Deserialize)]
struct EtcdError {
    #[serde(rename = "errorCode")]
    error_code: u64,
    message: String,
}

/// Client for the `/rcuda` directory of an etcd cluster.
#[derive(Debug, Clone)]
pub struct DeviceDirectory {
    client: reqwest::Client,
    endpoint: String,
}

impl DeviceDirectory {
    /// `endpoint` is the etcd client URL, e.g. `http://127.0.0.1:2379`.
    /// `timeout` bounds every request so an unavailable member fails fast.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, Report<RegistryError>> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .change_context(RegistryError::DirectoryUnavailable {
                message: "failed to build HTTP client".to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.endpoint, key)
    }

    /// Writes `/rcuda/<host>/<deviceId> = state`.
    pub async fn set_device(
        &self,
        host: &str,
        device_id: &str,
        state: &str,
    ) -> Result<(), Report<RegistryError>> {
        let key = device_key(host, device_id);
        info!("Setting '{key}' key with '{state}' value");

        let response = self
            .client
            .put(self.url(&key))
            .form(&[("value", state)])
            .send()
            .await
            .change_context_lazy(|| RegistryError::DirectoryUnavailable {
                message: format!("PUT {key} on {}", self.endpoint),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Report::new(RegistryError::DirectoryUnavailable {
                message: format!("PUT {key} returned {status}: {body}"),
            }));
        }
        debug!(key, %status, "set is done");
        Ok(())
    }

    /// Recursively lists every leaf under the prefix, sorted by key.
    pub async fn get_devices(&self) -> Result<BTreeMap<String, String>, Report<RegistryError>> {
        let response = self
            .client
            .get(self.url(PREFIX))
            .query(&[("recursive", "true"), ("sorted", "true")])
            .send()
            .await
            .change_context_lazy(|| RegistryError::DirectoryUnavailable {
                message: format!("GET {PREFIX} on {}", self.endpoint),
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body: Option<EtcdError> = response.json().await.ok();
            return match body {
                Some(err) if err.error_code != KEY_NOT_FOUND => {
                    Err(Report::new(RegistryError::DirectoryMalformed {
                        message: format!("GET {PREFIX}: {}", err.message),
                    }))
                }
                _ => Err(Report::new(RegistryError::DirectoryMissing {
                    prefix: PREFIX.to_string(),
                })),
            };
        }
        if !status.is_success() {
            return Err(Report::new(RegistryError::DirectoryUnavailable {
                message: format!("GET {PREFIX} returned {status}"),
            }));
        }

        let body: KeysResponse =
            response
                .json()
                .await
                .change_context(RegistryError::DirectoryMalformed {
                    message: format!("GET {PREFIX} returned an unreadable body"),
                })?;

        let mut devices = BTreeMap::new();
        collect_leaves(body.node, &mut devices);
        for (key, value) in &devices {
            debug!("Key: {key:?}, Value: {value:?}");
        }
        Ok(devices)
    }

    /// Every entry under the prefix becomes a healthy device, whatever its value.
    pub async fn resolve(&self) -> Result<DeviceSet, Report<RegistryError>> {
        let entries = self.get_devices().await?;

        let mut devices = DeviceSet::new();
        for key in entries.keys() {
            let Some(device) = device_from_key(key) else {
                warn!(key, "ignoring key outside of {PREFIX}");
                continue;
            };
            devices.push(device);
        }
        Ok(devices)
    }
}

pub fn device_key(host: &str, device_id: &str) -> String {
    format!(
        "{PREFIX}/{}/{}",
        host.trim_matches('/'),
        device_id.trim_matches('/')
    )
}

fn collect_leaves(node: Node, out: &mut BTreeMap<String, String>) {
    if node.dir || !node.nodes.is_empty() {
        for child in node.nodes {
            collect_leaves(child, out);
        }
    } else {
        out.insert(node.key, node.value.unwrap_or_default());
    }
}

/// Maps `/rcuda/<host>/<deviceId>` to a `<host>:<deviceId>` device.
///
/// Deeper keys keep every intermediate segment in the host part. A key
/// directly below the prefix has no host and is advertised by its bare id.
fn device_from_key(key: &str) -> Option<Device> {
    let relative = key.strip_prefix(PREFIX)?.trim_matches('/');
    if relative.is_empty() {
        return None;
    }
    match relative.rsplit_once('/') {
        Some((host, device_id)) => Some(Device::on_host(host, device_id)),
        None => {
            warn!(key, "device key has no host segment");
            Some(Device::new(relative))
        }
    }
}
