use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use tracing::info;

use crate::config::DeviceSourceArgs;
use crate::device::DeviceDirectory;
use crate::device::DeviceSet;
use crate::device::RegistryError;
use crate::device::StaticDescriptor;

/// Where the advertised devices come from.
///
/// Every [`resolve`](Self::resolve) reads the source again, so a restarted
/// plugin always starts from a fresh snapshot.
#[derive(Debug, Clone)]
pub enum DeviceRegistry {
    Static(PathBuf),
    Directory(DeviceDirectory),
}

impl DeviceRegistry {
    pub fn from_args(args: &DeviceSourceArgs) -> Result<Self, Report<RegistryError>> {
        match &args.etcd_endpoint {
            Some(endpoint) => Ok(Self::Directory(DeviceDirectory::new(
                endpoint,
                Duration::from_millis(args.etcd_timeout_ms),
            )?)),
            None => Ok(Self::Static(args.device_config.clone())),
        }
    }

    pub async fn resolve(&self) -> Result<DeviceSet, Report<RegistryError>> {
        let devices = match self {
            DeviceRegistry::Static(path) => {
                info!("Loading device descriptor '{}'", path.display());
                StaticDescriptor::load(path).await?.resolve()?
            }
            DeviceRegistry::Directory(directory) => {
                info!("Fetching devices from {}", directory.endpoint());
                directory.resolve().await?
            }
        };
        info!(count = devices.len(), "resolved devices");
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn static_registry_rereads_the_descriptor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.yaml");
        std::fs::write(&path, "devices:\n  hosts: h1\n  h1: \"0\"\n").expect("write");

        let registry = DeviceRegistry::from_args(&DeviceSourceArgs {
            device_config: path.clone(),
            etcd_endpoint: None,
            etcd_timeout_ms: 1000,
        })
        .expect("registry");
        assert_eq!(registry.resolve().await.expect("resolve").ids(), vec!["h1:0"]);

        std::fs::write(&path, "devices:\n  hosts: h1,h2\n  h1: \"0\"\n  h2: \"5\"\n")
            .expect("write");
        assert_eq!(
            registry.resolve().await.expect("resolve").ids(),
            vec!["h1:0", "h2:5"]
        );
    }

    #[test]
    fn etcd_endpoint_selects_the_directory() {
        let registry = DeviceRegistry::from_args(&DeviceSourceArgs {
            device_config: PathBuf::from("/nonexistent"),
            etcd_endpoint: Some("http://127.0.0.1:2379".to_string()),
            etcd_timeout_ms: 1000,
        })
        .expect("registry");

        assert!(matches!(
            registry,
            DeviceRegistry::Directory(ref d) if d.endpoint() == "http://127.0.0.1:2379"
        ));
    }
}
