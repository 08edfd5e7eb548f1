//! Resolution of the devices this plugin advertises.
//!
//! Devices come either from a static descriptor file or from the `/rcuda`
//! directory in etcd. See [`DeviceRegistry`].

pub mod descriptor;
pub mod directory;
mod error;
mod registry;
mod types;

pub use descriptor::StaticDescriptor;
pub use directory::DeviceDirectory;
pub use error::RegistryError;
pub use registry::DeviceRegistry;
pub use types::device_exists;
pub use types::device_id_for;
pub use types::Device;
pub use types::DeviceSet;
pub use types::Health;
