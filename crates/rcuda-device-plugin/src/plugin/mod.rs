//! Kubelet device plugin serving the resolved rCUDA devices.
//!
//! The main components are:
//! - [`RcudaDevicePlugin`]: one plugin session (start, register, serve, stop)
//! - [`DevicePluginService`]: the gRPC `DevicePlugin` implementation
//! - [`DeviceState`]: the live device set shared by all streams
//! - [`HealthCheck`]: hook that may report devices as unhealthy

mod health;
mod server;
mod service;
mod state;
mod uds;

pub use health::HealthCheck;
pub use health::NoopHealthCheck;
pub use health::UnhealthySender;
pub use server::PluginSettings;
pub use server::PluginState;
pub use server::RcudaDevicePlugin;
pub use service::allocate_containers;
pub use service::DevicePluginService;
pub use service::DEVICE_COUNT_ENV;
pub use service::DEVICE_ENV_PREFIX;
pub use state::DeviceState;
pub use uds::dial;
