use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::devices::{DeviceSourceArgs, SetDeviceArgs};

/// Kubernetes device plugin advertising remote CUDA (rCUDA) devices
#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(Box<DaemonArgs>),
    /// Register a device in the etcd device directory
    #[command(name = "set-device")]
    SetDevice(SetDeviceArgs),
    /// Print the devices the daemon would advertise
    #[command(name = "list-devices")]
    ListDevices(DeviceSourceArgs),
}
