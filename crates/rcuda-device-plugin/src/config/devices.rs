use std::path::PathBuf;

use clap::Args;

/// Selects the device source: the etcd directory when an endpoint is given,
/// the static descriptor file otherwise.
#[derive(Args, Debug, Clone)]
pub struct DeviceSourceArgs {
    #[arg(
        long,
        env = "RCUDA_DEVICE_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/rcuda-device-plugin/devices.yaml",
        help = "Path of the static device descriptor, e.g. /etc/rcuda-device-plugin/devices.yaml"
    )]
    pub device_config: PathBuf,

    #[arg(
        long,
        env = "RCUDA_ETCD_ENDPOINT",
        help = "etcd client URL holding the /rcuda device directory, e.g. http://127.0.0.1:2379"
    )]
    pub etcd_endpoint: Option<String>,

    #[arg(
        long,
        env = "RCUDA_ETCD_TIMEOUT_MS",
        default_value = "1000",
        help = "Per-request timeout for etcd in milliseconds"
    )]
    pub etcd_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SetDeviceArgs {
    #[arg(
        long,
        env = "RCUDA_ETCD_ENDPOINT",
        default_value = "http://127.0.0.1:2379",
        help = "etcd client URL"
    )]
    pub etcd_endpoint: String,

    #[arg(
        long,
        env = "RCUDA_ETCD_TIMEOUT_MS",
        default_value = "1000",
        help = "Per-request timeout for etcd in milliseconds"
    )]
    pub etcd_timeout_ms: u64,

    #[arg(long, help = "Remote host serving the device")]
    pub host: String,

    #[arg(long, help = "Device id on the remote host")]
    pub device_id: String,

    #[arg(long, default_value = "healthy", help = "State recorded for the device")]
    pub state: String,
}
