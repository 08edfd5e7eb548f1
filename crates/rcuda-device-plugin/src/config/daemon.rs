use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::devices::DeviceSourceArgs;
use crate::plugin::PluginSettings;

/// Directory where the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// Socket name the kubelet listens on for registrations, inside [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub devices: DeviceSourceArgs,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEVICE_PLUGIN_PATH,
        help = "Kubelet device plugin directory, watched for kubelet restarts"
    )]
    pub plugin_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket (defaults to <plugin-dir>/kubelet.sock)"
    )]
    pub kubelet_socket: Option<PathBuf>,

    #[arg(
        long,
        env = "RCUDA_VENDOR",
        default_value = "qnib",
        help = "Vendor prefix of the plugin socket, <plugin-dir>/<vendor>-rcuda.sock"
    )]
    pub vendor: String,

    #[arg(
        long,
        env = "RCUDA_RESOURCE_NAME",
        default_value = "qnib.org/rcuda",
        help = "Extended resource name advertised to the kubelet"
    )]
    pub resource_name: String,

    #[arg(
        long,
        default_value = "5",
        help = "Timeout in seconds for dialing the plugin and kubelet sockets"
    )]
    pub dial_timeout_secs: u64,

    #[arg(
        long,
        help = "Disable the device health-check hook",
        default_value_t = false,
        env = "DP_DISABLE_HEALTHCHECKS",
        action = clap::ArgAction::Set
    )]
    pub disable_healthchecks: bool,
}

impl DaemonArgs {
    pub fn plugin_socket(&self) -> PathBuf {
        self.plugin_dir.join(format!("{}-rcuda.sock", self.vendor))
    }

    pub fn kubelet_socket(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join(KUBELET_SOCKET_NAME))
    }
}

impl From<&DaemonArgs> for PluginSettings {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            socket_path: args.plugin_socket(),
            kubelet_socket: args.kubelet_socket(),
            resource_name: args.resource_name.clone(),
            dial_timeout: Duration::from_secs(args.dial_timeout_secs),
        }
    }
}
