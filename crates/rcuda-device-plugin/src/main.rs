use anyhow::Result;
use clap::Parser;

use rcuda_device_plugin::app;
use rcuda_device_plugin::config::Cli;
use rcuda_device_plugin::config::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    utils::logging::init();
    app::init_error_reporting();

    match cli.command {
        Commands::Daemon(daemon_args) => app::run_daemon(*daemon_args).await,
        Commands::SetDevice(set_device_args) => app::set_device(set_device_args).await,
        Commands::ListDevices(device_source_args) => app::list_devices(device_source_args).await,
    }
}
