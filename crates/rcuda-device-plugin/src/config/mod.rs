pub mod cli;
pub mod daemon;
pub mod devices;

pub use cli::*;
pub use daemon::*;
pub use devices::*;
