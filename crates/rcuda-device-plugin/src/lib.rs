pub mod app;
pub mod config;
pub mod device;
pub mod plugin;
pub mod supervisor;
