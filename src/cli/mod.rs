pub mod args;
pub mod config;

pub use args::{Args, Command};
pub use config::{ConfigDiscovery, FileConfig};
