//! Configuration module for pivot-netstack
//!
//! # Example
//!
//! ```no_run
//! use pivot_netstack::config::load_config;
//!
//! let config = load_config("/etc/pivot-netstack/config.json").unwrap();
//! println!("Interface: {}", config.stack.interface_name);
//! ```

mod loader;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, LogConfig, RelayConfig, StackSettings, MAX_INFLIGHT, MAX_INTERFACE_NAME_LEN,
};
