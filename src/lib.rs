//! Client-side virtual-ethernet tunnel engine.
//!
//! The engine sits between a TAP-style virtual interface and a remote
//! tunnel peer: the [`switcher`] classifies frames read off the device
//! and emulates the tunnel gateway, the [`exchanger`] multiplexes NAT
//! traffic, UDP datagram ports, reverse port mappings and keep-alive
//! over one logical transmission. The TAP driver, the wire framing and
//! the OS route plumbing are collaborators behind small traits.

pub mod client;
pub mod config;
pub mod error;
pub mod exchanger;
pub mod packet;
pub mod platform;
pub mod protocol;
pub mod route;
pub mod switcher;
pub mod tap;
pub mod transmission;

// Re-export main types
pub use client::Client;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use exchanger::{Exchanger, NetworkState};
pub use switcher::NetworkSwitcher;

// Default configuration constants
pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_PORT: u16 = 20000;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 10;
