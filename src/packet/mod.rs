//! Wire-format parsing and synthesis for the virtual-interface packet path.
//!
//! Frames are parsed fresh per packet; the only in-place mutation the
//! switcher performs is the TTL decrement on a parsed [`IpFrame`] before a
//! forwarding decision that depends on it.

pub mod checksum;
mod icmp;
mod ip;
mod udp;

pub use icmp::{IcmpFrame, IcmpType};
pub use ip::{IpFrame, IpProtocol};
pub use udp::UdpFrame;
