//! Virtual network interface boundary.
//!
//! The engine never creates or configures the TAP/TUN device; it reads the
//! device's assigned addressing and injects synthesized frames back through
//! it. Everything else about the device is the platform driver's business.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use bytes::Bytes;

/// The slice of the TAP abstraction the packet engine consumes.
pub trait TapDevice: Send + Sync {
    /// Device's assigned address.
    fn ip_address(&self) -> Ipv4Addr;

    /// Tunnel gateway address the device routes through.
    fn gateway(&self) -> Ipv4Addr;

    /// Subnet mask of the managed subnet.
    fn netmask(&self) -> Ipv4Addr;

    /// DNS servers bound to the device.
    fn dns_addresses(&self) -> Vec<Ipv4Addr>;

    /// Whether the device operates in promiscuous/shared mode.
    fn is_promisc(&self) -> bool;

    /// OS interface index, -1 when unknown.
    fn interface_index(&self) -> i32;

    /// Inject a frame back into the device for delivery to the OS.
    /// Returns false when the device rejects the frame.
    fn output(&self, frame: &[u8]) -> bool;
}

/// In-memory tap used by tests and dry-run mode: records every injected
/// frame instead of delivering it.
#[derive(Debug)]
pub struct MemoryTap {
    ip: Ipv4Addr,
    gateway: Ipv4Addr,
    netmask: Ipv4Addr,
    dns: Vec<Ipv4Addr>,
    promisc: bool,
    outputs: Mutex<Vec<Bytes>>,
}

impl MemoryTap {
    pub fn new(ip: Ipv4Addr, gateway: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            ip,
            gateway,
            netmask,
            dns: Vec::new(),
            promisc: false,
            outputs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_promisc(mut self, promisc: bool) -> Self {
        self.promisc = promisc;
        self
    }

    pub fn with_dns(mut self, dns: Vec<Ipv4Addr>) -> Self {
        self.dns = dns;
        self
    }

    /// Frames injected so far, oldest first.
    pub fn injected(&self) -> Vec<Bytes> {
        self.outputs.lock().expect("tap poisoned").clone()
    }

    /// Drop recorded frames.
    pub fn clear(&self) {
        self.outputs.lock().expect("tap poisoned").clear();
    }
}

impl TapDevice for MemoryTap {
    fn ip_address(&self) -> Ipv4Addr {
        self.ip
    }

    fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    fn dns_addresses(&self) -> Vec<Ipv4Addr> {
        self.dns.clone()
    }

    fn is_promisc(&self) -> bool {
        self.promisc
    }

    fn interface_index(&self) -> i32 {
        0
    }

    fn output(&self, frame: &[u8]) -> bool {
        self.outputs
            .lock()
            .expect("tap poisoned")
            .push(Bytes::copy_from_slice(frame));
        true
    }
}
