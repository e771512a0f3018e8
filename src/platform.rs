//! Platform routing capability.
//!
//! The switcher's route lifecycle calls only this interface; per-OS
//! branching stays behind it. The system implementation shells out the way
//! the rest of the platform glue does, the recording implementation backs
//! the tests.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use tracing::{debug, warn};

/// OS route-table and DNS mutation, one implementation per target.
pub trait PlatformRouting: Send + Sync {
    /// Add a route `destination/prefix via next_hop`.
    fn add_route(&self, destination: Ipv4Addr, prefix: u8, next_hop: Ipv4Addr) -> bool;

    /// Delete a previously added route.
    fn delete_route(&self, destination: Ipv4Addr, prefix: u8, next_hop: Ipv4Addr) -> bool;

    /// Redirect system DNS to the given servers, saving prior state.
    fn set_dns(&self, servers: &[Ipv4Addr]) -> bool;

    /// Restore the DNS state saved by `set_dns`.
    fn restore_dns(&self) -> bool;
}

/// System implementation driving `ip route` and `/etc/resolv.conf`.
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct SystemRouting {
    device: Option<String>,
    saved_resolv: Mutex<Option<String>>,
}

#[cfg(target_os = "linux")]
impl SystemRouting {
    const RESOLV_CONF: &'static str = "/etc/resolv.conf";

    pub fn new() -> Self {
        Self::default()
    }

    /// Pin route mutations to a named interface (the preferred NIC from
    /// the configuration). An empty name keeps the kernel's choice.
    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.device = Some(name);
        }
        self
    }

    fn route_args(
        &self,
        action: &str,
        destination: Ipv4Addr,
        prefix: u8,
        next_hop: Ipv4Addr,
    ) -> Vec<String> {
        let mut args = vec![
            "route".to_string(),
            action.to_string(),
            format!("{destination}/{prefix}"),
            "via".to_string(),
            next_hop.to_string(),
        ];
        if let Some(device) = &self.device {
            args.push("dev".to_string());
            args.push(device.clone());
        }
        args
    }

    fn run_ip_route(&self, action: &str, destination: Ipv4Addr, prefix: u8, next_hop: Ipv4Addr) -> bool {
        let args = self.route_args(action, destination, prefix, next_hop);
        let output = std::process::Command::new("ip").args(&args).output();
        match output {
            Ok(out) if out.status.success() => {
                debug!(action, route = %args[2..].join(" "), "ip route");
                true
            }
            Ok(out) => {
                warn!(action, route = %args[2..].join(" "),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "ip route failed");
                false
            }
            Err(err) => {
                warn!(action, %err, "ip route could not be spawned");
                false
            }
        }
    }
}

#[cfg(target_os = "linux")]
impl PlatformRouting for SystemRouting {
    fn add_route(&self, destination: Ipv4Addr, prefix: u8, next_hop: Ipv4Addr) -> bool {
        self.run_ip_route("add", destination, prefix, next_hop)
    }

    fn delete_route(&self, destination: Ipv4Addr, prefix: u8, next_hop: Ipv4Addr) -> bool {
        self.run_ip_route("del", destination, prefix, next_hop)
    }

    fn set_dns(&self, servers: &[Ipv4Addr]) -> bool {
        let mut saved = self.saved_resolv.lock().expect("dns state poisoned");
        if saved.is_none() {
            match std::fs::read_to_string(Self::RESOLV_CONF) {
                Ok(prior) => *saved = Some(prior),
                Err(err) => {
                    warn!(%err, "Could not snapshot resolv.conf");
                    return false;
                }
            }
        }

        let content: String = servers
            .iter()
            .map(|s| format!("nameserver {s}\n"))
            .collect();
        match std::fs::write(Self::RESOLV_CONF, content) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "Could not rewrite resolv.conf");
                false
            }
        }
    }

    fn restore_dns(&self) -> bool {
        let prior = self.saved_resolv.lock().expect("dns state poisoned").take();
        match prior {
            Some(content) => match std::fs::write(Self::RESOLV_CONF, content) {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "Could not restore resolv.conf");
                    false
                }
            },
            None => true,
        }
    }
}

/// One recorded route operation (used by [`RecordingRouting`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOp {
    pub added: bool,
    pub destination: Ipv4Addr,
    pub prefix: u8,
    pub next_hop: Ipv4Addr,
}

/// Test double: records every call instead of touching the OS.
#[derive(Debug, Default)]
pub struct RecordingRouting {
    ops: Mutex<Vec<RouteOp>>,
    dns: Mutex<Vec<Vec<Ipv4Addr>>>,
    restores: Mutex<usize>,
}

impl RecordingRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<RouteOp> {
        self.ops.lock().expect("recording poisoned").clone()
    }

    /// Routes currently installed (adds minus matching deletes).
    pub fn installed(&self) -> Vec<RouteOp> {
        let mut live: Vec<RouteOp> = Vec::new();
        for op in self.ops() {
            if op.added {
                live.push(op);
            } else {
                live.retain(|l| {
                    !(l.destination == op.destination
                        && l.prefix == op.prefix
                        && l.next_hop == op.next_hop)
                });
            }
        }
        live
    }

    pub fn dns_sets(&self) -> usize {
        self.dns.lock().expect("recording poisoned").len()
    }

    pub fn dns_restores(&self) -> usize {
        *self.restores.lock().expect("recording poisoned")
    }
}

impl PlatformRouting for RecordingRouting {
    fn add_route(&self, destination: Ipv4Addr, prefix: u8, next_hop: Ipv4Addr) -> bool {
        self.ops.lock().expect("recording poisoned").push(RouteOp {
            added: true,
            destination,
            prefix,
            next_hop,
        });
        true
    }

    fn delete_route(&self, destination: Ipv4Addr, prefix: u8, next_hop: Ipv4Addr) -> bool {
        self.ops.lock().expect("recording poisoned").push(RouteOp {
            added: false,
            destination,
            prefix,
            next_hop,
        });
        true
    }

    fn set_dns(&self, servers: &[Ipv4Addr]) -> bool {
        self.dns
            .lock()
            .expect("recording poisoned")
            .push(servers.to_vec());
        true
    }

    fn restore_dns(&self) -> bool {
        *self.restores.lock().expect("recording poisoned") += 1;
        true
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn route_command_honors_preferred_device() {
        let dest = Ipv4Addr::new(10, 0, 0, 0);
        let via = Ipv4Addr::new(192, 168, 1, 1);

        let plain = SystemRouting::new();
        assert_eq!(
            plain.route_args("add", dest, 8, via),
            ["route", "add", "10.0.0.0/8", "via", "192.168.1.1"]
        );

        let pinned = SystemRouting::new().with_device("eth0");
        assert_eq!(
            pinned.route_args("del", dest, 8, via),
            ["route", "del", "10.0.0.0/8", "via", "192.168.1.1", "dev", "eth0"]
        );

        // Empty configuration value means no pinning.
        let unset = SystemRouting::new().with_device("");
        assert_eq!(unset.route_args("add", dest, 8, via).len(), 5);
    }
}
