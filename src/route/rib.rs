//! Routing Information Base.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use tracing::{debug, warn};

use super::prefix_mask;

/// A single route: destination prefix and the next hop serving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    pub destination: Ipv4Addr,
    pub prefix: u8,
    pub next_hop: Ipv4Addr,
}

/// In-memory route store built from bypass lists and the tunnel's own
/// routes. Overlapping prefixes are allowed; in particular the default
/// route is carried as `0.0.0.0/1` + `128.0.0.0/1` so an operating-system
/// default route with a different prefix is never displaced.
#[derive(Debug, Default, Clone)]
pub struct Rib {
    entries: Vec<RouteEntry>,
    seen: HashSet<RouteEntry>,
}

impl Rib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Add a route. The destination is masked to its prefix; an exact
    /// duplicate (same prefix, same next hop) is rejected.
    pub fn add_route(&mut self, destination: Ipv4Addr, prefix: u8, next_hop: Ipv4Addr) -> bool {
        if prefix > 32 {
            return false;
        }

        let masked = Ipv4Addr::from(u32::from(destination) & prefix_mask(prefix));
        let entry = RouteEntry {
            destination: masked,
            prefix,
            next_hop,
        };
        if !self.seen.insert(entry) {
            return false;
        }

        self.entries.push(entry);
        true
    }

    /// Add the half-space default routes (`0.0.0.0/1` + `128.0.0.0/1`) and
    /// the plain default, all via `next_hop`.
    pub fn add_default_routes(&mut self, next_hop: Ipv4Addr) {
        self.add_route(Ipv4Addr::UNSPECIFIED, 1, next_hop);
        self.add_route(Ipv4Addr::new(128, 0, 0, 0), 1, next_hop);
        self.add_route(Ipv4Addr::UNSPECIFIED, 0, next_hop);
    }

    /// Load a bypass IP-list file: one `a.b.c.d/len` (or bare `a.b.c.d`)
    /// entry per line, `#` comments and blank lines ignored. All entries
    /// share the given next hop. Returns true if any route was added.
    pub fn add_routes_from_iplist(&mut self, path: &Path, next_hop: Ipv4Addr) -> bool {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %path.display(), %err, "Failed to read iplist file");
                return false;
            }
        };

        let mut added = 0usize;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (address, prefix) = match line.split_once('/') {
                Some((address, prefix)) => (address, prefix),
                None => (line, "32"),
            };

            let parsed: Option<(Ipv4Addr, u8)> = address
                .trim()
                .parse()
                .ok()
                .zip(prefix.trim().parse().ok())
                .filter(|&(_, p)| p <= 32);
            match parsed {
                Some((destination, prefix)) => {
                    if self.add_route(destination, prefix, next_hop) {
                        added += 1;
                    }
                }
                None => warn!(path = %path.display(), line, "Skipping malformed iplist entry"),
            }
        }

        debug!(path = %path.display(), added, "Loaded iplist file");
        added > 0
    }

    /// Longest-prefix match. The FIB serves the packet path; this form is
    /// kept for table inspection and tests.
    pub fn next_hop(&self, address: Ipv4Addr) -> Option<Ipv4Addr> {
        let addr = u32::from(address);
        self.entries
            .iter()
            .filter(|e| (addr & prefix_mask(e.prefix)) == u32::from(e.destination))
            .max_by_key(|e| e.prefix)
            .map(|e| e.next_hop)
    }
}
