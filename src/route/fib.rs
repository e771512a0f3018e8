//! Forwarding Information Base.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use super::{prefix_mask, Rib};

/// Compiled next-hop lookup derived from a [`Rib`] at a single fill point.
///
/// Read-only after construction; a RIB change produces a brand-new FIB.
/// Only available for bypass decisions when its source RIB was non-empty.
#[derive(Debug, Default)]
pub struct Fib {
    // Index 0 holds /32, scanning toward /0, so the first hit is the
    // longest match. Later RIB entries for the same prefix never displace
    // earlier ones, keeping lookups deterministic.
    levels: Vec<(u8, HashMap<u32, Ipv4Addr>)>,
    available: bool,
}

impl Fib {
    /// Compile a FIB from the given RIB.
    pub fn fill(rib: &Rib) -> Fib {
        let mut by_prefix: HashMap<u8, HashMap<u32, Ipv4Addr>> = HashMap::new();
        for entry in rib.entries() {
            by_prefix
                .entry(entry.prefix)
                .or_default()
                .entry(u32::from(entry.destination))
                .or_insert(entry.next_hop);
        }

        let mut levels: Vec<(u8, HashMap<u32, Ipv4Addr>)> = by_prefix.into_iter().collect();
        levels.sort_by(|a, b| b.0.cmp(&a.0));

        Fib {
            levels,
            available: !rib.is_empty(),
        }
    }

    /// Whether this FIB may be used for bypass decisions.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Deterministic longest-prefix next hop for an address.
    pub fn next_hop(&self, address: Ipv4Addr) -> Option<Ipv4Addr> {
        let addr = u32::from(address);
        for (prefix, table) in &self.levels {
            if let Some(next_hop) = table.get(&(addr & prefix_mask(*prefix))) {
                return Some(*next_hop);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rib_yields_unavailable_fib() {
        let fib = Fib::fill(&Rib::new());
        assert!(!fib.is_available());
        assert_eq!(fib.next_hop(Ipv4Addr::new(8, 8, 8, 8)), None);
    }

    #[test]
    fn longest_prefix_is_deterministic() {
        let mut rib = Rib::new();
        let gw1 = Ipv4Addr::new(192, 168, 1, 1);
        let gw2 = Ipv4Addr::new(10, 0, 0, 1);
        rib.add_route(Ipv4Addr::new(10, 0, 0, 0), 8, gw1);
        rib.add_route(Ipv4Addr::UNSPECIFIED, 0, gw2);

        let fib = Fib::fill(&rib);
        assert!(fib.is_available());
        assert_eq!(fib.next_hop(Ipv4Addr::new(10, 1, 2, 3)), Some(gw1));
        assert_eq!(fib.next_hop(Ipv4Addr::new(8, 8, 8, 8)), Some(gw2));
    }

    #[test]
    fn first_rib_entry_wins_on_equal_prefix() {
        let mut rib = Rib::new();
        let gw1 = Ipv4Addr::new(192, 168, 1, 1);
        let gw2 = Ipv4Addr::new(192, 168, 1, 2);
        rib.add_route(Ipv4Addr::new(10, 0, 0, 0), 8, gw1);
        rib.add_route(Ipv4Addr::new(10, 0, 0, 0), 8, gw2);

        let fib = Fib::fill(&rib);
        assert_eq!(fib.next_hop(Ipv4Addr::new(10, 9, 9, 9)), Some(gw1));
    }

    #[test]
    fn split_default_halves_cover_everything() {
        let mut rib = Rib::new();
        let gw = Ipv4Addr::new(10, 0, 0, 1);
        rib.add_route(Ipv4Addr::UNSPECIFIED, 1, gw);
        rib.add_route(Ipv4Addr::new(128, 0, 0, 0), 1, gw);

        let fib = Fib::fill(&rib);
        assert_eq!(fib.next_hop(Ipv4Addr::new(1, 2, 3, 4)), Some(gw));
        assert_eq!(fib.next_hop(Ipv4Addr::new(200, 2, 3, 4)), Some(gw));
    }
}
