//! Reverse port-mapping sessions.
//!
//! A mapping port represents one statically configured forwarding rule for
//! inbound traffic redirected through the tunnel. Rules register exactly
//! once at exchanger open and unregister at teardown; the Frp opcodes drive
//! per-connection lifecycle and accounting against them.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;

use tracing::{debug, warn};

use crate::config::{MappingRule, Transport};

/// Identity of a mapping rule on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub inbound: bool,
    pub transport: Transport,
    pub remote_port: u16,
}

impl MappingKey {
    pub fn from_rule(rule: &MappingRule) -> Self {
        Self {
            inbound: rule.inbound,
            transport: rule.transport,
            remote_port: rule.remote_port,
        }
    }
}

/// One registered forwarding rule and its live connections.
#[derive(Debug)]
pub struct MappingPort {
    key: MappingKey,
    local_address: String,
    local_port: u16,
    connections: HashSet<u32>,
    datagrams_in: u64,
    bytes_in: u64,
}

impl MappingPort {
    pub fn key(&self) -> MappingKey {
        self.key
    }

    pub fn local_target(&self) -> (&str, u16) {
        (&self.local_address, self.local_port)
    }

    /// Open a mapped stream connection. Duplicate delivery of the same id
    /// is a no-op.
    pub fn connect(&mut self, connection_id: u32) -> bool {
        self.connections.insert(connection_id)
    }

    /// Close a mapped stream connection; absent ids are tolerated.
    pub fn disconnect(&mut self, connection_id: u32) -> bool {
        self.connections.remove(&connection_id)
    }

    pub fn is_connected(&self, connection_id: u32) -> bool {
        self.connections.contains(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Account a stream payload for a known connection.
    pub fn push(&mut self, connection_id: u32, len: usize) -> bool {
        if !self.connections.contains(&connection_id) {
            return false;
        }
        self.bytes_in += len as u64;
        true
    }

    /// Account an inbound mapped datagram.
    pub fn datagram(&mut self, _source: SocketAddrV4, len: usize) {
        self.datagrams_in += 1;
        self.bytes_in += len as u64;
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn datagrams_in(&self) -> u64 {
        self.datagrams_in
    }
}

/// The exchanger-owned registry of mapping rules.
#[derive(Debug, Default)]
pub struct MappingPortTable {
    ports: HashMap<MappingKey, MappingPort>,
}

impl MappingPortTable {
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Register a rule; a second registration for the same
    /// (direction, transport, remote_port) key is rejected.
    pub fn register(&mut self, rule: &MappingRule) -> bool {
        let key = MappingKey::from_rule(rule);
        if self.ports.contains_key(&key) {
            warn!(?key, "Duplicate mapping-port registration rejected");
            return false;
        }

        debug!(?key, local = %format!("{}:{}", rule.local_address, rule.local_port),
            "Registered mapping port");
        self.ports.insert(
            key,
            MappingPort {
                key,
                local_address: rule.local_address.clone(),
                local_port: rule.local_port,
                connections: HashSet::new(),
                datagrams_in: 0,
                bytes_in: 0,
            },
        );
        true
    }

    pub fn get_mut(&mut self, key: &MappingKey) -> Option<&mut MappingPort> {
        self.ports.get_mut(key)
    }

    /// Drop every registration (exchanger teardown).
    pub fn unregister_all(&mut self) {
        if !self.ports.is_empty() {
            debug!(count = self.ports.len(), "Unregistering all mapping ports");
        }
        self.ports.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(remote_port: u16) -> MappingRule {
        MappingRule {
            inbound: true,
            transport: Transport::Tcp,
            remote_port,
            local_address: "127.0.0.1".into(),
            local_port: 22,
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut table = MappingPortTable::default();
        assert!(table.register(&rule(8022)));
        assert!(!table.register(&rule(8022)));
        assert_eq!(table.len(), 1);

        // Same port, different transport is a distinct key.
        let mut udp = rule(8022);
        udp.transport = Transport::Udp;
        assert!(table.register(&udp));
    }

    #[test]
    fn connection_lifecycle_is_idempotent() {
        let mut table = MappingPortTable::default();
        table.register(&rule(8022));
        let key = MappingKey::from_rule(&rule(8022));
        let port = table.get_mut(&key).unwrap();

        assert!(port.connect(9));
        assert!(!port.connect(9)); // duplicate delivery
        assert!(port.push(9, 100));
        assert!(port.disconnect(9));
        assert!(!port.disconnect(9));
        assert!(!port.push(9, 100)); // closed connection
        assert_eq!(port.bytes_in(), 100);
    }
}
