//! Per-source-endpoint UDP NAT ports.
//!
//! Each outbound UDP flow off the virtual interface gets one port, keyed by
//! the packet's source endpoint and bound to the transmission that carried
//! its first datagram. A port bound to a dead or superseded transmission is
//! stale and gets released and recreated on the next send.

use std::collections::HashMap;
use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::protocol::LinkMessage;
use crate::transmission::Transmission;

/// Idle lifetime of a datagram port in milliseconds.
pub const DATAGRAM_IDLE_TIMEOUT_MS: u64 = 72_000;

/// One UDP NAT session.
#[derive(Debug)]
pub struct DatagramPort {
    source: SocketAddrV4,
    transmission: Transmission,
    expires_at: u64,
}

impl DatagramPort {
    fn new(source: SocketAddrV4, transmission: Transmission, now: u64) -> Self {
        Self {
            source,
            transmission,
            expires_at: now + DATAGRAM_IDLE_TIMEOUT_MS,
        }
    }

    pub fn source(&self) -> SocketAddrV4 {
        self.source
    }

    /// Refresh the idle deadline; any datagram in either direction counts.
    pub fn touch(&mut self, now: u64) {
        self.expires_at = now + DATAGRAM_IDLE_TIMEOUT_MS;
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Stale means bound to a transmission that is gone or superseded.
    pub fn is_stale(&self, current: &Transmission) -> bool {
        !self.transmission.is_alive() || self.transmission.generation() != current.generation()
    }

    /// Forward a datagram for this flow to the remote NAT.
    pub fn send_to(&mut self, destination: SocketAddrV4, packet: Bytes, now: u64) -> bool {
        let ok = self.transmission.send(LinkMessage::SendTo {
            source: self.source,
            destination,
            packet,
        });
        if ok {
            self.touch(now);
        }
        ok
    }
}

/// The exchanger-owned table of live UDP NAT sessions.
#[derive(Debug, Default)]
pub struct DatagramPortTable {
    ports: HashMap<SocketAddrV4, DatagramPort>,
}

impl DatagramPortTable {
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Look up the port for a source endpoint, creating it when absent and
    /// replacing it when the existing entry is bound to a dead channel.
    /// At most one entry per source endpoint.
    pub fn get_or_create(
        &mut self,
        source: SocketAddrV4,
        transmission: &Transmission,
        now: u64,
    ) -> &mut DatagramPort {
        if self
            .ports
            .get(&source)
            .is_some_and(|port| port.is_stale(transmission))
        {
            debug!(%source, "Releasing stale datagram port");
            self.ports.remove(&source);
        }

        self.ports
            .entry(source)
            .or_insert_with(|| DatagramPort::new(source, transmission.clone(), now))
    }

    pub fn get_mut(&mut self, source: &SocketAddrV4) -> Option<&mut DatagramPort> {
        self.ports.get_mut(source)
    }

    /// Drop all ports whose idle deadline has passed.
    pub fn sweep(&mut self, now: u64) -> usize {
        let before = self.ports.len();
        self.ports.retain(|source, port| {
            let keep = !port.is_expired(now);
            if !keep {
                trace!(%source, "Expiring idle datagram port");
            }
            keep
        });
        before - self.ports.len()
    }

    /// Release everything (exchanger teardown).
    pub fn clear(&mut self) {
        self.ports.clear();
    }
}
