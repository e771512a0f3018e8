//! Tunnel exchanger: one logical connection to the remote peer,
//! multiplexing NAT connections, UDP datagram ports, reverse port-mapping
//! sessions and keep-alive over a single transmission.
//!
//! State machine: Connecting -> (transmission open + information exchange
//! accepted) -> Established -> (transmission lost) -> Reconnecting ->
//! (new transmission) -> Established. Disposal is terminal from any state.

mod datagram;
mod mapping;

pub use datagram::{DatagramPort, DatagramPortTable, DATAGRAM_IDLE_TIMEOUT_MS};
pub use mapping::{MappingKey, MappingPort, MappingPortTable};

use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{LinkInformation, LinkMessage};
use crate::switcher::NetworkSwitcher;
use crate::transmission::{Transmission, TransmissionConnector};

/// Consecutive unanswered keep-alives before the link is declared lost.
pub const MAX_MISSED_KEEPALIVES: u32 = 3;

/// Exchanger network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// Opening the first transmission.
    Connecting,
    /// Information exchange accepted, link serving traffic.
    Established,
    /// Transmission lost, trying to replace it.
    Reconnecting,
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkState::Connecting => write!(f, "Connecting"),
            NetworkState::Established => write!(f, "Established"),
            NetworkState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Keep-alive bookkeeping against the exchanger's tick clock.
#[derive(Debug, Default)]
struct KeepaliveState {
    last_sent: u64,
    next_due: u64,
    missed: u32,
}

impl KeepaliveState {
    fn is_due(&self, now: u64) -> bool {
        now >= self.next_due
    }

    /// Record a send and schedule the next probe with a little jitter so
    /// reconnecting clients do not probe in lockstep.
    fn mark_sent(&mut self, now: u64, interval_ms: u64) {
        self.last_sent = now;
        let jitter = rand::thread_rng().gen_range(0..=interval_ms / 4);
        self.next_due = now + interval_ms + jitter;
        self.missed += 1;
    }

    fn acknowledge(&mut self) {
        self.missed = 0;
    }
}

/// The tunnel exchanger.
pub struct Exchanger {
    config: ClientConfig,
    connector: Arc<dyn TransmissionConnector>,
    // The only cross-thread handoff: disposal may race a reconnect swap,
    // so the slot replacement is the one mutex-guarded spot.
    transmission: Mutex<Option<Transmission>>,
    state: NetworkState,
    disposed: bool,
    keepalive: KeepaliveState,
    information: Option<LinkInformation>,
    /// Subnet announced by the peer's Lan opcode, `(ip, mask)`.
    announced_lan: Option<(u32, u32)>,
    remote_endpoint: Option<SocketAddr>,
    datagrams: DatagramPortTable,
    mappings: MappingPortTable,
    /// NAT stream sessions the peer has opened toward us, by connection id.
    connections: HashSet<u32>,
}

impl Exchanger {
    pub fn new(config: ClientConfig, connector: Arc<dyn TransmissionConnector>) -> Self {
        Self {
            config,
            connector,
            transmission: Mutex::new(None),
            state: NetworkState::Connecting,
            disposed: false,
            keepalive: KeepaliveState::default(),
            information: None,
            announced_lan: None,
            remote_endpoint: None,
            datagrams: DatagramPortTable::default(),
            mappings: MappingPortTable::default(),
            connections: HashSet::new(),
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn information(&self) -> Option<LinkInformation> {
        self.information
    }

    pub fn announced_lan(&self) -> Option<(u32, u32)> {
        self.announced_lan
    }

    /// Resolved remote endpoint, available after `open()`.
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote_endpoint
    }

    /// Display URI for the resolved remote peer.
    pub fn remote_uri(&self) -> Option<String> {
        self.remote_endpoint
            .map(|_| format!("{}:{}/vnet", self.config.server, self.config.port))
    }

    /// Current transmission handle, if any.
    pub fn transmission(&self) -> Option<Transmission> {
        self.transmission.lock().expect("slot poisoned").clone()
    }

    /// Install a transmission, replacing (and only then dropping) any
    /// stale one so a dead channel is never served.
    fn install_transmission(&self, transmission: Transmission) {
        let mut slot = self.transmission.lock().expect("slot poisoned");
        let stale = slot.replace(transmission);
        drop(slot);
        drop(stale);
    }

    fn close_transmission(&self) {
        let stale = self.transmission.lock().expect("slot poisoned").take();
        drop(stale);
    }

    /// Establish the initial transmission, resolve the remote endpoint
    /// (may suspend on a name lookup), register static mapping rules and
    /// seed the keep-alive schedule.
    pub async fn open(&mut self, now: u64) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        if self.transmission().is_some() {
            return Err(Error::AlreadyOpen);
        }

        let authority = self.config.server_authority();
        let resolved = tokio::net::lookup_host(&authority)
            .await
            .map_err(|e| Error::resolve(format!("{authority}: {e}")))?
            .next()
            .ok_or_else(|| Error::resolve(format!("{authority}: no addresses")))?;
        if self.disposed {
            // Disposal raced the lookup; observe the flag and do nothing.
            return Err(Error::Disposed);
        }
        self.remote_endpoint = Some(resolved);
        info!(remote = %resolved, "Remote endpoint resolved");

        let transmission = self
            .connector
            .open_transmission()
            .ok_or_else(|| Error::transmission("initial transmission refused"))?;

        // Information exchange opens the session; Established is granted
        // when the peer's Information answer arrives.
        if !transmission.send(LinkMessage::Information(LinkInformation::default())) {
            return Err(Error::transmission("handshake send failed"));
        }
        self.install_transmission(transmission);
        self.state = NetworkState::Connecting;

        let rules = self.config.mappings.clone();
        for rule in &rules {
            self.mappings.register(rule);
        }

        self.keepalive.mark_sent(now, self.keepalive_interval_ms());
        self.keepalive.acknowledge();
        Ok(())
    }

    fn keepalive_interval_ms(&self) -> u64 {
        self.config.keepalive_interval.max(1) * 1000
    }

    /// Periodic driver. Checks transmission liveness, emits due
    /// keep-alives, expires idle datagram ports. Returns false once
    /// disposed.
    pub fn update(&mut self, now: u64) -> bool {
        if self.disposed {
            return false;
        }

        let alive = self.transmission().map(|t| t.is_alive()).unwrap_or(false);
        if !alive {
            self.reconnect(now);
        } else if self.keepalive.missed >= MAX_MISSED_KEEPALIVES {
            warn!(missed = self.keepalive.missed, "Keep-alive silence, reconnecting");
            self.reconnect(now);
        } else if self.keepalive.is_due(now) {
            if self.echo_payload(keepalive_probe()) {
                self.keepalive.mark_sent(now, self.keepalive_interval_ms());
            } else {
                self.reconnect(now);
            }
        }

        self.datagrams.sweep(now);
        true
    }

    /// Transmission loss path: move to Reconnecting and try to bring up a
    /// replacement channel immediately.
    fn reconnect(&mut self, now: u64) {
        if self.state != NetworkState::Reconnecting {
            debug!(state = %self.state, "Transmission lost");
            self.state = NetworkState::Reconnecting;
        }

        match self.connector.open_transmission() {
            Some(transmission) => {
                if transmission.send(LinkMessage::Information(LinkInformation::default())) {
                    self.install_transmission(transmission);
                    self.keepalive.acknowledge();
                    self.keepalive.mark_sent(now, self.keepalive_interval_ms());
                    self.keepalive.acknowledge();
                }
            }
            None => trace!("Reconnect attempt refused"),
        }
    }

    /// Handle one message decoded off the transmission. Every handler is
    /// idempotent against duplicate delivery. Returns false when the
    /// message forced the transmission closed.
    pub fn on_message(
        &mut self,
        message: LinkMessage,
        switcher: &mut NetworkSwitcher,
        now: u64,
    ) -> bool {
        if self.disposed {
            return false;
        }

        // Any traffic from the peer proves the channel is alive.
        self.keepalive.acknowledge();

        match message {
            LinkMessage::Lan { ip, mask } => {
                if self.announced_lan != Some((ip, mask)) {
                    debug!(ip = %std::net::Ipv4Addr::from(ip), mask = %std::net::Ipv4Addr::from(mask),
                        "Peer announced LAN");
                    self.announced_lan = Some((ip, mask));
                }
                true
            }
            LinkMessage::Nat { packet } => switcher.inject(&packet),
            LinkMessage::Information(info) => self.on_information(info, switcher),
            LinkMessage::Push { connection_id, packet } => {
                // Stream payloads belong to the TCP stack; account only.
                self.connections.contains(&connection_id) && !packet.is_empty()
            }
            LinkMessage::Connect { connection_id, destination } => {
                trace!(connection_id, %destination, "Peer connect");
                self.connections.insert(connection_id);
                true
            }
            LinkMessage::ConnectOk { connection_id, error_code } => {
                if error_code != 0 {
                    self.connections.remove(&connection_id);
                }
                true
            }
            LinkMessage::Disconnect { connection_id } => {
                self.connections.remove(&connection_id);
                true
            }
            LinkMessage::EchoId { ack_id } => switcher.correlate_echo(ack_id),
            LinkMessage::EchoPayload { packet } => {
                // Direct ICMP passthrough; keep-alive answers land here too
                // and were already credited above.
                switcher.inject(&packet)
            }
            LinkMessage::SendTo { source, destination, packet } => {
                self.on_send_to(source, destination, packet, switcher, now)
            }
            LinkMessage::FrpSendTo { inbound, remote_port, source, packet } => {
                let key = MappingKey {
                    inbound,
                    transport: crate::config::Transport::Udp,
                    remote_port,
                };
                match self.mappings.get_mut(&key) {
                    Some(port) => {
                        port.datagram(source, packet.len());
                        true
                    }
                    None => false,
                }
            }
            LinkMessage::FrpConnect { connection_id, inbound, remote_port } => {
                let key = MappingKey {
                    inbound,
                    transport: crate::config::Transport::Tcp,
                    remote_port,
                };
                match self.mappings.get_mut(&key) {
                    Some(port) => {
                        port.connect(connection_id);
                        true
                    }
                    None => false,
                }
            }
            LinkMessage::FrpDisconnect { connection_id, inbound, remote_port } => {
                let key = MappingKey {
                    inbound,
                    transport: crate::config::Transport::Tcp,
                    remote_port,
                };
                match self.mappings.get_mut(&key) {
                    Some(port) => {
                        port.disconnect(connection_id);
                        true
                    }
                    None => false,
                }
            }
            LinkMessage::FrpPush { connection_id, inbound, remote_port, packet } => {
                let key = MappingKey {
                    inbound,
                    transport: crate::config::Transport::Tcp,
                    remote_port,
                };
                match self.mappings.get_mut(&key) {
                    Some(port) => port.push(connection_id, packet.len()),
                    None => false,
                }
            }
        }
    }

    /// Information exchange: grants Established, and force-closes the
    /// transmission when the reported session is no longer valid (the
    /// server ends invalid sessions; the client does not get to opt out).
    fn on_information(&mut self, info: LinkInformation, switcher: &mut NetworkSwitcher) -> bool {
        self.information = Some(info);
        switcher.on_information(&info);

        if !info.is_valid() {
            warn!("Session reported invalid, closing transmission");
            self.close_transmission();
            return false;
        }

        if self.state != NetworkState::Established {
            info!(state = %self.state, "Link established");
            self.state = NetworkState::Established;
        }
        true
    }

    /// UDP NAT reply delivery: refresh the owning datagram port and hand
    /// the payload to the switcher for reinjection.
    fn on_send_to(
        &mut self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        packet: Bytes,
        switcher: &mut NetworkSwitcher,
        now: u64,
    ) -> bool {
        if let Some(port) = self.datagrams.get_mut(&source) {
            port.touch(now);
        }
        switcher.datagram_output(source, destination, &packet)
    }

    /// Outbound UDP datagram NAT dispatch from the switcher.
    pub fn send_to(
        &mut self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        packet: Bytes,
        now: u64,
    ) -> bool {
        if self.disposed {
            return false;
        }
        let transmission = match self.transmission() {
            Some(t) => t,
            None => return false,
        };

        self.datagrams
            .get_or_create(source, &transmission, now)
            .send_to(destination, packet, now)
    }

    /// Forward a raw IP packet into the remote NAT.
    pub fn nat(&self, packet: Bytes) -> bool {
        if self.disposed {
            return false;
        }
        self.transmission()
            .map(|t| t.send(LinkMessage::Nat { packet }))
            .unwrap_or(false)
    }

    /// Ask the peer to echo an acknowledgement id (pending-ICMP path).
    pub fn echo_id(&self, ack_id: u32) -> bool {
        if self.disposed {
            return false;
        }
        self.transmission()
            .map(|t| t.send(LinkMessage::EchoId { ack_id }))
            .unwrap_or(false)
    }

    /// Send a raw ICMP-bearing IP packet for remote echo.
    pub fn echo_payload(&self, packet: Bytes) -> bool {
        if self.disposed {
            return false;
        }
        self.transmission()
            .map(|t| t.send(LinkMessage::EchoPayload { packet }))
            .unwrap_or(false)
    }

    pub fn datagram_ports(&self) -> &DatagramPortTable {
        &self.datagrams
    }

    pub fn mapping_ports(&self) -> &MappingPortTable {
        &self.mappings
    }

    /// Tear down: unregister mappings, release datagram ports, drop the
    /// transmission. Safe to call twice and from outside the owner's
    /// context (a suspended open observes the flag).
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.mappings.unregister_all();
        self.datagrams.clear();
        self.connections.clear();
        self.close_transmission();
        debug!("Exchanger disposed");
    }
}

/// Small random payload for keep-alive probes.
fn keepalive_probe() -> Bytes {
    let len = rand::thread_rng().gen_range(16..=64);
    let mut padding = vec![0u8; len];
    rand::thread_rng().fill(&mut padding[..]);
    Bytes::from(padding)
}
