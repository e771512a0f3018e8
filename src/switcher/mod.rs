//! Packet dispatcher sitting between the virtual interface and the
//! exchanger. Classifies IP frames off the device, emulates the tunnel
//! gateway for ICMP, hands UDP to the exchanger's datagram NAT, and
//! drives system route installation around the exchanger's lifecycle.

pub mod pending;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exchanger::Exchanger;
use crate::packet::{IcmpFrame, IcmpType, IpFrame, IpProtocol, UdpFrame};
use crate::platform::PlatformRouting;
use crate::protocol::LinkInformation;
use crate::route::{Fib, Rib};
use crate::tap::TapDevice;

use self::pending::PendingIcmpTable;

/// TTL stamped on synthesized UDP reply frames.
const UDP_REPLY_TTL: u8 = 64;

/// Dispatcher for frames arriving from the virtual interface.
///
/// Owns the route tables and the pending-ICMP table exclusively; the
/// exchanger is handed in per call so neither side stores a reference
/// to the other.
pub struct NetworkSwitcher {
    tap: Arc<dyn TapDevice>,
    routing: Arc<dyn PlatformRouting>,
    underlying_gateway: Ipv4Addr,
    block_quic: bool,
    iplist_files: Vec<PathBuf>,
    /// Off-subnet DNS servers given /32 routes at install time.
    dns_routes: Vec<Ipv4Addr>,
    pending: PendingIcmpTable,
    rib: Option<Arc<Rib>>,
    fib: Option<Arc<Fib>>,
    routes_installed: bool,
    server_endpoint: Option<SocketAddr>,
    information: Option<LinkInformation>,
    disposed: bool,
}

impl NetworkSwitcher {
    pub fn new(
        tap: Arc<dyn TapDevice>,
        routing: Arc<dyn PlatformRouting>,
        underlying_gateway: Ipv4Addr,
        block_quic: bool,
    ) -> Self {
        Self {
            tap,
            routing,
            underlying_gateway,
            block_quic,
            iplist_files: Vec::new(),
            dns_routes: Vec::new(),
            pending: PendingIcmpTable::new(),
            rib: None,
            fib: None,
            routes_installed: false,
            server_endpoint: None,
            information: None,
            disposed: false,
        }
    }

    /// Queue a bypass IP-list file. The queue is consumed once at
    /// [`open`](Self::open).
    pub fn add_iplist_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.iplist_files.contains(&path) {
            self.iplist_files.push(path);
        }
    }

    pub fn rib(&self) -> Option<Arc<Rib>> {
        self.rib.clone()
    }

    pub fn fib(&self) -> Option<Arc<Fib>> {
        self.fib.clone()
    }

    pub fn routes_installed(&self) -> bool {
        self.routes_installed
    }

    /// Resolved tunnel endpoint cached at [`open`](Self::open).
    pub fn server_endpoint(&self) -> Option<SocketAddr> {
        self.server_endpoint
    }

    /// Toggle the QUIC suppression policy at runtime.
    pub fn set_block_quic(&mut self, block: bool) {
        self.block_quic = block;
    }

    pub fn information(&self) -> Option<LinkInformation> {
        self.information
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Bring-up after the exchanger has opened: consume the queued
    /// bypass lists into a fresh RIB, pin the server address via the
    /// physical gateway, derive the FIB, then install OS routes and DNS
    /// redirection exactly once.
    pub fn open(&mut self, exchanger: &Exchanger) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        if self.rib.is_some() {
            // A second pass would rebuild the RIB after the iplist queue
            // was drained and teardown would no longer mirror install.
            return Err(Error::AlreadyOpen);
        }
        let remote = exchanger
            .remote_endpoint()
            .ok_or_else(|| Error::transmission("exchanger has no remote endpoint"))?;
        self.server_endpoint = Some(remote);

        let mut rib = Rib::new();
        for path in std::mem::take(&mut self.iplist_files) {
            if !rib.add_routes_from_iplist(&path, self.underlying_gateway) {
                warn!(path = %path.display(), "bypass list not loaded");
            }
        }
        if let SocketAddr::V4(v4) = remote {
            // The tunnel endpoint itself must never be routed back into
            // the tunnel.
            rib.add_route(*v4.ip(), 32, self.underlying_gateway);
        }
        rib.add_default_routes(self.tap.gateway());

        let fib = Fib::fill(&rib);
        info!(
            routes = rib.len(),
            available = fib.is_available(),
            "forwarding table compiled"
        );

        self.install_routes(&rib);
        self.rib = Some(Arc::new(rib));
        self.fib = Some(Arc::new(fib));
        Ok(())
    }

    fn install_routes(&mut self, rib: &Rib) {
        if self.routes_installed {
            return;
        }
        for entry in rib.entries() {
            if !self
                .routing
                .add_route(entry.destination, entry.prefix, entry.next_hop)
            {
                warn!(
                    destination = %entry.destination,
                    prefix = entry.prefix,
                    "route install failed"
                );
            }
        }
        let dns = self.tap.dns_addresses();
        let mask = u32::from(self.tap.netmask());
        let subnet = u32::from(self.tap.gateway()) & mask;
        for server in &dns {
            // Off-subnet resolvers need a pinned hop through the tunnel.
            if u32::from(*server) & mask != subnet
                && self.routing.add_route(*server, 32, self.tap.gateway())
            {
                self.dns_routes.push(*server);
            }
        }
        if !dns.is_empty() && !self.routing.set_dns(&dns) {
            warn!("dns redirection failed");
        }
        self.routes_installed = true;
    }

    fn uninstall_routes(&mut self) {
        if !self.routes_installed {
            return;
        }
        if let Some(rib) = &self.rib {
            for entry in rib.entries() {
                self.routing
                    .delete_route(entry.destination, entry.prefix, entry.next_hop);
            }
        }
        for server in std::mem::take(&mut self.dns_routes) {
            self.routing.delete_route(server, 32, self.tap.gateway());
        }
        self.routing.restore_dns();
        self.routes_installed = false;
    }

    /// Tear down the switcher and its exchanger in that order. Routes
    /// and DNS are reverted only if they were installed. Safe to call
    /// twice.
    pub fn dispose(&mut self, exchanger: &mut Exchanger) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        exchanger.dispose();
        self.uninstall_routes();
        self.rib = None;
        self.fib = None;
        self.pending = PendingIcmpTable::new();
        info!("switcher disposed");
    }

    /// Periodic driver: advances the exchanger's keep-alive machinery
    /// and reaps expired pending echoes.
    pub fn tick(&mut self, now: u64, exchanger: &mut Exchanger) -> bool {
        if self.disposed {
            return false;
        }
        exchanger.update(now);
        let dropped = self.pending.sweep(now);
        if dropped > 0 {
            debug!(dropped, "pending echoes expired without a reply");
        }
        true
    }

    /// Classify a frame read from the virtual interface. `false` means
    /// the packet is not tunnel traffic and the caller falls through to
    /// normal OS handling.
    pub fn on_packet_input(&mut self, data: &[u8], exchanger: &mut Exchanger, now: u64) -> bool {
        if self.disposed {
            return false;
        }
        let Some(ip) = IpFrame::parse(data) else {
            return false;
        };
        if matches!(ip.protocol, IpProtocol::Other(_)) {
            return false;
        }

        let destination = ip.destination;
        if destination == self.tap.ip_address() {
            return false;
        }

        let gw = self.tap.gateway();
        let mask = u32::from(self.tap.netmask());
        let in_subnet = |addr: Ipv4Addr| (u32::from(addr) & mask) == (u32::from(gw) & mask);
        if destination == gw && !in_subnet(self.tap.ip_address()) {
            return false;
        }
        if !in_subnet(destination) {
            return false;
        }

        match ip.protocol {
            IpProtocol::Udp => self.on_udp(&ip, exchanger, now),
            IpProtocol::Icmp => self.on_icmp(ip, exchanger, now),
            IpProtocol::Tcp => exchanger.nat(Bytes::copy_from_slice(data)),
            IpProtocol::Other(_) => false,
        }
    }

    fn on_udp(&mut self, ip: &IpFrame, exchanger: &mut Exchanger, now: u64) -> bool {
        let Some(frame) = UdpFrame::parse(ip) else {
            return false;
        };
        if frame.payload.is_empty() {
            return false;
        }
        if self.block_quic {
            let port = frame.destination.port();
            // QUIC rides UDP 80/443; dropping those datagrams outright
            // kills the handshake without inspecting payloads.
            if port == 443 || port == 80 {
                return false;
            }
        }
        exchanger.send_to(frame.source, frame.destination, frame.payload, now)
    }

    fn on_icmp(&mut self, mut ip: IpFrame, exchanger: &mut Exchanger, now: u64) -> bool {
        let Some(frame) = IcmpFrame::parse(&ip) else {
            return false;
        };
        if frame.ttl == 0 {
            return false;
        }

        let gw = self.tap.gateway();
        if frame.destination == gw {
            // The virtual gateway answers its own pings.
            let ttl = frame.ttl.saturating_sub(1).min(1);
            return self.emit_echo_reply(&frame, ttl);
        }
        if frame.ttl == 1 {
            // Expires at this hop; the gateway reports it locally.
            return self.emit_time_exceeded(&ip, &frame, gw);
        }

        // Decrement precedes every forwarding decision that reads it;
        // the parked frame carries the post-hop TTL.
        ip.ttl -= 1;
        let Some(ack_id) = self.pending.park(ip, now) else {
            warn!("acknowledgement id space exhausted, echo dropped");
            return false;
        };
        if exchanger.echo_id(ack_id) {
            true
        } else {
            // Send failed; the sweep must never see the entry.
            self.pending.remove(ack_id);
            false
        }
    }

    /// Remote echo reply correlation: consume the parked frame for
    /// `ack_id` and synthesize the response the originator expects.
    pub fn correlate_echo(&mut self, ack_id: u32) -> bool {
        if self.disposed || ack_id == 0 {
            return false;
        }
        let Some(original) = self.pending.remove(ack_id) else {
            return false;
        };
        let Some(frame) = IcmpFrame::parse(&original) else {
            return false;
        };
        if frame.destination == self.tap.gateway() {
            let ttl = frame.ttl.saturating_sub(1).max(1);
            self.emit_echo_reply(&frame, ttl)
        } else {
            self.emit_time_exceeded(&original, &frame, self.tap.gateway())
        }
    }

    fn emit_echo_reply(&self, frame: &IcmpFrame, ttl: u8) -> bool {
        let reply = IcmpFrame {
            icmp_type: IcmpType::EchoReply,
            code: frame.code,
            identifier: frame.identifier,
            sequence: frame.sequence,
            ttl,
            source: frame.destination,
            destination: frame.source,
            payload: frame.payload.clone(),
        };
        self.tap.output(&reply.to_ip().encode())
    }

    fn emit_time_exceeded(&self, original: &IpFrame, frame: &IcmpFrame, source: Ipv4Addr) -> bool {
        let reply = IcmpFrame {
            icmp_type: IcmpType::TimeExceeded,
            code: 0,
            identifier: 0,
            sequence: 0,
            ttl: u8::MAX,
            source,
            destination: frame.source,
            payload: original.encode(),
        };
        self.tap.output(&reply.to_ip().encode())
    }

    /// Deliver a tunneled raw IP frame back to the OS.
    pub fn inject(&mut self, packet: &[u8]) -> bool {
        if self.disposed {
            return false;
        }
        if IpFrame::parse(packet).is_none() {
            return false;
        }
        self.tap.output(packet)
    }

    /// Deliver a UDP NAT reply: rebuild the frame the local socket is
    /// waiting for (remote peer as source, original sender as
    /// destination) and inject it.
    pub fn datagram_output(
        &mut self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        payload: &[u8],
    ) -> bool {
        if self.disposed {
            return false;
        }
        let frame = UdpFrame {
            source: destination,
            destination: source,
            payload: Bytes::copy_from_slice(payload),
        };
        self.tap.output(&frame.to_ip(UDP_REPLY_TTL).encode())
    }

    /// Remote session report relayed by the exchanger.
    pub fn on_information(&mut self, info: &LinkInformation) {
        self.information = Some(*info);
        debug!(
            incoming = info.incoming_traffic,
            outgoing = info.outgoing_traffic,
            expires_at = info.expires_at,
            "link information"
        );
    }

    /// Whether `address` leaves via the physical interface instead of
    /// the tunnel. Only meaningful in promiscuous/shared mode with a
    /// compiled forwarding table.
    pub fn is_bypass(&self, address: Ipv4Addr) -> bool {
        if address.is_unspecified() || address.is_multicast() || address.is_broadcast() {
            return false;
        }
        if !self.tap.is_promisc() {
            return false;
        }
        let Some(fib) = &self.fib else {
            return false;
        };
        if !fib.is_available() {
            return false;
        }
        match fib.next_hop(address) {
            Some(hop) => hop != self.tap.gateway(),
            None => false,
        }
    }
}
