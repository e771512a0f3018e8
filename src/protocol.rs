//! Session-protocol messages exchanged with the remote peer.
//!
//! The engine speaks in opcoded messages; the byte layout on the wire is
//! the transmission collaborator's concern. `LinkMessage` is the in-memory
//! form both directions share.

use bytes::Bytes;
use std::net::SocketAddrV4;
use std::time::{SystemTime, UNIX_EPOCH};

/// Session-protocol opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Lan,
    Nat,
    Information,
    Push,
    Connect,
    ConnectOk,
    Disconnect,
    EchoId,
    EchoPayload,
    SendTo,
    FrpSendTo,
    FrpConnect,
    FrpDisconnect,
    FrpPush,
}

/// A message carried over the logical transmission channel.
#[derive(Debug, Clone)]
pub enum LinkMessage {
    /// Subnet/gateway announcement from the peer.
    Lan { ip: u32, mask: u32 },
    /// Tunneled raw IP packet for local injection.
    Nat { packet: Bytes },
    /// Remote session quota/bandwidth/expiry report.
    Information(LinkInformation),
    /// Per-connection NAT session payload.
    Push { connection_id: u32, packet: Bytes },
    /// Per-connection NAT session open.
    Connect {
        connection_id: u32,
        destination: SocketAddrV4,
    },
    /// Per-connection NAT session open acknowledgement.
    ConnectOk { connection_id: u32, error_code: u8 },
    /// Per-connection NAT session close.
    Disconnect { connection_id: u32 },
    /// Echo correlated by acknowledgement id (pending-ICMP path).
    EchoId { ack_id: u32 },
    /// Echo carrying a raw IP packet (direct passthrough / keep-alive).
    EchoPayload { packet: Bytes },
    /// UDP NAT datagram, both directions.
    SendTo {
        source: SocketAddrV4,
        destination: SocketAddrV4,
        packet: Bytes,
    },
    /// Reverse port-mapping datagram.
    FrpSendTo {
        inbound: bool,
        remote_port: u16,
        source: SocketAddrV4,
        packet: Bytes,
    },
    /// Reverse port-mapping stream open.
    FrpConnect {
        connection_id: u32,
        inbound: bool,
        remote_port: u16,
    },
    /// Reverse port-mapping stream close.
    FrpDisconnect {
        connection_id: u32,
        inbound: bool,
        remote_port: u16,
    },
    /// Reverse port-mapping stream payload.
    FrpPush {
        connection_id: u32,
        inbound: bool,
        remote_port: u16,
        packet: Bytes,
    },
}

impl LinkMessage {
    /// The opcode this message travels under.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Lan { .. } => Opcode::Lan,
            Self::Nat { .. } => Opcode::Nat,
            Self::Information(_) => Opcode::Information,
            Self::Push { .. } => Opcode::Push,
            Self::Connect { .. } => Opcode::Connect,
            Self::ConnectOk { .. } => Opcode::ConnectOk,
            Self::Disconnect { .. } => Opcode::Disconnect,
            Self::EchoId { .. } => Opcode::EchoId,
            Self::EchoPayload { .. } => Opcode::EchoPayload,
            Self::SendTo { .. } => Opcode::SendTo,
            Self::FrpSendTo { .. } => Opcode::FrpSendTo,
            Self::FrpConnect { .. } => Opcode::FrpConnect,
            Self::FrpDisconnect { .. } => Opcode::FrpDisconnect,
            Self::FrpPush { .. } => Opcode::FrpPush,
        }
    }
}

/// Remote session accounting as reported by the peer's Information message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkInformation {
    /// Remaining inbound traffic budget in bytes (0 = exhausted).
    pub incoming_traffic: u64,
    /// Remaining outbound traffic budget in bytes (0 = exhausted).
    pub outgoing_traffic: u64,
    /// Session expiry as unix seconds (0 = no expiry).
    pub expires_at: u64,
    /// Bandwidth ceiling in kbps (0 = unlimited).
    pub bandwidth: u32,
}

impl LinkInformation {
    /// A session is valid while traffic budget remains and the expiry
    /// time has not passed. An invalid session forces the transmission
    /// closed on the client side.
    pub fn is_valid(&self) -> bool {
        if self.incoming_traffic == 0 || self.outgoing_traffic == 0 {
            return false;
        }
        if self.expires_at == 0 {
            return true;
        }
        self.expires_at > unix_now()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_traffic_invalidates_session() {
        let info = LinkInformation {
            incoming_traffic: 0,
            outgoing_traffic: 10,
            expires_at: 0,
            bandwidth: 0,
        };
        assert!(!info.is_valid());
    }

    #[test]
    fn expired_session_is_invalid() {
        let info = LinkInformation {
            incoming_traffic: 1,
            outgoing_traffic: 1,
            expires_at: 1, // 1970
            bandwidth: 0,
        };
        assert!(!info.is_valid());
    }

    #[test]
    fn open_ended_session_is_valid() {
        let info = LinkInformation {
            incoming_traffic: 1,
            outgoing_traffic: 1,
            expires_at: 0,
            bandwidth: 128,
        };
        assert!(info.is_valid());
    }
}
