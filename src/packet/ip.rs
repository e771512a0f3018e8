//! IPv4 frame parsing and synthesis.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use super::checksum::checksum;

/// Transport protocol carried by an IPv4 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    pub fn number(self) -> u8 {
        match self {
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Other(n) => n,
        }
    }
}

impl From<u8> for IpProtocol {
    fn from(n: u8) -> Self {
        match n {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            other => Self::Other(other),
        }
    }
}

/// A parsed IPv4 frame.
///
/// Options are accepted on parse but never carried over into synthesized
/// frames; all frames this engine emits use the minimal 20-byte header.
#[derive(Debug, Clone)]
pub struct IpFrame {
    pub protocol: IpProtocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub ttl: u8,
    pub identification: u16,
    pub payload: Bytes,
}

impl IpFrame {
    pub const MIN_HEADER_LEN: usize = 20;

    /// Parse an IPv4 frame. Returns `None` for truncated or non-v4 input.
    pub fn parse(data: &[u8]) -> Option<IpFrame> {
        if data.len() < Self::MIN_HEADER_LEN {
            return None;
        }

        let version = data[0] >> 4;
        if version != 4 {
            return None;
        }

        let header_len = usize::from(data[0] & 0x0F) * 4;
        if header_len < Self::MIN_HEADER_LEN || data.len() < header_len {
            return None;
        }

        let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if total_len < header_len || total_len > data.len() {
            return None;
        }

        Some(IpFrame {
            protocol: IpProtocol::from(data[9]),
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            ttl: data[8],
            identification: u16::from_be_bytes([data[4], data[5]]),
            payload: Bytes::copy_from_slice(&data[header_len..total_len]),
        })
    }

    /// Serialize to a full IPv4 packet with a freshly computed checksum.
    /// A payload past the 16-bit total-length limit is truncated so the
    /// header can never claim a shorter packet than it carries.
    pub fn encode(&self) -> Bytes {
        let room = usize::from(u16::MAX) - Self::MIN_HEADER_LEN;
        let payload = if self.payload.len() > room {
            self.payload.slice(..room)
        } else {
            self.payload.clone()
        };
        let total_len = Self::MIN_HEADER_LEN + payload.len();
        let mut buf = BytesMut::with_capacity(total_len);

        buf.put_u8(0x45); // version 4, IHL 5
        buf.put_u8(0);
        buf.put_u16(total_len as u16);
        buf.put_u16(self.identification);
        buf.put_u16(0); // flags + fragment offset
        buf.put_u8(self.ttl);
        buf.put_u8(self.protocol.number());
        buf.put_u16(0); // checksum placeholder
        buf.put_slice(&self.source.octets());
        buf.put_slice(&self.destination.octets());

        let sum = checksum(&buf[..Self::MIN_HEADER_LEN]);
        buf[10..12].copy_from_slice(&sum.to_be_bytes());

        buf.put_slice(&payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_short_and_non_v4() {
        assert!(IpFrame::parse(&[0x45; 10]).is_none());
        let mut v6 = [0u8; 40];
        v6[0] = 0x60;
        assert!(IpFrame::parse(&v6).is_none());
    }

    #[test]
    fn encode_parse_roundtrip() {
        let frame = IpFrame {
            protocol: IpProtocol::Udp,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(8, 8, 8, 8),
            ttl: 64,
            identification: 0x1234,
            payload: Bytes::from_static(b"payload"),
        };
        let wire = frame.encode();
        let parsed = IpFrame::parse(&wire).unwrap();
        assert_eq!(parsed.protocol, IpProtocol::Udp);
        assert_eq!(parsed.source, frame.source);
        assert_eq!(parsed.destination, frame.destination);
        assert_eq!(parsed.ttl, 64);
        assert_eq!(parsed.payload, frame.payload);
    }

    #[test]
    fn encoded_header_checksum_verifies() {
        let frame = IpFrame {
            protocol: IpProtocol::Icmp,
            source: Ipv4Addr::new(192, 168, 0, 1),
            destination: Ipv4Addr::new(192, 168, 0, 199),
            ttl: 1,
            identification: 0,
            payload: Bytes::new(),
        };
        let wire = frame.encode();
        assert_eq!(super::super::checksum::checksum(&wire[..20]), 0);
    }

    #[test]
    fn parse_honors_header_length_options() {
        // 24-byte header (IHL=6) with 4 bytes of options and 2 bytes payload.
        let mut packet = vec![0u8; 26];
        packet[0] = 0x46;
        packet[2..4].copy_from_slice(&26u16.to_be_bytes());
        packet[8] = 10;
        packet[9] = 17;
        packet[24] = 0xAB;
        packet[25] = 0xCD;
        let parsed = IpFrame::parse(&packet).unwrap();
        assert_eq!(parsed.payload.as_ref(), &[0xAB, 0xCD]);
    }
}
