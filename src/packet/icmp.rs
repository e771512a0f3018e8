//! ICMP frame parsing and synthesis.
//!
//! The switcher only needs the three message kinds on the echo-emulation
//! path: echo request, echo reply and time-exceeded. Everything else parses
//! as `None` and falls through to default handling.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use super::checksum::checksum;
use super::{IpFrame, IpProtocol};

const ICMP_HEADER_LEN: usize = 8;

/// Longest ICMP body that still fits an IPv4 total length. Synthesized
/// time-exceeded messages embed the whole original packet and can
/// otherwise overflow the 16-bit field.
const MAX_BODY_LEN: usize = u16::MAX as usize - IpFrame::MIN_HEADER_LEN - ICMP_HEADER_LEN;

/// ICMP message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    EchoReply,
    EchoRequest,
    TimeExceeded,
}

impl IcmpType {
    pub fn number(self) -> u8 {
        match self {
            Self::EchoReply => 0,
            Self::EchoRequest => 8,
            Self::TimeExceeded => 11,
        }
    }

    fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::EchoReply),
            8 => Some(Self::EchoRequest),
            11 => Some(Self::TimeExceeded),
            _ => None,
        }
    }
}

/// An ICMP message derived from an [`IpFrame`].
///
/// `identifier`/`sequence` are meaningful for the echo kinds only; for
/// time-exceeded they are zero and `payload` embeds the original IP packet.
#[derive(Debug, Clone)]
pub struct IcmpFrame {
    pub icmp_type: IcmpType,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub ttl: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub payload: Bytes,
}

impl IcmpFrame {
    /// Parse the ICMP message carried by an IP frame.
    pub fn parse(ip: &IpFrame) -> Option<IcmpFrame> {
        if ip.protocol != IpProtocol::Icmp {
            return None;
        }

        let data = &ip.payload;
        if data.len() < ICMP_HEADER_LEN {
            return None;
        }

        let icmp_type = IcmpType::from_number(data[0])?;
        Some(IcmpFrame {
            icmp_type,
            code: data[1],
            identifier: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
            ttl: ip.ttl,
            source: ip.source,
            destination: ip.destination,
            payload: ip.payload.slice(ICMP_HEADER_LEN..),
        })
    }

    /// Wrap the message into a fresh IPv4 frame with a computed checksum.
    /// Bodies past [`MAX_BODY_LEN`] are truncated before the checksum so
    /// the emitted frame stays self-consistent.
    pub fn to_ip(&self) -> IpFrame {
        let body = if self.payload.len() > MAX_BODY_LEN {
            self.payload.slice(..MAX_BODY_LEN)
        } else {
            self.payload.clone()
        };
        let mut message = BytesMut::with_capacity(ICMP_HEADER_LEN + body.len());
        message.put_u8(self.icmp_type.number());
        message.put_u8(self.code);
        message.put_u16(0); // checksum placeholder
        message.put_u16(self.identifier);
        message.put_u16(self.sequence);
        message.put_slice(&body);

        let sum = checksum(&message);
        message[2..4].copy_from_slice(&sum.to_be_bytes());

        IpFrame {
            protocol: IpProtocol::Icmp,
            source: self.source,
            destination: self.destination,
            ttl: self.ttl,
            identification: 0,
            payload: message.freeze(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_request(ttl: u8) -> IpFrame {
        IcmpFrame {
            icmp_type: IcmpType::EchoRequest,
            code: 0,
            identifier: 0x4242,
            sequence: 7,
            ttl,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(10, 0, 0, 1),
            payload: Bytes::from_static(b"ping-data"),
        }
        .to_ip()
    }

    #[test]
    fn roundtrip_echo_request() {
        let wire = echo_request(5).encode();
        let ip = IpFrame::parse(&wire).unwrap();
        let icmp = IcmpFrame::parse(&ip).unwrap();
        assert_eq!(icmp.icmp_type, IcmpType::EchoRequest);
        assert_eq!(icmp.identifier, 0x4242);
        assert_eq!(icmp.sequence, 7);
        assert_eq!(icmp.payload.as_ref(), b"ping-data");
    }

    #[test]
    fn icmp_checksum_verifies() {
        let ip = echo_request(5);
        assert_eq!(checksum(&ip.payload), 0);
    }

    #[test]
    fn oversized_body_is_truncated_to_fit() {
        let frame = IcmpFrame {
            icmp_type: IcmpType::TimeExceeded,
            code: 0,
            identifier: 0,
            sequence: 0,
            ttl: 255,
            source: Ipv4Addr::new(10, 0, 0, 1),
            destination: Ipv4Addr::new(10, 0, 0, 2),
            payload: Bytes::from(vec![0x5A; 70_000]),
        };
        let wire = frame.to_ip().encode();
        assert_eq!(wire.len(), usize::from(u16::MAX));

        let ip = IpFrame::parse(&wire).unwrap();
        assert_eq!(checksum(&ip.payload), 0);
        let icmp = IcmpFrame::parse(&ip).unwrap();
        assert_eq!(icmp.payload.len(), MAX_BODY_LEN);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut ip = echo_request(5);
        let mut raw = ip.payload.to_vec();
        raw[0] = 13; // timestamp request, outside the emulated set
        ip.payload = Bytes::from(raw);
        assert!(IcmpFrame::parse(&ip).is_none());
    }
}
