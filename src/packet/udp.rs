//! UDP datagram parsing and reply synthesis.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddrV4;

use super::checksum::udp_checksum;
use super::{IpFrame, IpProtocol};

const UDP_HEADER_LEN: usize = 8;

/// Longest datagram body that keeps the UDP and IPv4 length fields in
/// range.
const MAX_BODY_LEN: usize = u16::MAX as usize - IpFrame::MIN_HEADER_LEN - UDP_HEADER_LEN;

/// A UDP datagram lifted out of an [`IpFrame`].
#[derive(Debug, Clone)]
pub struct UdpFrame {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub payload: Bytes,
}

impl UdpFrame {
    /// Parse the UDP header from an IP frame's payload.
    pub fn parse(ip: &IpFrame) -> Option<UdpFrame> {
        if ip.protocol != IpProtocol::Udp {
            return None;
        }

        let data = &ip.payload;
        if data.len() < UDP_HEADER_LEN {
            return None;
        }

        let length = usize::from(u16::from_be_bytes([data[4], data[5]]));
        if length < UDP_HEADER_LEN || length > data.len() {
            return None;
        }

        Some(UdpFrame {
            source: SocketAddrV4::new(ip.source, u16::from_be_bytes([data[0], data[1]])),
            destination: SocketAddrV4::new(ip.destination, u16::from_be_bytes([data[2], data[3]])),
            payload: ip.payload.slice(UDP_HEADER_LEN..length),
        })
    }

    /// Wrap the datagram into a fresh IPv4 frame. Bodies past
    /// [`MAX_BODY_LEN`] are truncated before the length and checksum are
    /// computed.
    pub fn to_ip(&self, ttl: u8) -> IpFrame {
        let body = if self.payload.len() > MAX_BODY_LEN {
            self.payload.slice(..MAX_BODY_LEN)
        } else {
            self.payload.clone()
        };
        let length = UDP_HEADER_LEN + body.len();
        let mut segment = BytesMut::with_capacity(length);
        segment.put_u16(self.source.port());
        segment.put_u16(self.destination.port());
        segment.put_u16(length as u16);
        segment.put_u16(0); // checksum placeholder
        segment.put_slice(&body);

        let sum = udp_checksum(*self.source.ip(), *self.destination.ip(), &segment);
        segment[6..8].copy_from_slice(&sum.to_be_bytes());

        IpFrame {
            protocol: IpProtocol::Udp,
            source: *self.source.ip(),
            destination: *self.destination.ip(),
            ttl,
            identification: 0,
            payload: segment.freeze(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample() -> UdpFrame {
        UdpFrame {
            source: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000),
            destination: SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 53),
            payload: Bytes::from_static(b"query"),
        }
    }

    #[test]
    fn to_ip_then_parse_preserves_endpoints() {
        let ip = sample().to_ip(64);
        let wire = ip.encode();
        let reparsed_ip = IpFrame::parse(&wire).unwrap();
        let udp = UdpFrame::parse(&reparsed_ip).unwrap();
        assert_eq!(udp.source, sample().source);
        assert_eq!(udp.destination, sample().destination);
        assert_eq!(udp.payload.as_ref(), b"query");
    }

    #[test]
    fn parse_rejects_non_udp_and_truncated() {
        let mut ip = sample().to_ip(64);
        ip.protocol = IpProtocol::Tcp;
        assert!(UdpFrame::parse(&ip).is_none());

        let bogus = IpFrame {
            protocol: IpProtocol::Udp,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(1, 1, 1, 1),
            ttl: 64,
            identification: 0,
            payload: Bytes::from_static(&[0, 1, 2]),
        };
        assert!(UdpFrame::parse(&bogus).is_none());
    }

    #[test]
    fn udp_length_field_bounds_payload() {
        // Declared length shorter than the carried bytes trims the payload.
        let mut segment = BytesMut::new();
        segment.put_u16(1111);
        segment.put_u16(2222);
        segment.put_u16(10); // header + 2 bytes
        segment.put_u16(0);
        segment.put_slice(b"abcdef");
        let ip = IpFrame {
            protocol: IpProtocol::Udp,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(1, 1, 1, 1),
            ttl: 64,
            identification: 0,
            payload: segment.freeze(),
        };
        let udp = UdpFrame::parse(&ip).unwrap();
        assert_eq!(udp.payload.as_ref(), b"ab");
    }
}
