//! RFC 1071 internet checksum.

use std::net::Ipv4Addr;

/// Sum 16-bit big-endian words without folding.
fn sum_words(data: &[u8], mut acc: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        acc += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        acc += u32::from(u16::from_be_bytes([*last, 0]));
    }
    acc
}

fn fold(mut acc: u32) -> u16 {
    while acc > 0xFFFF {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    !(acc as u16)
}

/// Checksum over a single buffer (IP and ICMP headers).
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Checksum over a UDP segment including the IPv4 pseudo-header.
pub fn udp_checksum(source: Ipv4Addr, destination: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut acc = 0u32;
    acc = sum_words(&source.octets(), acc);
    acc = sum_words(&destination.octets(), acc);
    acc += 17; // protocol
    acc += segment.len() as u32;
    let sum = fold(sum_words(segment, acc));
    // An all-zero UDP checksum means "not computed" on the wire.
    if sum == 0 {
        0xFFFF
    } else {
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_known_header() {
        // Example header from RFC 1071 discussions, checksum field zeroed.
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xC0, 0xA8,
            0x00, 0x01, 0xC0, 0xA8, 0x00, 0xC7,
        ];
        assert_eq!(checksum(&header), 0xB861);
    }

    #[test]
    fn checksum_verifies_to_zero() {
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xB8, 0x61, 0xC0, 0xA8,
            0x00, 0x01, 0xC0, 0xA8, 0x00, 0xC7,
        ];
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn odd_length_tail_is_zero_padded() {
        assert_eq!(checksum(&[0xFF]), checksum(&[0xFF, 0x00]));
    }
}
