/*! RFC 1071 checksum helpers.

Lifted from the teacher's `wire::ip::checksum` (`src/wire/ip.rs`), extended
to cover the IPv6 pseudo-header alongside the original IPv4 one.
*/

use byteorder::{ByteOrder, NetworkEndian};
use std::net::IpAddr;

const fn propagate_carries(word: u32) -> u16 {
    let sum = (word >> 16) + (word & 0xffff);
    ((sum >> 16) as u16) + (sum as u16)
}

/// Compute an RFC 1071 compliant checksum (without the final complement).
pub fn data(mut data: &[u8]) -> u16 {
    let mut accum: u32 = 0;

    const CHUNK_SIZE: usize = 32;
    while data.len() >= CHUNK_SIZE {
        let mut d = &data[..CHUNK_SIZE];
        while d.len() >= 2 {
            accum += NetworkEndian::read_u16(d) as u32;
            d = &d[2..];
        }
        data = &data[CHUNK_SIZE..];
    }

    while data.len() >= 2 {
        accum += NetworkEndian::read_u16(data) as u32;
        data = &data[2..];
    }

    if let Some(&value) = data.first() {
        accum += (value as u32) << 8;
    }

    propagate_carries(accum)
}

/// Combine several RFC 1071 compliant checksums.
pub fn combine(checksums: &[u16]) -> u16 {
    let mut accum: u32 = 0;
    for &word in checksums {
        accum += word as u32;
    }
    propagate_carries(accum)
}

const TCP_NEXT_HEADER: u8 = 6;

fn pseudo_header_v4(src: &std::net::Ipv4Addr, dst: &std::net::Ipv4Addr, length: u32) -> u16 {
    let mut proto_len = [0u8; 4];
    proto_len[1] = TCP_NEXT_HEADER;
    NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

    combine(&[data(&src.octets()), data(&dst.octets()), data(&proto_len)])
}

fn pseudo_header_v6(src: &std::net::Ipv6Addr, dst: &std::net::Ipv6Addr, length: u32) -> u16 {
    let mut len_next = [0u8; 8];
    NetworkEndian::write_u32(&mut len_next[0..4], length);
    len_next[7] = TCP_NEXT_HEADER;

    combine(&[
        data(&src.octets()),
        data(&dst.octets()),
        data(&len_next),
    ])
}

/// Checksum of the TCP pseudo-header: source/destination address, protocol
/// number, and TCP segment length (header + payload).
pub fn pseudo_header(src: &IpAddr, dst: &IpAddr, length: u32) -> u16 {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => pseudo_header_v4(src, dst, length),
        (IpAddr::V6(src), IpAddr::V6(dst)) => pseudo_header_v6(src, dst, length),
        _ => unreachable!("mixed-family pseudo-header"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn zero_payload_checksum_is_zero() {
        assert_eq!(data(&[]), 0);
    }

    #[test]
    fn odd_length_payload_pads_last_byte() {
        let a = data(&[0x12]);
        let b = data(&[0x12, 0x00]);
        assert_eq!(a, b);
    }

    #[test]
    fn pseudo_header_v4_is_stable_for_same_input() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pseudo_header(&src, &dst, 40), pseudo_header(&src, &dst, 40));
        assert_ne!(pseudo_header(&src, &dst, 40), pseudo_header(&src, &dst, 41));
    }
}
