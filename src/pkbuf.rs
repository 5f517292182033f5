/*! The packet buffer collaborator (`spec.md` §3 "Segment (internal)", §6
"Packet buffer").

The real substrate is a pool-backed mbuf; this crate only needs the shape
described in §6: reserved headroom for L2/L3/L4 headers, metadata slots for
header lengths/packet-type/checksum flags, and a cheap clone for
retransmission retention. Grounded in the teacher's `pkbuf::PacketBuffer`
(`src/pkbuf/mod.rs`), which likewise wraps an owned payload `Vec<u8>`; the
teacher's device-handle field is dropped here since device ownership is
modeled separately (`crate::device`).
*/

/// Per-packet metadata the RX/TX paths fill in and read back, standing in
/// for the header-length/packet-type/checksum-offload fields `spec.md` §6
/// requires of the opaque packet buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketMeta {
    pub l2_len: u16,
    pub l3_len: u16,
    pub l4_len: u16,
    /// Set by the device (or software fallback) once L3/L4 checksums have
    /// been verified on receive, or computed on transmit.
    pub checksum_verified: bool,
    pub checksum_computed: bool,
    /// Source/destination IP addresses resolved by the (out-of-scope) L3
    /// layer before the packet reaches `rx_bulk`, or to be filled in by it
    /// before `tx_bulk` hands the packet to the device. The TCP core needs
    /// these only for the four-tuple lookup and pseudo-header checksum —
    /// it never performs routing or address resolution itself.
    pub src_addr: Option<std::net::IpAddr>,
    pub dst_addr: Option<std::net::IpAddr>,
}

/// An owned packet buffer with reserved headroom.
///
/// `data` spans the whole allocation; `[0, head)` is headroom reserved for
/// L2/L3/L4 header synthesis performed by the device collaborator, and
/// `[head, data.len())` is the TCP segment (header + payload) this crate
/// produces or consumes.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    data: Vec<u8>,
    head: usize,
    pub meta: PacketMeta,
}

impl PacketBuffer {
    /// Allocate a buffer with `headroom` reserved bytes ahead of an
    /// initially empty segment region.
    pub fn with_headroom(headroom: usize) -> PacketBuffer {
        PacketBuffer {
            data: vec![0u8; headroom],
            head: headroom,
            meta: PacketMeta::default(),
        }
    }

    /// Wrap already-framed bytes (as delivered by `rx_bulk`), with no
    /// headroom reserved — the device has already stripped L2.
    pub fn from_segment(bytes: Vec<u8>) -> PacketBuffer {
        PacketBuffer {
            data: bytes,
            head: 0,
            meta: PacketMeta::default(),
        }
    }

    /// Grow the segment region by appending `extra` bytes (e.g. reserving
    /// room for a TCP header before the payload is known).
    pub fn reserve_segment(&mut self, len: usize) {
        self.data.resize(self.head + len, 0);
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn segment(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn segment_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    pub fn truncate_segment(&mut self, len: usize) {
        self.data.truncate(self.head + len);
    }

    /// Append payload bytes after the current segment content.
    pub fn extend_segment(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_addrs(mut self, src: std::net::IpAddr, dst: std::net::IpAddr) -> PacketBuffer {
        self.meta.src_addr = Some(src);
        self.meta.dst_addr = Some(dst);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headroom_is_excluded_from_segment() {
        let mut pb = PacketBuffer::with_headroom(14);
        assert_eq!(pb.len(), 0);
        pb.extend_segment(&[1, 2, 3]);
        assert_eq!(pb.segment(), &[1, 2, 3]);
        assert_eq!(pb.headroom(), 14);
    }

    #[test]
    fn clone_is_independent() {
        let mut a = PacketBuffer::with_headroom(0);
        a.extend_segment(&[9]);
        let b = a.clone();
        a.extend_segment(&[10]);
        assert_eq!(b.segment(), &[9]);
        assert_eq!(a.segment(), &[9, 10]);
    }
}
