/*! TCP segment wire format: header parsing/emission, flags, and the option
codec (`spec.md` §4.1, §6 "Wire format").

Styled after the teacher's `wire::udp` packet wrapper (`src/wire/udp.rs`):
a thin `Packet<T>` accessor over a raw buffer plus a `Repr` that captures
the parsed, validated representation. `mod tcp` exists in the teacher's own
`wire/mod.rs` only as a commented-out stub (`// mod tcp; ...`); this module
is the real thing, grounded in that stub's naming (`Control`, `TcpOption`,
`SeqNumber`, `HEADER_LEN`) and in RFC 793/1323/2018's wire layout.
*/

use byteorder::{ByteOrder, NetworkEndian};
use core::{cmp, fmt, ops};

use super::field::{Field, Rest};
use super::{checksum, Error, Result};
use std::net::IpAddr;

/// A 32-bit TCP sequence number with wrapped (modular) ordering.
///
/// `spec.md` §4.1: "Sequence comparisons use wrapped 32-bit ordering:
/// `a < b` iff `(int32_t)(a - b) < 0`."
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    pub const fn new(value: u32) -> SeqNumber {
        SeqNumber(value)
    }

    pub fn wrapping_add(self, delta: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(delta as u32))
    }

    pub fn wrapping_sub(self, delta: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(delta as u32))
    }

    /// `self - other` in wrapped 32-bit arithmetic (`spec.md` §4.1):
    /// positive when `self` is ahead of `other`, assuming the two are
    /// within 2^31 of each other.
    pub fn diff(self, other: SeqNumber) -> i32 {
        (self.0.wrapping_sub(other.0)) as i32
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;
    fn add(self, rhs: usize) -> SeqNumber {
        self.wrapping_add(rhs)
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;
    fn sub(self, rhs: usize) -> SeqNumber {
        self.wrapping_sub(rhs)
    }
}

impl ops::Sub<SeqNumber> for SeqNumber {
    type Output = i32;
    fn sub(self, rhs: SeqNumber) -> i32 {
        (self.0.wrapping_sub(rhs.0)) as i32
    }
}

impl PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNumber {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        let diff = (self.0.wrapping_sub(other.0)) as i32;
        diff.cmp(&0)
    }
}

/// Control bits present in the TCP header. Stored as the raw byte so
/// unrecognized bits (ECE/CWR/NS) survive a parse-then-emit round-trip.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const FIN: Flags = Flags(0x01);
    pub const SYN: Flags = Flags(0x02);
    pub const RST: Flags = Flags(0x04);
    pub const PSH: Flags = Flags(0x08);
    pub const ACK: Flags = Flags(0x10);
    pub const URG: Flags = Flags(0x20);
    pub const NONE: Flags = Flags(0x00);

    pub const fn from_bits(bits: u8) -> Flags {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn syn(self) -> bool {
        self.contains(Self::SYN)
    }
    pub const fn ack(self) -> bool {
        self.contains(Self::ACK)
    }
    pub const fn fin(self) -> bool {
        self.contains(Self::FIN)
    }
    pub const fn rst(self) -> bool {
        self.contains(Self::RST)
    }
    pub const fn psh(self) -> bool {
        self.contains(Self::PSH)
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// A parsed TCP timestamp option pair, per RFC 7323.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTimestampRepr {
    pub tsval: u32,
    pub tsecr: u32,
}

/// A single parsed TCP option (`spec.md` §4.1/§6: "options limited to MSS,
/// window-scale, timestamp, end/noop").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    Timestamp(TcpTimestampRepr),
}

impl TcpOption {
    fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList | TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::Timestamp(_) => 10,
        }
    }

    fn emit(&self, buffer: &mut [u8]) -> usize {
        let len = self.buffer_len();
        match *self {
            TcpOption::EndOfList => buffer[0] = 0,
            TcpOption::NoOperation => buffer[0] = 1,
            TcpOption::MaxSegmentSize(mss) => {
                buffer[0] = 2;
                buffer[1] = 4;
                NetworkEndian::write_u16(&mut buffer[2..4], mss);
            }
            TcpOption::WindowScale(scale) => {
                buffer[0] = 3;
                buffer[1] = 3;
                buffer[2] = scale;
            }
            TcpOption::Timestamp(TcpTimestampRepr { tsval, tsecr }) => {
                buffer[0] = 8;
                buffer[1] = 10;
                NetworkEndian::write_u32(&mut buffer[2..6], tsval);
                NetworkEndian::write_u32(&mut buffer[6..10], tsecr);
            }
        }
        len
    }

    /// Parse a single option from the head of `data`, returning the option
    /// (or `None` for a pad byte) and the remaining unparsed tail.
    ///
    /// Unknown options are skipped by their length byte. A malformed option
    /// (truncated, or a zero/overlong length) fails the whole segment, per
    /// `spec.md` §4.1.
    fn parse(data: &[u8]) -> Result<(&[u8], Option<TcpOption>)> {
        let (length, option);
        match *data.first().ok_or(Error)? {
            0 => {
                length = 1;
                option = Some(TcpOption::EndOfList);
            }
            1 => {
                length = 1;
                option = Some(TcpOption::NoOperation);
            }
            kind => {
                length = *data.get(1).ok_or(Error)? as usize;
                if length < 2 || length > data.len() {
                    return Err(Error);
                }
                let body = &data[2..length];
                option = match (kind, length) {
                    (2, 4) => Some(TcpOption::MaxSegmentSize(NetworkEndian::read_u16(body))),
                    (3, 3) => Some(TcpOption::WindowScale(body[0])),
                    (8, 10) => Some(TcpOption::Timestamp(TcpTimestampRepr {
                        tsval: NetworkEndian::read_u32(&body[0..4]),
                        tsecr: NetworkEndian::read_u32(&body[4..8]),
                    })),
                    // Unknown option kind: skip by its length byte.
                    (_, _) => None,
                };
            }
        }
        Ok((&data[length..], option))
    }
}

mod field {
    #![allow(non_snake_case)]

    use super::Field;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WINDOW: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub fn OPTIONS(data_offset: u8) -> Field {
        URGENT.end..(data_offset as usize * 4)
    }

    pub fn PAYLOAD(data_offset: u8) -> super::Rest {
        (data_offset as usize * 4)..
    }
}

pub const HEADER_LEN: usize = field::URGENT.end;

/// A read/write wrapper around a TCP segment buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error);
        }
        let data_offset = self.data_offset();
        if (data_offset as usize) < 5 || len < data_offset as usize * 4 {
            return Err(Error);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::SEQ_NUM]))
    }

    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::ACK_NUM]))
    }

    pub fn data_offset(&self) -> u8 {
        self.buffer.as_ref()[field::FLAGS.start] >> 4
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits(self.buffer.as_ref()[field::FLAGS.start + 1] & 0x3f)
    }

    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WINDOW])
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    pub fn urgent_at(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::URGENT])
    }

    pub fn options(&self) -> &[u8] {
        &self.buffer.as_ref()[field::OPTIONS(self.data_offset())]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[field::PAYLOAD(self.data_offset())]
    }

    /// Validate the checksum against the supplied pseudo-header endpoints.
    pub fn verify_checksum(&self, src: &IpAddr, dst: &IpAddr) -> bool {
        let data = self.buffer.as_ref();
        let combined = checksum::combine(&[
            checksum::pseudo_header(src, dst, data.len() as u32),
            checksum::data(data),
        ]);
        combined == 0xffff
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC_PORT], value);
    }

    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST_PORT], value);
    }

    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::SEQ_NUM], value.0);
    }

    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::ACK_NUM], value.0);
    }

    pub fn set_data_offset(&mut self, value: u8) {
        let byte = &mut self.buffer.as_mut()[field::FLAGS.start];
        *byte = (*byte & 0x0f) | (value << 4);
    }

    pub fn set_flags(&mut self, flags: Flags) {
        let byte = &mut self.buffer.as_mut()[field::FLAGS.start + 1];
        *byte = (*byte & 0xc0) | flags.bits();
    }

    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::WINDOW], value);
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value);
    }

    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::URGENT], value);
    }

    pub fn options_mut(&mut self) -> &mut [u8] {
        let range = field::OPTIONS(self.data_offset());
        &mut self.buffer.as_mut()[range]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let range = field::PAYLOAD(self.data_offset());
        &mut self.buffer.as_mut()[range]
    }

    /// Compute and fill in the checksum field from the given pseudo-header
    /// endpoints, leaving the checksum field itself zeroed during the sum.
    pub fn fill_checksum(&mut self, src: &IpAddr, dst: &IpAddr) {
        self.set_checksum(0);
        let data_len = self.buffer.as_ref().len() as u32;
        let checksum = !checksum::combine(&[
            checksum::pseudo_header(src, dst, data_len),
            checksum::data(self.buffer.as_ref()),
        ]);
        self.set_checksum(if checksum == 0 { 0xffff } else { checksum });
    }
}

/// A high-level representation of a TCP segment header, independent of a
/// backing buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: Flags,
    pub seq_number: SeqNumber,
    /// Present iff `flags.ack()`.
    pub ack_number: Option<SeqNumber>,
    pub window_len: u16,
    pub window_scale: Option<u8>,
    pub max_seg_size: Option<u16>,
    pub timestamp: Option<TcpTimestampRepr>,
    pub payload_len: usize,
}

impl Repr {
    /// Parse a TCP segment's header (not its payload) out of `packet`.
    pub fn parse(packet: &Packet<&[u8]>, src: &IpAddr, dst: &IpAddr) -> Result<Repr> {
        packet.check_len()?;
        if !packet.verify_checksum(src, dst) {
            return Err(Error);
        }
        Self::parse_fields(packet)
    }

    /// Parse without re-verifying the checksum: used when the device has
    /// already confirmed it via offload (`PacketMeta::checksum_verified`).
    pub fn parse_trusting_checksum(packet: &Packet<&[u8]>) -> Result<Repr> {
        packet.check_len()?;
        Self::parse_fields(packet)
    }

    fn parse_fields(packet: &Packet<&[u8]>) -> Result<Repr> {
        let flags = packet.flags();
        let ack_number = if flags.ack() {
            Some(packet.ack_number())
        } else {
            None
        };

        let mut max_seg_size = None;
        let mut window_scale = None;
        let mut timestamp = None;

        let mut options = packet.options();
        while !options.is_empty() {
            let (rest, option) = TcpOption::parse(options)?;
            match option {
                Some(TcpOption::EndOfList) => break,
                Some(TcpOption::NoOperation) => {}
                Some(TcpOption::MaxSegmentSize(mss)) => max_seg_size = Some(mss),
                Some(TcpOption::WindowScale(scale)) => window_scale = Some(scale),
                Some(TcpOption::Timestamp(ts)) => timestamp = Some(ts),
                None => {}
            }
            options = rest;
        }

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            flags,
            seq_number: packet.seq_number(),
            ack_number,
            window_len: packet.window_len(),
            window_scale,
            max_seg_size,
            timestamp,
            payload_len: packet.payload().len(),
        })
    }

    /// Length of the header once emitted, including options, rounded up to
    /// a multiple of 4 bytes (not including the payload).
    pub fn header_len(&self) -> usize {
        let mut options_len = 0;
        if self.max_seg_size.is_some() {
            options_len += TcpOption::MaxSegmentSize(0).buffer_len();
        }
        if self.window_scale.is_some() {
            options_len += TcpOption::WindowScale(0).buffer_len() + 1; // + NOP pad
        }
        if self.timestamp.is_some() {
            options_len += TcpOption::Timestamp(TcpTimestampRepr { tsval: 0, tsecr: 0 }).buffer_len();
        }
        HEADER_LEN + ((options_len + 3) / 4) * 4
    }

    /// Emit this representation's header (and options) into `packet`,
    /// leaving `packet.payload_mut()` for the caller to fill and the
    /// checksum unset — call `fill_checksum` afterwards.
    pub fn emit(&self, packet: &mut Packet<&mut [u8]>) {
        let header_len = self.header_len();
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_data_offset((header_len / 4) as u8);
        packet.set_flags(self.flags);
        packet.set_window_len(self.window_len);
        packet.set_urgent_at(0);

        let options = packet.options_mut();
        let mut offset = 0;
        if let Some(mss) = self.max_seg_size {
            offset += TcpOption::MaxSegmentSize(mss).emit(&mut options[offset..]);
        }
        if let Some(scale) = self.window_scale {
            offset += TcpOption::NoOperation.emit(&mut options[offset..]);
            offset += TcpOption::WindowScale(scale).emit(&mut options[offset..]);
        }
        if let Some(ts) = self.timestamp {
            offset += TcpOption::Timestamp(ts).emit(&mut options[offset..]);
        }
        for byte in &mut options[offset..] {
            *byte = 1; // pad with NOPs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoints() -> (IpAddr, IpAddr) {
        (
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2)),
        )
    }

    #[test]
    fn seq_number_wraps_correctly() {
        let a = SeqNumber::new(0xffff_fff0);
        let b = a.wrapping_add(32);
        assert!(a < b);
        assert_eq!(b.diff(a), 32);
        assert_eq!(a.diff(b), -32);
    }

    #[test]
    fn emit_then_parse_roundtrips_syn_options() {
        let (src, dst) = endpoints();
        let repr = Repr {
            src_port: 1000,
            dst_port: 80,
            flags: Flags::SYN,
            seq_number: SeqNumber::new(1000),
            ack_number: None,
            window_len: 65535,
            window_scale: Some(7),
            max_seg_size: Some(1460),
            timestamp: Some(TcpTimestampRepr {
                tsval: 42,
                tsecr: 0,
            }),
            payload_len: 0,
        };

        let mut buffer = vec![0u8; repr.header_len()];
        {
            let mut packet = Packet::new_unchecked(&mut buffer[..]);
            repr.emit(&mut packet);
            packet.fill_checksum(&src, &dst);
        }

        let packet = Packet::new_checked(&buffer[..]).unwrap();
        let parsed = Repr::parse(&packet, &src, &dst).unwrap();
        assert_eq!(parsed.max_seg_size, Some(1460));
        assert_eq!(parsed.window_scale, Some(7));
        assert_eq!(parsed.timestamp.unwrap().tsval, 42);
        assert!(parsed.flags.syn());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let (src, dst) = endpoints();
        let repr = Repr {
            src_port: 1,
            dst_port: 2,
            flags: Flags::ACK,
            seq_number: SeqNumber::new(5),
            ack_number: Some(SeqNumber::new(6)),
            window_len: 100,
            window_scale: None,
            max_seg_size: None,
            timestamp: None,
            payload_len: 0,
        };
        let mut buffer = vec![0u8; repr.header_len()];
        {
            let mut packet = Packet::new_unchecked(&mut buffer[..]);
            repr.emit(&mut packet);
            packet.fill_checksum(&src, &dst);
        }
        buffer[0] ^= 0xff;
        let packet = Packet::new_checked(&buffer[..]).unwrap();
        assert!(Repr::parse(&packet, &src, &dst).is_err());
    }

    #[test]
    fn unknown_option_is_skipped() {
        // kind=253 (experimental), length=4, two bytes of data.
        let data = [253u8, 4, 0xaa, 0xbb, 0u8, 0u8];
        let (rest, opt) = TcpOption::parse(&data).unwrap();
        assert!(opt.is_none());
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn truncated_option_is_malformed() {
        let data = [2u8, 4, 0x05]; // claims length 4 but only 1 data byte follows
        assert!(TcpOption::parse(&data).is_err());
    }
}
