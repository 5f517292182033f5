/*! Packet representation: TCP segment parsing/emission, sequence-number
arithmetic, and the option codec (`spec.md` §4.1).

Out of scope for this crate (`spec.md` §1): L2 framing, ARP/neighbor
resolution, and IP header synthesis. The wire layer here only covers what
the TCP core itself must parse and emit — the TCP header, its options, and
the pseudo-header checksum that spans the IP addresses the device supplies.
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

pub mod checksum;
mod endpoint;
mod tcp;

pub use self::endpoint::{Address, Endpoint, ListenEndpoint};
pub use self::tcp::{
    Flags as TcpFlags, Packet as TcpPacket, Repr as TcpRepr, SeqNumber as TcpSeqNumber,
    TcpOption, TcpTimestampRepr, HEADER_LEN as TCP_HEADER_LEN,
};

use core::fmt;

/// Parsing a packet failed: either it is malformed, truncated, or its
/// checksum does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
