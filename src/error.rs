/*! The error codes surfaced by control operations and packet-level rejects.

See `spec.md` §6/§7: control-surface calls return `Result<_, Error>` in place
of the C API's "zero on success, negative errno on failure" convention, and
per-packet rejects carry an `Error` alongside the returned buffer instead of
an out-of-band `rc[]` integer array.
*/

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A control operation was called with a nonsensical argument or in a
    /// phase that does not permit it.
    InvalidArgument,
    /// The context's stream pool has no free slot.
    PoolExhausted,
    /// The user operation bit for this call is already set on the stream.
    AlreadyInvoked,
    /// `send`/`recv`/`shutdown`/etc. called on a stream with no connection.
    NotConnected,
    /// The operation cannot complete without blocking; retry later.
    WouldBlock,
    /// No space left in a send/receive ring buffer.
    BufferExhausted,
    /// No stream or listener matches the inbound packet's four-tuple.
    NoSuchStream,
    /// The destination stream's receive buffer has no room for this segment.
    BufferFull,
    /// The inbound packet failed parsing or checksum validation.
    InvalidPacket,
}

impl Error {
    /// Short machine-stable tag, handy for log lines and test assertions.
    pub const fn tag(&self) -> &'static str {
        match self {
            Error::InvalidArgument => "invalid-argument",
            Error::PoolExhausted => "pool-exhausted",
            Error::AlreadyInvoked => "already-invoked",
            Error::NotConnected => "not-connected",
            Error::WouldBlock => "would-block",
            Error::BufferExhausted => "buffer-exhausted",
            Error::NoSuchStream => "no-such-stream",
            Error::BufferFull => "buffer-full",
            Error::InvalidPacket => "invalid-packet",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
