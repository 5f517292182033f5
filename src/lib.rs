//! A userspace TCP endpoint library: connection state machine, RX demux,
//! TX scheduling, timer wheel, and send/receive buffering, sitting above an
//! opaque `Device` boundary. Routing, ARP, checksum offload negotiation and
//! the device substrate itself are out of scope; see `Device`/`PacketBuffer`
//! for the seam where a caller plugs those in.

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod pkbuf;
pub mod pool;
pub mod signal;
pub mod storage;
pub mod table;
pub mod tcp;
pub mod time;
pub mod timer;
pub mod wire;

pub use config::ContextConfig;
pub use context::{Context, EstablishParams, OpenParams, StreamState};
pub use device::{Device, DeviceCaps, DeviceId, VecDevice};
pub use error::{Error, Result};
pub use pkbuf::{PacketBuffer, PacketMeta};
pub use pool::StreamId;
pub use signal::{Callback, EventFlag, Sink, SinkKind};
pub use tcp::Phase;
pub use time::{Duration, Instant};
