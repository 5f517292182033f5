/*! The device collaborator (`spec.md` §6 "Device collaborator").

Modeled on the teacher's own `phy::Device` (`src/phy/mod.rs`): an MTU and
capability query plus an egress staging ring, rather than the teacher's
token-based single-packet send/receive tied to the raw L2 substrate (that
substrate's framing is explicitly out of scope, `spec.md` §1). The core
only ever pushes finished segments and later drains them in batches.
*/

use std::collections::VecDeque;

use crate::pkbuf::PacketBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// Capability/limits the TX scheduler and option negotiation consult.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    pub mtu: usize,
    /// If true, the core leaves the checksum unfilled and sets
    /// `PacketMeta::checksum_computed = false`, trusting the device (or its
    /// NIC) to fill it in — `spec.md` §1 excludes offload *negotiation*
    /// logic, not the flag the core must still set to ask for it.
    pub checksum_offload: bool,
}

/// An outbound interface: MTU/capabilities plus a push/pop-batch egress
/// staging ring. Ingress is out of scope here — `rx_bulk` (§6) takes
/// already-dequeued packets as a caller-supplied slice, since the ring-I/O
/// side of ingress belongs to the raw packet-I/O substrate (`spec.md` §1).
pub trait Device {
    fn id(&self) -> DeviceId;
    fn capabilities(&self) -> DeviceCaps;

    /// Stage a finished segment for transmission. Called by the TX
    /// scheduler; never blocks, never fails — a device with a bounded ring
    /// is expected to size it for worst-case burst, matching `spec.md` §5
    /// "no operation blocks."
    fn push_egress(&mut self, pkt: PacketBuffer);

    /// Drain up to `max` staged segments into `out`, returning how many
    /// were moved. This is what `tx_bulk` (§4.7/§6) calls.
    fn pop_egress_batch(&mut self, out: &mut Vec<PacketBuffer>, max: usize) -> usize;

    fn egress_len(&self) -> usize;
}

/// An in-memory device used by tests and examples: a plain FIFO ring with
/// no underlying NIC. Mirrors the teacher's `phy::Loopback` test double.
#[derive(Debug)]
pub struct VecDevice {
    id: DeviceId,
    caps: DeviceCaps,
    egress: VecDeque<PacketBuffer>,
}

impl VecDevice {
    pub fn new(id: u32, mtu: usize) -> VecDevice {
        VecDevice {
            id: DeviceId(id),
            caps: DeviceCaps {
                mtu,
                checksum_offload: false,
            },
            egress: VecDeque::new(),
        }
    }
}

impl Device for VecDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn capabilities(&self) -> DeviceCaps {
        self.caps
    }

    fn push_egress(&mut self, pkt: PacketBuffer) {
        self.egress.push_back(pkt);
    }

    fn pop_egress_batch(&mut self, out: &mut Vec<PacketBuffer>, max: usize) -> usize {
        let n = max.min(self.egress.len());
        for _ in 0..n {
            out.push(self.egress.pop_front().unwrap());
        }
        n
    }

    fn egress_len(&self) -> usize {
        self.egress.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_batch_respects_max_and_fifo_order() {
        let mut dev = VecDevice::new(0, 1500);
        for i in 0..5u8 {
            dev.push_egress(PacketBuffer::from_segment(vec![i]));
        }
        let mut out = Vec::new();
        assert_eq!(dev.pop_egress_batch(&mut out, 3), 3);
        assert_eq!(out.iter().map(|p| p.segment()[0]).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(dev.egress_len(), 2);
    }
}
