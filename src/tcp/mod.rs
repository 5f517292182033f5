/*! The per-stream TCP state machine (`spec.md` §3 "Stream", §4.5).

This is the core of the crate (~30% of the component budget, `spec.md`
§2). It owns the phase, the send/receive control blocks, the byte buffers,
and the listen-backlog extension, and exposes the primitive operations the
control surface (`crate::context`) and the RX/TX paths drive: segment
acceptance and ACK processing, segment emission, and timer expiry
reactions.

Grounded in the teacher's `socket::tcp::Socket` (`src/socket/tcp.rs`),
generalized in three ways the teacher's single-context, callback-free
design did not need: (1) a stream is referred to everywhere by its pool
index rather than owned outright, so timers and the listen backlog can
reference it without a borrow; (2) the listen backlog and accept-ready
queue `spec.md` §3/§4.5 require, absent from the teacher's one-socket-per-
listener model; (3) the tagged signal sinks (`crate::signal`) in place of
the teacher's lack of any notification mechanism.
*/

pub mod congestion;
pub mod machine;

use std::net::IpAddr;

use rustc_hash::FxHashMap;

use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::pkbuf::PacketBuffer;
use crate::signal::Sinks;
use crate::storage::{Assembler, RingBuffer};
use crate::table::FourTuple;
use crate::time::{Duration, Instant};
use crate::wire::{TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber as Seq, TcpTimestampRepr};

/// `spec.md` §3 "Phase".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl Phase {
    pub fn is_synchronized(&self) -> bool {
        !matches!(self, Phase::Closed | Phase::Listen | Phase::SynSent)
    }
}

/// User-operation bitmask (`spec.md` §3 "User-operation bitmask").
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UserOps(u8);

impl UserOps {
    pub const LISTEN: UserOps = UserOps(1 << 0);
    pub const ACCEPT: UserOps = UserOps(1 << 1);
    pub const CONNECT: UserOps = UserOps(1 << 2);
    pub const ESTABLISH: UserOps = UserOps(1 << 3);
    pub const SHUTDOWN: UserOps = UserOps(1 << 4);
    pub const CLOSE: UserOps = UserOps(1 << 5);
    pub const ABORT: UserOps = UserOps(1 << 6);

    pub fn contains(self, op: UserOps) -> bool {
        self.0 & op.0 == op.0
    }

    /// Set `op`, returning `Err(AlreadyInvoked)` if it was already set —
    /// `spec.md` §4.8: "rejecting duplicate invocation with `already
    /// invoked`."
    fn invoke(&mut self, op: UserOps) -> Result<()> {
        if self.contains(op) {
            return Err(Error::AlreadyInvoked);
        }
        self.0 |= op.0;
        Ok(())
    }
}

/// Remote-event bitmask (`spec.md` §3 "Remote-event bitmask").
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemoteEvents(u8);

impl RemoteEvents {
    pub const FIN: RemoteEvents = RemoteEvents(1 << 0);
    pub const RST: RemoteEvents = RemoteEvents(1 << 1);
    pub const RECV_TIMEOUT: RemoteEvents = RemoteEvents(1 << 2);
    pub const RTO_EXHAUSTED: RemoteEvents = RemoteEvents(1 << 3);

    pub fn set(&mut self, event: RemoteEvents) {
        self.0 |= event.0;
    }

    pub fn contains(self, event: RemoteEvents) -> bool {
        self.0 & event.0 == event.0
    }
}

/// A segment still awaiting acknowledgement, carried in the send buffer's
/// unacked-segment list (`spec.md` §3/§4.2).
#[derive(Debug, Clone, Copy)]
pub struct UnackedSegment {
    pub seq: Seq,
    pub len: usize,
    pub tx_tick: Instant,
    pub retx_count: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OptionsState {
    pub peer_mss: Option<usize>,
    pub mss: usize,
    pub wscale_local: Option<u8>,
    pub wscale_peer: Option<u8>,
    pub ts_enabled: bool,
    pub last_tsval: u32,
    pub last_tsecr: u32,
    pub last_ts_seen: Option<Instant>,
}

/// Send control block (`spec.md` §3 "Send control block").
#[derive(Debug, Clone)]
pub struct SendCb {
    pub una: Seq,
    pub nxt: Seq,
    pub wnd: usize,
    pub wl1: Seq,
    pub wl2: Seq,
    pub iss: Seq,
    pub congestion: congestion::Controller,
    pub dup_ack_count: u8,
    pub retx_count: u8,
    pub rto: Duration,
    pub srtt: Option<u32>,
    pub rttvar: Option<u32>,
    pub unacked: Vec<UnackedSegment>,
    pub fin_queued: bool,
    pub fin_sent: bool,
    pub fin_acked: bool,
    pub rtt_probe: Option<(Seq, Instant)>,
    /// Set on the third duplicate ACK; cleared once the RX path has emitted
    /// the actual resend of `snd.una`'s segment (`spec.md` §4.5 "fast
    /// retransmit resends snd.una's segment").
    pub fast_retransmit_pending: bool,
}

impl SendCb {
    fn new(iss: Seq, mss: usize, rto_initial: Duration) -> SendCb {
        SendCb {
            una: iss,
            nxt: iss,
            wnd: 0,
            wl1: Seq::new(0),
            wl2: Seq::new(0),
            iss,
            congestion: congestion::Controller::new(mss),
            dup_ack_count: 0,
            retx_count: 0,
            rto: rto_initial,
            srtt: None,
            rttvar: None,
            unacked: Vec::new(),
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            rtt_probe: None,
            fast_retransmit_pending: false,
        }
    }

    pub fn flight(&self) -> usize {
        self.nxt.diff(self.una).max(0) as usize
    }
}

/// Receive control block (`spec.md` §3 "Receive control block").
#[derive(Debug, Clone, Copy)]
pub struct RecvCb {
    pub nxt: Seq,
    pub irs: Seq,
}

/// Half-open SYN_RCVD shadow entry held in a listening stream's backlog —
/// `spec.md` §4.5 "Passive open", §9 "Listen backlog": lightweight, does
/// not consume a pool slot until promotion.
#[derive(Debug, Clone)]
pub struct ShadowEntry {
    pub tuple: FourTuple,
    pub iss: Seq,
    pub irs: Seq,
    pub peer_wnd: usize,
    pub options: OptionsState,
    pub syn_ack_tx_tick: Instant,
    pub retx_count: u8,
    pub rto: Duration,
}

/// The listen-only extension of a stream in `Phase::Listen`
/// (`spec.md` §3 "Listen extension").
#[derive(Debug, Default)]
pub struct ListenExt {
    pub backlog: FxHashMap<FourTuple, ShadowEntry>,
    pub ready: std::collections::VecDeque<crate::timer::StreamIndex>,
}

/// A single TCP endpoint: four-tuple (once bound) plus protocol state.
#[derive(Debug)]
pub struct Stream {
    pub local: Option<IpAddr>,
    pub local_port: u16,
    pub remote: Option<IpAddr>,
    pub remote_port: u16,
    pub phase: Phase,
    pub user_ops: UserOps,
    pub remote_events: RemoteEvents,
    pub send: SendCb,
    pub recv: RecvCb,
    pub options: OptionsState,
    pub send_buffer: RingBuffer<'static, u8>,
    pub recv_buffer: RingBuffer<'static, u8>,
    pub ooo: Assembler,
    pub listen: Option<ListenExt>,
    pub sinks: Sinks,
    pub user_data: u64,
    pub nb_retries: u8,
    /// Set when the user has called `close`: once the phase reaches
    /// CLOSED/TIME_WAIT the stream is torn down rather than left idle.
    pub destroy_on_close: bool,
    /// True for streams created via `establish(..., private=true)`: never
    /// inserted into the stream table (`spec.md` §4.5 "Establish shortcut").
    pub private: bool,
    pub device: crate::device::DeviceId,
    pub last_activity: Instant,
    pub challenge_ack_until: Instant,
    /// Nagle's algorithm (`spec.md` §4.5 supplement): when set, a segment
    /// smaller than the effective MSS is held back while unacknowledged
    /// data is already in flight, coalescing with whatever the caller
    /// writes next instead of trickling out one small packet per `send`.
    pub nagle: bool,
}

impl Stream {
    pub fn new(cfg: &ContextConfig, rx_capacity: usize, tx_capacity: usize) -> Stream {
        Stream {
            local: None,
            local_port: 0,
            remote: None,
            remote_port: 0,
            phase: Phase::Closed,
            user_ops: UserOps::default(),
            remote_events: RemoteEvents::default(),
            send: SendCb::new(Seq::new(0), cfg.default_mss, cfg.rto_initial),
            recv: RecvCb {
                nxt: Seq::new(0),
                irs: Seq::new(0),
            },
            options: OptionsState {
                mss: cfg.default_mss,
                ..Default::default()
            },
            send_buffer: RingBuffer::new(vec![0u8; tx_capacity]),
            recv_buffer: RingBuffer::new(vec![0u8; rx_capacity]),
            ooo: Assembler::new(),
            listen: None,
            sinks: Sinks::default(),
            user_data: 0,
            nb_retries: cfg.nb_retries,
            destroy_on_close: false,
            private: false,
            device: crate::device::DeviceId(0),
            last_activity: Instant::ZERO,
            challenge_ack_until: Instant::ZERO,
            nagle: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.phase, Phase::Closed | Phase::Listen)
    }

    pub fn four_tuple(&self) -> Option<FourTuple> {
        Some(FourTuple {
            local_addr: self.local?,
            local_port: self.local_port,
            remote_addr: self.remote?,
            remote_port: self.remote_port,
        })
    }

    /// Receive window advertised to the peer (`spec.md` §4.2), clamped to
    /// 16 bits before any window-scale shift — the shift is applied by the
    /// segment-emission path, not stored here.
    pub fn advertised_window(&self) -> u16 {
        let pending = self.recv_buffer.len() + self.ooo.len();
        let free = self.recv_buffer.capacity().saturating_sub(pending);
        free.min(u16::MAX as usize) as u16
    }

    fn local_wscale(&self) -> u32 {
        self.options.wscale_local.unwrap_or(0) as u32
    }

    fn peer_wscale(&self) -> u32 {
        self.options.wscale_peer.unwrap_or(0) as u32
    }

    // ---- user-operation bookkeeping -----------------------------------

    pub fn invoke(&mut self, op: UserOps) -> Result<()> {
        self.user_ops.invoke(op)
    }

    // ---- §4.5 "Data acceptance" ----------------------------------------

    /// `spec.md` §4.5: a segment is acceptable iff its sequence window
    /// overlaps `[rcv.nxt, rcv.nxt + rcv.wnd)`.
    pub fn is_acceptable(&self, seq: Seq, len: usize, rcv_wnd: usize) -> bool {
        let rcv_nxt = self.recv.nxt;
        if len == 0 {
            if rcv_wnd == 0 {
                return seq == rcv_nxt;
            }
            return seq >= rcv_nxt && seq.diff(rcv_nxt) < rcv_wnd as i32;
        }
        if rcv_wnd == 0 {
            return false;
        }
        let seg_end = seq.wrapping_add(len.saturating_sub(1));
        let in_window = |s: Seq| s.diff(rcv_nxt) >= 0 && s.diff(rcv_nxt) < rcv_wnd as i32;
        in_window(seq) || in_window(seg_end)
    }

    /// Deliver in-order bytes to the user-visible receive queue, folding in
    /// anything the out-of-order queue can now release. Returns the number
    /// of newly delivered bytes (used by the RX path to decide whether to
    /// arm the recv sink).
    pub fn deliver_in_order(&mut self, seq: Seq, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        if seq == self.recv.nxt {
            let n = self.recv_buffer.enqueue_slice(data);
            self.recv.nxt = self.recv.nxt.wrapping_add(n);
            delivered += n;
            // the tail we couldn't fit is itself out-of-order relative to
            // the new rcv.nxt; queue it like any other gap
            if n < data.len() {
                self.ooo.insert(self.recv.nxt, &data[n..], self.recv.nxt);
            }
        } else {
            // seq > rcv.nxt (acceptability already checked): queue it.
            if let Some(ready) = self.ooo.insert(seq, data, self.recv.nxt) {
                let n = self.recv_buffer.enqueue_slice(&ready);
                self.recv.nxt = self.recv.nxt.wrapping_add(n);
                delivered += n;
            }
            return delivered;
        }
        // folding: a segment that just arrived in-order might itself close
        // a gap the assembler was already holding further ahead.
        while let Some(ready) = self.ooo.try_release(self.recv.nxt) {
            let n = self.recv_buffer.enqueue_slice(&ready);
            self.recv.nxt = self.recv.nxt.wrapping_add(n);
            delivered += n;
        }
        delivered
    }

    // ---- §4.5 "ACK processing" ------------------------------------------

    pub fn is_duplicate_ack(&self, ack: Seq, window: usize, payload_len: usize) -> bool {
        payload_len == 0
            && ack == self.send.una
            && window == self.send.wnd
            && self.send.una != self.send.nxt
    }

    /// Release acknowledged bytes/segment records and run RTT/congestion
    /// bookkeeping. `spec.md` §4.2/§4.5/§4.3.
    pub fn process_new_ack(&mut self, ack: Seq, now: Instant) {
        let acked = ack.diff(self.send.una).max(0) as usize;
        if acked == 0 {
            return;
        }
        if self.send.fin_sent && !self.send.fin_acked && ack.diff(self.send.nxt) >= 0 {
            self.send.fin_acked = true;
        }
        let was_full = self.send_buffer.is_full();
        self.send_buffer.dequeue_allocated(acked.min(self.send_buffer.len()));
        if was_full && !self.send_buffer.is_full() {
            // `spec.md` §4.8: the send sink arms on the full -> non-full edge.
            self.sinks.arm_send();
        }
        self.send.una = ack;
        self.send.dup_ack_count = 0;
        self.send.retx_count = 0;

        let mut remaining = acked;
        self.send.unacked.retain_mut(|seg| {
            if remaining == 0 {
                return true;
            }
            if remaining >= seg.len {
                remaining -= seg.len;
                false
            } else {
                seg.seq = seg.seq.wrapping_add(remaining);
                seg.len -= remaining;
                remaining = 0;
                true
            }
        });

        // Karn's algorithm: only sample RTT for segments never retransmitted.
        if let Some((probe_seq, tx_tick)) = self.send.rtt_probe {
            if ack.diff(probe_seq) >= 0 {
                self.sample_rtt(now - tx_tick);
                self.send.rtt_probe = None;
            }
        }

        self.send.congestion.on_new_ack(acked);
    }

    fn sample_rtt(&mut self, sample: Duration) {
        let sample_ms = sample.total_millis() as u32;
        let (srtt, rttvar) = match (self.send.srtt, self.send.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = srtt.abs_diff(sample_ms);
                let rttvar = (rttvar * 3 + diff) / 4;
                let srtt = (srtt * 7 + sample_ms) / 8;
                (srtt, rttvar)
            }
            _ => (sample_ms, sample_ms / 2),
        };
        self.send.srtt = Some(srtt);
        self.send.rttvar = Some(rttvar);
        let rto_ms = (srtt + 4 * rttvar).max(1);
        self.send.rto = Duration::from_millis(rto_ms as u64);
    }

    pub fn clamp_rto(&mut self, min: Duration, max: Duration) {
        if self.send.rto < min {
            self.send.rto = min;
        } else if self.send.rto > max {
            self.send.rto = max;
        }
    }

    /// `spec.md` §9 supplement (RFC 5961 challenge-ACK rate limiting): fires
    /// at most once per `interval`; returns whether this call is the one
    /// that gets to emit.
    pub fn try_challenge_ack(&mut self, now: Instant, interval: Duration) -> bool {
        if now < self.challenge_ack_until {
            return false;
        }
        self.challenge_ack_until = now + interval;
        true
    }

    // ---- teardown --------------------------------------------------------

    /// `abort` (`spec.md` §4.5 "Close paths", §5 "Cancellation"): wipe both
    /// buffers and transition straight to CLOSED regardless of phase.
    pub fn abort(&mut self) {
        self.send_buffer.clear();
        self.recv_buffer.clear();
        self.ooo.clear();
        self.phase = Phase::Closed;
        self.invoke(UserOps::ABORT).ok();
        self.sinks.arm_err();
    }

    /// Protocol-terminal failure: RST received, or retransmission
    /// exhausted. `spec.md` §7 "Propagation".
    pub fn enter_terminal_error(&mut self, event: RemoteEvents) {
        self.phase = Phase::Closed;
        self.remote_events.set(event);
        self.sinks.arm_err();
    }

    // ---- §4.7 TX scheduling helpers --------------------------------------

    /// Effective send budget: `min(cwnd, peer_wnd) - in_flight`,
    /// `spec.md` §4.7.
    pub fn send_budget(&self) -> usize {
        let allowed = self.send.congestion.cwnd().min(self.send.wnd);
        allowed.saturating_sub(self.send.flight())
    }

    pub fn effective_mss(&self) -> usize {
        self.options.mss.max(1)
    }

    /// Build a control/data segment (no payload carving logic beyond what
    /// the caller already sliced) ready to hand to the device.
    #[allow(clippy::too_many_arguments)]
    pub fn build_segment(
        &self,
        flags: TcpFlags,
        seq: Seq,
        payload: &[u8],
        headroom: usize,
        checksum_offload: bool,
    ) -> PacketBuffer {
        let ack_number = if flags.ack() { Some(self.recv.nxt) } else { None };
        let repr = TcpRepr {
            src_port: self.local_port,
            dst_port: self.remote_port,
            flags,
            seq_number: seq,
            ack_number,
            window_len: self.advertised_window() >> self.local_wscale().min(14),
            window_scale: if flags.syn() { self.options.wscale_local } else { None },
            max_seg_size: if flags.syn() { Some(self.options.mss as u16) } else { None },
            timestamp: if self.options.ts_enabled || flags.syn() {
                Some(TcpTimestampRepr {
                    tsval: self.options.last_tsval,
                    tsecr: self.options.last_tsecr,
                })
            } else {
                None
            },
            payload_len: payload.len(),
        };

        let mut pkt = PacketBuffer::with_headroom(headroom);
        pkt.reserve_segment(repr.header_len() + payload.len());
        {
            let mut tcp_pkt = TcpPacket::new_unchecked(pkt.segment_mut());
            repr.emit(&mut tcp_pkt);
            tcp_pkt.payload_mut().copy_from_slice(payload);
            if !checksum_offload {
                if let (Some(src), Some(dst)) = (self.local, self.remote) {
                    tcp_pkt.fill_checksum(&src, &dst);
                }
                pkt.meta.checksum_computed = true;
            }
        }
        pkt.meta.l4_len = repr.header_len() as u16;
        pkt
    }

    /// Carve and build as many new-data/FIN segments as the send budget
    /// and queued bytes allow (`spec.md` §4.7 "TX scheduler"). Control
    /// segments born outside the byte-ring (SYN, RST, bare ACK, zero-window
    /// probe) are built separately by the caller via `build_segment`.
    pub fn poll_transmit(&mut self, now: Instant, headroom: usize, checksum_offload: bool) -> Vec<PacketBuffer> {
        let mut out = Vec::new();
        if !matches!(
            self.phase,
            Phase::Established | Phase::FinWait1 | Phase::CloseWait | Phase::Closing | Phase::LastAck
        ) {
            return out;
        }

        let mss = self.effective_mss();
        let mut offset = self.send.nxt.diff(self.send.una).max(0) as usize;
        let mut budget = self.send_budget();

        while budget > 0 && offset < self.send_buffer.len() {
            let seg_len = budget.min(mss).min(self.send_buffer.len() - offset);
            if seg_len == 0 {
                break;
            }
            // Nagle: a short segment (one that doesn't fill the MSS) waits
            // for more data to coalesce with rather than going out alone
            // while an earlier segment is still unacknowledged.
            if self.nagle && seg_len < mss && !self.send.unacked.is_empty() {
                break;
            }
            let mut payload = vec![0u8; seg_len];
            self.send_buffer.read_allocated(offset, &mut payload);
            let seq = self.send.nxt;
            out.push(self.build_segment(TcpFlags::ACK, seq, &payload, headroom, checksum_offload));
            self.send.unacked.push(UnackedSegment {
                seq,
                len: seg_len,
                tx_tick: now,
                retx_count: 0,
            });
            if self.send.rtt_probe.is_none() {
                self.send.rtt_probe = Some((seq.wrapping_add(seg_len), now));
            }
            self.send.nxt = self.send.nxt.wrapping_add(seg_len);
            offset += seg_len;
            budget -= seg_len;
        }

        let can_send_fin = matches!(self.phase, Phase::Established | Phase::CloseWait);
        if self.send.fin_queued
            && !self.send.fin_sent
            && can_send_fin
            && offset >= self.send_buffer.len()
        {
            let seq = self.send.nxt;
            out.push(self.build_segment(TcpFlags::ACK | TcpFlags::FIN, seq, &[], headroom, checksum_offload));
            self.send.nxt = self.send.nxt.wrapping_add(1);
            self.send.fin_sent = true;
            self.phase = match self.phase {
                Phase::Established => Phase::FinWait1,
                Phase::CloseWait => Phase::LastAck,
                other => other,
            };
        }

        out
    }

    /// `spec.md` §4.3 "Persist": a single byte drawn from the first unsent
    /// position in the send buffer, used to probe a zero peer window.
    pub fn build_zero_window_probe(&mut self, now: Instant, headroom: usize, checksum_offload: bool) -> Option<PacketBuffer> {
        let offset = self.send.nxt.diff(self.send.una).max(0) as usize;
        if offset >= self.send_buffer.len() {
            return None;
        }
        let mut byte = [0u8; 1];
        self.send_buffer.read_allocated(offset, &mut byte);
        let seq = self.send.nxt;
        let pkt = self.build_segment(TcpFlags::ACK, seq, &byte, headroom, checksum_offload);
        self.send.unacked.push(UnackedSegment {
            seq,
            len: 1,
            tx_tick: now,
            retx_count: 0,
        });
        self.send.nxt = self.send.nxt.wrapping_add(1);
        Some(pkt)
    }

    /// `spec.md` §4.5: "fast retransmit resends snd.una's segment" — drawn
    /// from the front of the send buffer, not re-carved at the current MSS,
    /// so a partial ACK of the retransmitted segment still lines up with the
    /// original unacked-segment record.
    pub fn take_fast_retransmit(&mut self, now: Instant, headroom: usize, checksum_offload: bool) -> Option<PacketBuffer> {
        if !self.send.fast_retransmit_pending {
            return None;
        }
        self.send.fast_retransmit_pending = false;
        let len = self
            .send
            .unacked
            .first()
            .map(|seg| seg.len)
            .unwrap_or(0)
            .min(self.send_buffer.len());
        if len == 0 {
            return None;
        }
        let seq = self.send.una;
        let mut payload = vec![0u8; len];
        self.send_buffer.read_allocated(0, &mut payload);
        if let Some(first) = self.send.unacked.first_mut() {
            first.retx_count += 1;
            first.tx_tick = now;
        }
        Some(self.build_segment(TcpFlags::ACK, seq, &payload, headroom, checksum_offload))
    }

    /// Peer window update, per RFC 793 §3.9 "SND.WND": only accepted when
    /// it does not go stale relative to an already-applied update.
    pub fn update_send_window(&mut self, seq: Seq, ack: Seq, window: usize) {
        let accept = self.send.wl1.diff(seq) < 0
            || (seq == self.send.wl1 && self.send.wl2.diff(ack) <= 0);
        if accept || self.send.wl1 == Seq::new(0) && self.send.wl2 == Seq::new(0) {
            self.send.wnd = window << self.peer_wscale().min(14);
            self.send.wl1 = seq;
            self.send.wl2 = ack;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        let cfg = ContextConfig::default();
        Stream::new(&cfg, 4096, 4096)
    }

    #[test]
    fn in_order_delivery_advances_rcv_nxt() {
        let mut s = stream();
        s.recv.nxt = Seq::new(100);
        let n = s.deliver_in_order(Seq::new(100), b"hello");
        assert_eq!(n, 5);
        assert_eq!(s.recv.nxt, Seq::new(105));
        let mut out = [0u8; 5];
        s.recv_buffer.dequeue_slice(&mut out);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn out_of_order_then_fill_releases_both() {
        let mut s = stream();
        s.recv.nxt = Seq::new(0);
        assert_eq!(s.deliver_in_order(Seq::new(5), b"world"), 0);
        assert_eq!(s.deliver_in_order(Seq::new(0), b"hello"), 10);
        assert_eq!(s.recv.nxt, Seq::new(10));
    }

    #[test]
    fn new_ack_releases_send_buffer_bytes() {
        let mut s = stream();
        s.send.una = Seq::new(0);
        s.send.nxt = Seq::new(10);
        s.send_buffer.enqueue_slice(&[0u8; 10]);
        s.send.unacked.push(UnackedSegment {
            seq: Seq::new(0),
            len: 10,
            tx_tick: Instant::ZERO,
            retx_count: 0,
        });
        s.process_new_ack(Seq::new(4), Instant::from_millis(10));
        assert_eq!(s.send.una, Seq::new(4));
        assert_eq!(s.send_buffer.len(), 6);
        assert_eq!(s.send.unacked[0].len, 6);
        assert_eq!(s.send.unacked[0].seq, Seq::new(4));
    }

    #[test]
    fn duplicate_ack_detection_requires_unchanged_window_and_pending_data() {
        let mut s = stream();
        s.send.una = Seq::new(0);
        s.send.nxt = Seq::new(10);
        s.send.wnd = 1000;
        assert!(s.is_duplicate_ack(Seq::new(0), 1000, 0));
        assert!(!s.is_duplicate_ack(Seq::new(0), 999, 0));
        assert!(!s.is_duplicate_ack(Seq::new(0), 1000, 5));
    }

    #[test]
    fn acceptability_window_check() {
        let mut s = stream();
        s.recv.nxt = Seq::new(100);
        assert!(s.is_acceptable(Seq::new(100), 10, 1000));
        assert!(!s.is_acceptable(Seq::new(1200), 10, 1000));
        assert!(s.is_acceptable(Seq::new(100), 0, 0));
        assert!(!s.is_acceptable(Seq::new(101), 0, 0));
    }

    #[test]
    fn abort_wipes_buffers_and_closes() {
        let mut s = stream();
        s.phase = Phase::Established;
        s.recv_buffer.enqueue_slice(&[1, 2, 3]);
        s.abort();
        assert_eq!(s.phase, Phase::Closed);
        assert!(s.recv_buffer.is_empty());
        assert!(s.ooo.is_empty());
    }
}
