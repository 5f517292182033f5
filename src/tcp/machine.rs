/*! Segment acceptance and phase transitions (`spec.md` §4.5).

Kept out of `tcp::mod` so the data model and the transition logic stay
separately readable, the way the teacher splits `socket::tcp::Socket`'s
state from its (absent-in-the-retrieved-pack, but implied) processing
methods. These functions take `&mut Stream` plus whatever external state
(timer wheel, config) the transition needs, rather than methods on
`Context`, so they stay testable without a whole pool/table/device set up.
*/

use log::{debug, warn};

use crate::config::ContextConfig;
use crate::time::Instant;
use crate::timer::{StreamIndex, TimerKind, TimerWheel};
use crate::wire::{TcpFlags as Flags, TcpRepr as Repr};

use super::{Phase, RemoteEvents, Stream};

/// What happened to a stream after processing one inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Segment accepted; an immediate ACK must be sent iff `true`.
    Accepted { immediate_ack: bool },
    /// Segment was not acceptable (outside the receive window); an ACK
    /// must still be sent per `spec.md` §4.5, unless it carried RST.
    Unacceptable { send_ack: bool },
    /// An acceptable RST dropped the connection.
    Reset,
    /// The stream transitioned fully to CLOSED/TIME_WAIT as a result of
    /// this segment (peer ACKed our FIN and no FIN of theirs is pending).
    Closed,
}

fn arm_retransmit_if_pending(idx: StreamIndex, stream: &Stream, timers: &mut TimerWheel, now: Instant) {
    if stream.send.una != stream.send.nxt || (stream.send.fin_sent && !stream.send.fin_acked) {
        timers.schedule(idx, TimerKind::Retransmit, now, now + stream.send.rto);
    } else {
        timers.cancel(idx, TimerKind::Retransmit);
    }
}

fn enter_time_wait(idx: StreamIndex, stream: &mut Stream, timers: &mut TimerWheel, cfg: &ContextConfig, now: Instant) {
    stream.phase = Phase::TimeWait;
    timers.cancel(idx, TimerKind::Retransmit);
    timers.cancel(idx, TimerKind::KeepAlive);
    timers.cancel(idx, TimerKind::Persist);
    timers.schedule(idx, TimerKind::TimeWait, now, now + cfg.msl * 2);
}

/// Process one inbound segment against a stream already in or entering a
/// synchronized phase (i.e. not LISTEN — the listen backlog is handled
/// separately in `context::handle_listen_segment`).
pub fn process_segment(
    idx: StreamIndex,
    stream: &mut Stream,
    repr: &Repr,
    payload: &[u8],
    now: Instant,
    cfg: &ContextConfig,
    timers: &mut TimerWheel,
) -> Outcome {
    stream.last_activity = now;

    match stream.phase {
        Phase::Closed | Phase::Listen => Outcome::Unacceptable { send_ack: false },

        Phase::SynSent => process_syn_sent(idx, stream, repr, now, cfg, timers),

        _ => process_synchronized(idx, stream, repr, payload, now, cfg, timers),
    }
}

fn process_syn_sent(
    idx: StreamIndex,
    stream: &mut Stream,
    repr: &Repr,
    now: Instant,
    cfg: &ContextConfig,
    timers: &mut TimerWheel,
) -> Outcome {
    if repr.flags.rst() {
        if repr.ack_number == Some(stream.send.nxt) {
            stream.enter_terminal_error(RemoteEvents::RST);
            timers.cancel_all(idx);
            return Outcome::Reset;
        }
        return Outcome::Unacceptable { send_ack: false };
    }

    if !repr.flags.syn() {
        return Outcome::Unacceptable { send_ack: false };
    }

    stream.recv.irs = repr.seq_number;
    stream.recv.nxt = repr.seq_number.wrapping_add(1);
    if let Some(mss) = repr.max_seg_size {
        stream.options.peer_mss = Some(mss as usize);
        stream.options.mss = stream.options.mss.min(mss as usize);
    }
    stream.send.congestion.set_mss(stream.options.mss);
    stream.options.wscale_peer = repr.window_scale;
    stream.send.wnd = repr.window_len as usize;

    match repr.ack_number {
        Some(ack) if ack == stream.send.nxt => {
            // Active open completes: our SYN was ACKed.
            stream.send.una = ack;
            stream.phase = Phase::Established;
            timers.cancel(idx, TimerKind::Retransmit);
            stream.sinks.arm_recv();
            debug!("stream#{idx}: SYN_SENT -> ESTABLISHED");
            Outcome::Accepted { immediate_ack: true }
        }
        Some(_) => Outcome::Unacceptable { send_ack: true },
        None => {
            // Simultaneous open: peer also sent a bare SYN.
            stream.phase = Phase::SynRcvd;
            arm_retransmit_if_pending(idx, stream, timers, now);
            Outcome::Accepted { immediate_ack: true }
        }
    }
}

fn process_synchronized(
    idx: StreamIndex,
    stream: &mut Stream,
    repr: &Repr,
    payload: &[u8],
    now: Instant,
    cfg: &ContextConfig,
    timers: &mut TimerWheel,
) -> Outcome {
    let rcv_wnd = stream.recv_buffer.window().saturating_sub(stream.ooo.len());
    if !stream.is_acceptable(repr.seq_number, payload.len(), rcv_wnd) {
        // RFC 5961 challenge-ACK rate limiting (`spec.md` §9 supplement):
        // an out-of-window RST/SYN is a potential blind-injection probe, so
        // at most one challenge ACK goes out per `challenge_ack_interval`
        // instead of one per packet. Ordinary out-of-window data segments
        // keep eliciting an ACK every time, per `spec.md` §4.5.
        if repr.flags.rst() || repr.flags.syn() {
            let emit = stream.try_challenge_ack(now, cfg.challenge_ack_interval);
            return Outcome::Unacceptable { send_ack: emit };
        }
        return Outcome::Unacceptable { send_ack: true };
    }

    if repr.flags.rst() {
        stream.enter_terminal_error(RemoteEvents::RST);
        timers.cancel_all(idx);
        return Outcome::Reset;
    }

    // RFC 793 simultaneous-open SYN-in-window guard: treat as a challenge
    // condition rather than tearing the connection down silently, itself
    // rate-limited the same way (`spec.md` §9 supplement).
    if repr.flags.syn() {
        let emit = stream.try_challenge_ack(now, cfg.challenge_ack_interval);
        return Outcome::Accepted { immediate_ack: emit };
    }

    let mut immediate_ack = false;

    if let Some(ack) = repr.ack_number {
        if ack.diff(stream.send.una) > 0 && ack.diff(stream.send.nxt) <= 0 {
            stream.process_new_ack(ack, now);
            stream.update_send_window(repr.seq_number, ack, repr.window_len as usize);
        } else if stream.is_duplicate_ack(ack, repr.window_len as usize, payload.len()) {
            stream.send.dup_ack_count += 1;
            if stream.send.dup_ack_count == 3 {
                stream.send.congestion.on_fast_retransmit(stream.send.flight());
                stream.send.fast_retransmit_pending = true;
                debug!("stream#{idx}: 3rd duplicate ACK, fast retransmit armed");
            }
        }
    }

    let delivered = stream.deliver_in_order(repr.seq_number, payload);
    if delivered > 0 {
        stream.sinks.arm_recv();
        timers.schedule(idx, TimerKind::DelayedAck, now, now + cfg.delayed_ack);
    }
    if !stream.ooo.is_empty() || payload.is_empty() && repr.flags.fin() {
        immediate_ack = true;
        timers.cancel(idx, TimerKind::DelayedAck);
    }
    if stream.recv_buffer.is_full() {
        immediate_ack = true;
    }

    if repr.flags.fin() {
        stream.remote_events.set(RemoteEvents::FIN);
        stream.recv.nxt = stream.recv.nxt.wrapping_add(1);
        stream.sinks.arm_recv();
        immediate_ack = true;
        timers.cancel(idx, TimerKind::DelayedAck);

        stream.phase = match stream.phase {
            Phase::SynRcvd | Phase::Established => Phase::CloseWait,
            Phase::FinWait1 if stream.send.fin_acked => {
                enter_time_wait(idx, stream, timers, cfg, now);
                Phase::TimeWait
            }
            Phase::FinWait1 => Phase::Closing,
            Phase::FinWait2 => {
                enter_time_wait(idx, stream, timers, cfg, now);
                Phase::TimeWait
            }
            other => other,
        };
    } else if stream.send.fin_acked {
        stream.phase = match stream.phase {
            Phase::FinWait1 => Phase::FinWait2,
            Phase::Closing => {
                enter_time_wait(idx, stream, timers, cfg, now);
                Phase::TimeWait
            }
            Phase::LastAck => Phase::Closed,
            other => other,
        };
    }

    arm_retransmit_if_pending(idx, stream, timers, now);

    if matches!(stream.phase, Phase::Closed) {
        timers.cancel_all(idx);
        return Outcome::Closed;
    }

    Outcome::Accepted { immediate_ack }
}

/// Retransmission timer fired (`spec.md` §4.3/§4.7): rewind `snd.nxt` to
/// `snd.una`, halve-and-floor `ssthresh`, collapse `cwnd` to one segment,
/// and double the RTO — unless the retry cap is reached, in which case the
/// stream dies with the RTO bit set (`spec.md` §4.5 "Retransmission
/// exhaustion").
pub fn on_retransmit_timeout(idx: StreamIndex, stream: &mut Stream, now: Instant, cfg: &ContextConfig, timers: &mut TimerWheel) -> bool {
    stream.send.retx_count += 1;
    if stream.send.retx_count > stream.nb_retries {
        stream.enter_terminal_error(RemoteEvents::RTO_EXHAUSTED);
        timers.cancel_all(idx);
        warn!("stream#{idx}: retransmission exhausted after {} tries, aborting", stream.send.retx_count);
        return true; // fatal
    }
    debug!("stream#{idx}: RTO fired, retry {}/{}", stream.send.retx_count, stream.nb_retries);
    let flight = stream.send.flight();
    stream.send.congestion.on_rto(flight);
    // spec.md §4.7: "snd.nxt is rewound to snd.una" — discard in-flight
    // bookkeeping so the TX scheduler re-carves segments from scratch.
    stream.send.nxt = stream.send.una;
    stream.send.unacked.clear();
    if stream.send.fin_sent && !stream.send.fin_acked {
        stream.send.fin_sent = false;
    }
    stream.send.rto = stream.send.rto * 2;
    stream.clamp_rto(cfg.rto_min, cfg.rto_max);
    timers.schedule(idx, TimerKind::Retransmit, now, now + stream.send.rto);
    false
}

pub fn on_time_wait_expiry(idx: StreamIndex, timers: &mut TimerWheel) {
    timers.cancel_all(idx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TcpSeqNumber as Seq;

    fn cfg() -> ContextConfig {
        ContextConfig::default()
    }

    fn new_stream() -> Stream {
        Stream::new(&cfg(), 8192, 8192)
    }

    fn syn_ack(seq: Seq, ack: Seq, window: u16) -> Repr {
        Repr {
            src_port: 4000,
            dst_port: 80,
            flags: Flags::SYN | Flags::ACK,
            seq_number: seq,
            ack_number: Some(ack),
            window_len: window,
            window_scale: Some(7),
            max_seg_size: Some(1460),
            timestamp: None,
            payload_len: 0,
        }
    }

    #[test]
    fn active_open_completes_on_syn_ack() {
        let mut s = new_stream();
        s.phase = Phase::SynSent;
        s.send.iss = Seq::new(500);
        s.send.una = Seq::new(500);
        s.send.nxt = Seq::new(501);
        let mut timers = TimerWheel::new(crate::time::Duration::from_millis(100));
        let now = Instant::from_millis(0);
        let outcome = process_segment(
            0,
            &mut s,
            &syn_ack(Seq::new(1000), Seq::new(501), 65535),
            &[],
            now,
            &cfg(),
            &mut timers,
        );
        assert_eq!(outcome, Outcome::Accepted { immediate_ack: true });
        assert_eq!(s.phase, Phase::Established);
        assert_eq!(s.recv.nxt, Seq::new(1001));
    }

    #[test]
    fn data_segment_fast_retransmits_on_third_dup_ack() {
        let mut s = new_stream();
        s.phase = Phase::Established;
        s.recv.nxt = Seq::new(100);
        s.send.una = Seq::new(0);
        s.send.nxt = Seq::new(1000);
        s.send.wnd = 5000;
        s.send_buffer.enqueue_slice(&[0u8; 1000]);
        let mut timers = TimerWheel::new(crate::time::Duration::from_millis(100));
        let now = Instant::from_millis(0);
        let dup = Repr {
            src_port: 1,
            dst_port: 2,
            flags: Flags::ACK,
            seq_number: Seq::new(100),
            ack_number: Some(Seq::new(0)),
            window_len: 5000,
            window_scale: None,
            max_seg_size: None,
            timestamp: None,
            payload_len: 0,
        };
        for _ in 0..3 {
            process_segment(0, &mut s, &dup, &[], now, &cfg(), &mut timers);
        }
        assert_eq!(s.send.dup_ack_count, 3);
        assert_eq!(s.send.congestion.ssthresh(), (1000 / 2).max(2 * s.effective_mss()));
    }

    #[test]
    fn fin_in_established_moves_to_close_wait() {
        let mut s = new_stream();
        s.phase = Phase::Established;
        s.recv.nxt = Seq::new(100);
        s.send.una = Seq::new(0);
        s.send.nxt = Seq::new(0);
        let mut timers = TimerWheel::new(crate::time::Duration::from_millis(100));
        let now = Instant::from_millis(0);
        let fin = Repr {
            src_port: 1,
            dst_port: 2,
            flags: Flags::FIN | Flags::ACK,
            seq_number: Seq::new(100),
            ack_number: Some(Seq::new(0)),
            window_len: 1000,
            window_scale: None,
            max_seg_size: None,
            timestamp: None,
            payload_len: 0,
        };
        let outcome = process_segment(0, &mut s, &fin, &[], now, &cfg(), &mut timers);
        assert_eq!(outcome, Outcome::Accepted { immediate_ack: true });
        assert_eq!(s.phase, Phase::CloseWait);
        assert_eq!(s.recv.nxt, Seq::new(101));
        assert!(s.remote_events.contains(RemoteEvents::FIN));
    }

    #[test]
    fn acceptable_rst_tears_down_connection() {
        let mut s = new_stream();
        s.phase = Phase::Established;
        s.recv.nxt = Seq::new(100);
        let mut timers = TimerWheel::new(crate::time::Duration::from_millis(100));
        let now = Instant::from_millis(0);
        let rst = Repr {
            src_port: 1,
            dst_port: 2,
            flags: Flags::RST,
            seq_number: Seq::new(100),
            ack_number: None,
            window_len: 0,
            window_scale: None,
            max_seg_size: None,
            timestamp: None,
            payload_len: 0,
        };
        let outcome = process_segment(0, &mut s, &rst, &[], now, &cfg(), &mut timers);
        assert_eq!(outcome, Outcome::Reset);
        assert_eq!(s.phase, Phase::Closed);
        assert!(s.remote_events.contains(RemoteEvents::RST));
    }

    #[test]
    fn retransmission_exhaustion_closes_stream_with_rto_bit() {
        let mut s = new_stream();
        s.phase = Phase::Established;
        s.nb_retries = 2;
        s.send.una = Seq::new(0);
        s.send.nxt = Seq::new(10);
        let mut timers = TimerWheel::new(crate::time::Duration::from_millis(100));
        let now = Instant::from_millis(0);
        assert!(!on_retransmit_timeout(0, &mut s, now, &cfg(), &mut timers));
        assert!(!on_retransmit_timeout(0, &mut s, now, &cfg(), &mut timers));
        assert!(on_retransmit_timeout(0, &mut s, now, &cfg(), &mut timers));
        assert_eq!(s.phase, Phase::Closed);
        assert!(s.remote_events.contains(RemoteEvents::RTO_EXHAUSTED));
    }
}
