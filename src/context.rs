/*! The context: stream pool, stream table, timer wheel, device set, and
the control surface (`spec.md` §3 "Context", §4.8, §6).

Grounded in the teacher's general preference for explicit runtime
invariants over silent UB (`socket/tcp.rs`'s `Socket::new` panics on an
oversized buffer; `wire::mod.rs`'s panic-safety doc comments): `Context`
carries a debug-only re-entrancy guard over its three back-end entry
points and the control surface, per `spec.md` §9 "Single-threaded
discipline... enforced... by a debug-time re-entrancy guard."
*/

use std::cell::Cell;
use std::net::{IpAddr, SocketAddr};

use log::{debug, trace, warn};
use rand::Rng;

use crate::config::ContextConfig;
use crate::device::{Device, DeviceId};
use crate::error::{Error, Result};
use crate::pkbuf::PacketBuffer;
use crate::pool::{Pool, StreamId};
use crate::table::{FourTuple, Lookup, StreamTable};
use crate::tcp::machine::{self, Outcome};
use crate::tcp::{ListenExt, Phase, ShadowEntry, Stream, UserOps};
use crate::time::Instant;
use crate::timer::{TimerKind, TimerWheel};
use crate::wire::{TcpFlags as Flags, TcpPacket, TcpRepr as Repr, TcpSeqNumber as Seq};

/// Parameters for `Context::open` (`spec.md` §6 "open").
#[derive(Debug, Clone, Copy)]
pub struct OpenParams {
    pub rx_capacity: usize,
    pub tx_capacity: usize,
    pub device: DeviceId,
}

impl Default for OpenParams {
    fn default() -> OpenParams {
        OpenParams {
            rx_capacity: 64 * 1024,
            tx_capacity: 64 * 1024,
            device: DeviceId(0),
        }
    }
}

/// Caller-supplied state for the `establish` shortcut (`spec.md` §4.5
/// "Establish shortcut").
#[derive(Debug, Clone, Copy)]
pub struct EstablishParams {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub iss: u32,
    pub irs: u32,
    pub snd_wnd: usize,
    pub rcv_wnd_scale: Option<u8>,
    pub peer_wnd_scale: Option<u8>,
    pub mss: usize,
    pub private: bool,
    pub device: DeviceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    pub phase: Phase,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

pub struct Context {
    config: ContextConfig,
    streams: Pool<Stream>,
    table: StreamTable,
    timers: TimerWheel,
    devices: Vec<Box<dyn Device>>,
    reentrant: Cell<bool>,
}

struct ReentrancyGuard<'a>(&'a Cell<bool>);

impl<'a> Drop for ReentrancyGuard<'a> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Context {
    pub fn new(config: ContextConfig, devices: Vec<Box<dyn Device>>) -> Result<Context> {
        config.validate()?;
        let capacity = config.max_streams;
        Ok(Context {
            timers: TimerWheel::new(config.tick),
            config,
            streams: Pool::with_capacity(capacity),
            table: StreamTable::new(),
            devices,
            reentrant: Cell::new(false),
        })
    }

    fn guard(&self) -> ReentrancyGuard<'_> {
        debug_assert!(
            !self.reentrant.get(),
            "re-entrant call into a Context back-end entry point (spec.md §5/§9)"
        );
        self.reentrant.set(true);
        ReentrancyGuard(&self.reentrant)
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn stream(&self, id: StreamId) -> Result<&Stream> {
        self.streams.get(id).ok_or(Error::InvalidArgument)
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut Stream> {
        self.streams.get_mut(id).ok_or(Error::InvalidArgument)
    }

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut Box<dyn Device>> {
        self.devices.iter_mut().find(|d| d.id() == id)
    }

    fn push_to_device(&mut self, device: DeviceId, local: IpAddr, remote: IpAddr, mut pkt: PacketBuffer) {
        pkt.meta.src_addr = Some(local);
        pkt.meta.dst_addr = Some(remote);
        if let Some(dev) = self.device_mut(device) {
            pkt.meta.checksum_computed = !dev.capabilities().checksum_offload || pkt.meta.checksum_computed;
            dev.push_egress(pkt);
        }
    }

    // ---------------------------------------------------------------
    // Control surface (`spec.md` §6 "Control operations")
    // ---------------------------------------------------------------

    pub fn open(&mut self, params: OpenParams) -> Result<StreamId> {
        let _g = self.guard();
        if params.rx_capacity == 0 || params.tx_capacity == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut stream = Stream::new(&self.config, params.rx_capacity, params.tx_capacity);
        stream.device = params.device;
        let id = self.streams.insert(stream).ok_or(Error::PoolExhausted)?;
        trace!("{id}: opened on device {:?}", params.device);
        Ok(id)
    }

    pub fn listen(&mut self, id: StreamId, local: SocketAddr) -> Result<()> {
        let _g = self.guard();
        let stream = self.stream_mut(id)?;
        if stream.phase != Phase::Closed {
            return Err(Error::InvalidArgument);
        }
        stream.invoke(UserOps::LISTEN)?;
        stream.local = Some(local.ip());
        stream.local_port = local.port();
        stream.phase = Phase::Listen;
        stream.listen = Some(ListenExt::default());
        self.table.insert_listening(Some(local.ip()), local.port(), id.index);
        debug!("{id}: listening on {local}");
        Ok(())
    }

    pub fn accept(&mut self, id: StreamId, out: &mut [StreamId]) -> Result<usize> {
        let _g = self.guard();
        let stream = self.stream_mut(id)?;
        if stream.phase != Phase::Listen {
            return Err(Error::InvalidArgument);
        }
        stream.invoke(UserOps::ACCEPT).or_else(|e| {
            // accept() is normally called repeatedly; only the first call
            // needs to flip the bit, subsequent calls just drain the queue.
            if stream.user_ops.contains(UserOps::ACCEPT) {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        let listen = stream.listen.as_mut().ok_or(Error::InvalidArgument)?;
        let mut n = 0;
        while n < out.len() {
            match listen.ready.pop_front() {
                Some(index) => {
                    if let Some(sid) = self.streams.current_id(index) {
                        out[n] = sid;
                        n += 1;
                    }
                }
                None => break,
            }
        }
        Ok(n)
    }

    pub fn connect(&mut self, id: StreamId, local: SocketAddr, remote: SocketAddr, now: Instant) -> Result<()> {
        let _g = self.guard();
        {
            let stream = self.stream_mut(id)?;
            if stream.phase != Phase::Closed {
                return Err(Error::InvalidArgument);
            }
            stream.invoke(UserOps::CONNECT)?;
            stream.local = Some(local.ip());
            stream.local_port = local.port();
            stream.remote = Some(remote.ip());
            stream.remote_port = remote.port();
            let iss = Seq::new(rand::thread_rng().gen());
            stream.send.iss = iss;
            stream.send.una = iss;
            stream.send.nxt = iss.wrapping_add(1);
            stream.phase = Phase::SynSent;
        }
        let tuple = self.stream(id)?.four_tuple().ok_or(Error::InvalidArgument)?;
        self.table.insert_connected(tuple, id.index);
        self.timers.schedule(id.index, TimerKind::Retransmit, now, now + self.config.rto_initial);

        let stream = self.stream(id)?;
        let pkt = stream.build_segment(Flags::SYN, stream.send.iss, &[], self.config.tx_headroom, false);
        self.push_to_device(stream.device, local.ip(), remote.ip(), pkt);
        debug!("{id}: active open {local} -> {remote}");
        Ok(())
    }

    pub fn establish(&mut self, params: EstablishParams) -> Result<StreamId> {
        let _g = self.guard();
        let mut stream = Stream::new(&self.config, 64 * 1024, 64 * 1024);
        stream.local = Some(params.local.ip());
        stream.local_port = params.local.port();
        stream.remote = Some(params.remote.ip());
        stream.remote_port = params.remote.port();
        stream.phase = Phase::Established;
        stream.private = params.private;
        stream.device = params.device;
        stream.options.mss = params.mss;
        stream.send.congestion.set_mss(params.mss);
        stream.options.wscale_local = params.rcv_wnd_scale;
        stream.options.wscale_peer = params.peer_wnd_scale;
        stream.invoke(UserOps::ESTABLISH)?;

        let iss = Seq::new(params.iss);
        stream.send.iss = iss;
        stream.send.una = iss;
        stream.send.nxt = iss;
        stream.send.wnd = params.snd_wnd;
        stream.send.wl1 = Seq::new(params.irs);
        stream.send.wl2 = iss;
        stream.recv.irs = Seq::new(params.irs);
        stream.recv.nxt = Seq::new(params.irs);

        let id = self.streams.insert(stream).ok_or(Error::PoolExhausted)?;
        if !params.private {
            let tuple = self.stream(id)?.four_tuple().ok_or(Error::InvalidArgument)?;
            self.table.insert_connected(tuple, id.index);
        }
        debug!("{id}: established {} -> {} (private={})", params.local, params.remote, params.private);
        Ok(id)
    }

    pub fn shutdown(&mut self, id: StreamId) -> Result<()> {
        let _g = self.guard();
        let stream = self.stream_mut(id)?;
        if !matches!(stream.phase, Phase::Established | Phase::CloseWait) {
            return Err(Error::NotConnected);
        }
        stream.invoke(UserOps::SHUTDOWN)?;
        stream.send.fin_queued = true;
        debug!("{id}: shutdown, FIN queued");
        Ok(())
    }

    pub fn close(&mut self, id: StreamId) -> Result<()> {
        let _g = self.guard();
        {
            let stream = self.stream_mut(id)?;
            stream.invoke(UserOps::CLOSE)?;
            stream.destroy_on_close = true;
            if matches!(stream.phase, Phase::Established | Phase::CloseWait) {
                stream.send.fin_queued = true;
            }
        }
        Ok(())
    }

    pub fn close_bulk(&mut self, ids: &[StreamId]) -> usize {
        let mut n = 0;
        for &id in ids {
            if self.close(id).is_ok() {
                n += 1;
            }
        }
        n
    }

    pub fn abort(&mut self, id: StreamId, now: Instant) -> Result<()> {
        let _g = self.guard();
        let (device, local, remote, pkt) = {
            let stream = self.stream_mut(id)?;
            let seq = stream.send.nxt;
            stream.abort();
            let pkt = if let (Some(local), Some(remote)) = (stream.local, stream.remote) {
                Some((stream.device, local, remote, stream.build_segment(Flags::RST, seq, &[], self.config.tx_headroom, false)))
            } else {
                None
            };
            (stream.device, stream.local, stream.remote, pkt)
        };
        self.timers.cancel_all(id.index);
        if let Some(tuple) = self.stream(id)?.four_tuple() {
            self.table.remove_connected(&tuple);
        }
        let _ = (device, local, remote, now);
        if let Some((dev, l, r, pkt)) = pkt {
            if let (Some(l), Some(r)) = (l, r) {
                self.push_to_device(dev, l, r, pkt);
            }
        }
        self.streams.remove(id);
        warn!("{id}: aborted, RST sent");
        Ok(())
    }

    pub fn get_addr(&self, id: StreamId) -> Result<(Option<SocketAddr>, Option<SocketAddr>)> {
        let stream = self.stream(id)?;
        let local = stream.local.map(|ip| SocketAddr::new(ip, stream.local_port));
        let remote = stream.remote.map(|ip| SocketAddr::new(ip, stream.remote_port));
        Ok((local, remote))
    }

    pub fn get_mss(&self, id: StreamId) -> Result<usize> {
        Ok(self.stream(id)?.effective_mss())
    }

    pub fn get_state(&self, id: StreamId) -> Result<StreamState> {
        let stream = self.stream(id)?;
        let (local, remote) = self.get_addr(id)?;
        Ok(StreamState {
            phase: stream.phase,
            local,
            remote,
        })
    }

    pub fn recv(&mut self, id: StreamId, out: &mut [u8]) -> Result<usize> {
        let _g = self.guard();
        let stream = self.stream_mut(id)?;
        if stream.recv_buffer.is_empty() {
            if stream.phase == Phase::Closed {
                return Err(Error::NotConnected);
            }
            return Ok(0);
        }
        Ok(stream.recv_buffer.dequeue_slice(out))
    }

    pub fn readv(&mut self, id: StreamId, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = self.recv(id, buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    pub fn send(&mut self, id: StreamId, data: &[u8]) -> Result<usize> {
        let _g = self.guard();
        let stream = self.stream_mut(id)?;
        if !matches!(stream.phase, Phase::Established | Phase::CloseWait) {
            return Err(Error::NotConnected);
        }
        if stream.send.fin_queued {
            return Err(Error::NotConnected);
        }
        Ok(stream.send_buffer.enqueue_slice(data))
    }

    pub fn writev(&mut self, id: StreamId, bufs: &[&[u8]]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs {
            let n = self.send(id, buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    pub fn update_cfg(&mut self, updates: &[(StreamId, u8)]) -> usize {
        let mut n = 0;
        for &(id, nb_retries) in updates {
            if let Ok(stream) = self.stream_mut(id) {
                stream.nb_retries = nb_retries;
                n += 1;
            }
        }
        n
    }

    // ---------------------------------------------------------------
    // RX path (`spec.md` §4.6, §6)
    // ---------------------------------------------------------------

    /// `rx_bulk(dev, pkts[], rp[], rc[], n)`.
    pub fn rx_bulk(
        &mut self,
        pkts: Vec<PacketBuffer>,
        rejected: &mut Vec<PacketBuffer>,
        reasons: &mut Vec<Error>,
        n: usize,
        now: Instant,
    ) -> usize {
        let _g = self.guard();
        let mut delivered = 0;
        for pkt in pkts.into_iter().take(n) {
            match self.rx_one(pkt, now) {
                Ok(()) => delivered += 1,
                Err((pkt, e)) => {
                    rejected.push(pkt);
                    reasons.push(e);
                }
            }
        }
        delivered
    }

    /// Per-stream receive entry point, for private streams bypassing the
    /// stream table (`spec.md` §6 "stream_rx_bulk").
    pub fn stream_rx_bulk(
        &mut self,
        id: StreamId,
        pkts: Vec<PacketBuffer>,
        rejected: &mut Vec<PacketBuffer>,
        reasons: &mut Vec<Error>,
        n: usize,
        now: Instant,
    ) -> usize {
        let _g = self.guard();
        let mut delivered = 0;
        for pkt in pkts.into_iter().take(n) {
            match self.rx_for_stream(id, pkt, now) {
                Ok(()) => delivered += 1,
                Err((pkt, e)) => {
                    rejected.push(pkt);
                    reasons.push(e);
                }
            }
        }
        delivered
    }

    fn rx_one(&mut self, pkt: PacketBuffer, now: Instant) -> std::result::Result<(), (PacketBuffer, Error)> {
        let (tuple, repr) = match self.parse_segment(&pkt) {
            Ok(v) => v,
            Err(e) => return Err((pkt, e)),
        };

        match self.table.lookup(&tuple) {
            Lookup::Connected(index) => {
                let id = match self.streams.current_id(index) {
                    Some(id) => id,
                    None => return Err((pkt, Error::NoSuchStream)),
                };
                self.deliver_to_stream(id, tuple, repr, pkt.segment()[repr_payload_offset(&pkt)..].to_vec(), now)
                    .map_err(|e| (pkt, e))
            }
            Lookup::Listening(index) => {
                let id = match self.streams.current_id(index) {
                    Some(id) => id,
                    None => return Err((pkt, Error::NoSuchStream)),
                };
                self.handle_listen_segment(id, tuple, &repr, now).map_err(|e| (pkt, e))
            }
            Lookup::None => {
                trace!("no stream for {tuple:?}, dropping segment");
                Err((pkt, Error::NoSuchStream))
            }
        }
    }

    fn rx_for_stream(&mut self, id: StreamId, pkt: PacketBuffer, now: Instant) -> std::result::Result<(), (PacketBuffer, Error)> {
        let stream = match self.streams.get(id) {
            Some(s) => s,
            None => return Err((pkt, Error::NoSuchStream)),
        };
        let (local, remote) = match (stream.local, stream.remote) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err((pkt, Error::InvalidArgument)),
        };
        let repr = match self.parse_with_endpoints(&pkt, local, remote) {
            Ok(r) => r,
            Err(e) => return Err((pkt, e)),
        };
        let tuple = FourTuple {
            local_addr: local,
            local_port: repr.dst_port,
            remote_addr: remote,
            remote_port: repr.src_port,
        };
        let payload_offset = repr_payload_offset(&pkt);
        let payload = pkt.segment()[payload_offset..].to_vec();
        self.deliver_to_stream(id, tuple, repr, payload, now).map_err(|e| (pkt, e))
    }

    fn parse_segment(&self, pkt: &PacketBuffer) -> Result<(FourTuple, Repr)> {
        let (src, dst) = match (pkt.meta.src_addr, pkt.meta.dst_addr) {
            (Some(s), Some(d)) => (s, d),
            _ => return Err(Error::InvalidPacket),
        };
        let repr = self.parse_with_endpoints(pkt, dst, src)?;
        Ok((
            FourTuple {
                local_addr: dst,
                local_port: repr.dst_port,
                remote_addr: src,
                remote_port: repr.src_port,
            },
            repr,
        ))
    }

    fn parse_with_endpoints(&self, pkt: &PacketBuffer, local: IpAddr, remote: IpAddr) -> Result<Repr> {
        let packet = TcpPacket::new_checked(pkt.segment()).map_err(|_| Error::InvalidPacket)?;
        if pkt.meta.checksum_verified {
            Repr::parse_trusting_checksum(&packet).map_err(|_| Error::InvalidPacket)
        } else {
            Repr::parse(&packet, &remote, &local).map_err(|_| Error::InvalidPacket)
        }
    }

    fn deliver_to_stream(&mut self, id: StreamId, _tuple: FourTuple, repr: Repr, payload: Vec<u8>, now: Instant) -> Result<()> {
        let stream = self.stream_mut(id)?;
        let outcome = machine::process_segment(id.index, stream, &repr, &payload, now, &self.config, &mut self.timers);
        self.emit_fast_retransmit(id, now);

        match outcome {
            Outcome::Accepted { immediate_ack } => {
                if immediate_ack {
                    self.send_pure_ack(id, now)?;
                }
                Ok(())
            }
            Outcome::Unacceptable { send_ack } => {
                if send_ack {
                    self.send_pure_ack(id, now)?;
                }
                Err(Error::BufferFull)
            }
            Outcome::Reset => {
                self.teardown_after_error(id);
                Err(Error::InvalidPacket)
            }
            Outcome::Closed => {
                self.teardown_after_error(id);
                Ok(())
            }
        }
    }

    /// `spec.md` §4.5 "fast retransmit resends snd.una's segment": emitted
    /// right after ACK processing, ahead of any new-data carving, so the
    /// replacement for the dropped segment always goes out first.
    fn emit_fast_retransmit(&mut self, id: StreamId, now: Instant) {
        let headroom = self.config.tx_headroom;
        let Some(stream) = self.streams.get_mut(id) else { return };
        if !stream.send.fast_retransmit_pending {
            return;
        }
        let (local, remote, device) = (stream.local, stream.remote, stream.device);
        let Some(pkt) = stream.take_fast_retransmit(now, headroom, false) else {
            return;
        };
        if let (Some(l), Some(r)) = (local, remote) {
            self.push_to_device(device, l, r, pkt);
        }
    }

    fn teardown_after_error(&mut self, id: StreamId) {
        if let Some(tuple) = self.streams.get(id).and_then(|s| s.four_tuple()) {
            self.table.remove_connected(&tuple);
        }
    }

    fn send_pure_ack(&mut self, id: StreamId, _now: Instant) -> Result<()> {
        let stream = self.stream(id)?;
        if let (Some(local), Some(remote)) = (stream.local, stream.remote) {
            let seq = stream.send.nxt;
            let pkt = stream.build_segment(Flags::ACK, seq, &[], self.config.tx_headroom, false);
            let device = stream.device;
            self.push_to_device(device, local, remote, pkt);
        }
        Ok(())
    }

    /// `spec.md` §4.5 "Passive open": admit a SYN into the backlog, or
    /// promote a completed handshake out of it.
    fn handle_listen_segment(&mut self, listener_id: StreamId, tuple: FourTuple, repr: &Repr, now: Instant) -> Result<()> {
        if repr.flags.syn() && !repr.flags.ack() {
            let backlog_cap = self.config.listen_backlog;
            let listener = self.stream_mut(listener_id)?;
            let listen = listener.listen.as_mut().ok_or(Error::InvalidArgument)?;
            if listen.backlog.len() >= backlog_cap {
                // spec.md §4.5/§9: silent drop, no RST.
                return Ok(());
            }
            let iss = Seq::new(rand::thread_rng().gen());
            let irs = repr.seq_number;
            let mut options = crate::tcp::OptionsState {
                mss: self.config.default_mss,
                ..Default::default()
            };
            if let Some(mss) = repr.max_seg_size {
                options.peer_mss = Some(mss as usize);
                options.mss = options.mss.min(mss as usize);
            }
            options.wscale_peer = repr.window_scale;
            options.wscale_local = Some(7);
            let entry = ShadowEntry {
                tuple,
                iss,
                irs,
                peer_wnd: repr.window_len as usize,
                options,
                syn_ack_tx_tick: now,
                retx_count: 0,
                rto: self.config.rto_initial,
            };
            listen.backlog.insert(tuple, entry.clone());

            let device = listener.device;
            let local = tuple.local_addr;
            let remote = tuple.remote_addr;
            let pkt = build_syn_ack(&entry, local, remote, self.config.tx_headroom);
            self.push_to_device(device, local, remote, pkt);
            self.timers.schedule(listener_id.index, TimerKind::Retransmit, now, now + self.config.rto_initial);
            return Ok(());
        }

        if repr.flags.ack() && !repr.flags.syn() {
            let entry = {
                let listener = self.stream_mut(listener_id)?;
                let listen = listener.listen.as_mut().ok_or(Error::InvalidArgument)?;
                listen.backlog.get(&tuple).cloned()
            };
            let Some(entry) = entry else {
                return Err(Error::NoSuchStream);
            };
            if repr.ack_number != Some(entry.iss.wrapping_add(1)) {
                return Ok(()); // stray ack, ignore
            }

            let mut stream = Stream::new(&self.config, 64 * 1024, 64 * 1024);
            stream.local = Some(tuple.local_addr);
            stream.local_port = tuple.local_port;
            stream.remote = Some(tuple.remote_addr);
            stream.remote_port = tuple.remote_port;
            stream.phase = Phase::Established;
            stream.options = entry.options;
            stream.send.congestion.set_mss(entry.options.mss);
            stream.send.iss = entry.iss;
            stream.send.una = entry.iss.wrapping_add(1);
            stream.send.nxt = entry.iss.wrapping_add(1);
            stream.send.wnd = entry.peer_wnd;
            stream.recv.irs = entry.irs;
            stream.recv.nxt = entry.irs.wrapping_add(1);
            stream.device = self.stream(listener_id)?.device;

            let new_id = self.streams.insert(stream).ok_or(Error::PoolExhausted)?;
            self.table.insert_connected(tuple, new_id.index);

            let listener = self.stream_mut(listener_id)?;
            let listen = listener.listen.as_mut().ok_or(Error::InvalidArgument)?;
            listen.backlog.remove(&tuple);
            listen.ready.push_back(new_id.index);
            listener.sinks.arm_recv();
            self.timers.cancel(listener_id.index, TimerKind::Retransmit);
            return Ok(());
        }

        Ok(())
    }

    // ---------------------------------------------------------------
    // TX path (`spec.md` §4.7, §6)
    // ---------------------------------------------------------------

    pub fn tx_bulk(&mut self, device: DeviceId, out: &mut Vec<PacketBuffer>, n: usize) -> usize {
        let _g = self.guard();
        match self.device_mut(device) {
            Some(dev) => dev.pop_egress_batch(out, n),
            None => 0,
        }
    }

    // ---------------------------------------------------------------
    // process(ctx, n) — `spec.md` §4.3, §6
    // ---------------------------------------------------------------

    pub fn process(&mut self, n: usize, now: Instant) -> Result<()> {
        let _g = self.guard();
        if n == 0 {
            return Err(Error::InvalidArgument);
        }

        let elapsed = now.checked_sub_duration(Instant::from_millis(
            self.timers.now_tick() as i64 * self.timers.tick_duration().total_millis() as i64,
        ));
        let fired = self.timers.advance_to(elapsed);

        let mut touched = 0;
        for (index, kind) in fired {
            if touched >= n {
                break;
            }
            touched += 1;
            let Some(id) = self.streams.current_id(index) else {
                continue;
            };
            self.handle_timer(id, kind, now);
        }

        // Drive new-data/FIN transmission for every live, synchronized
        // stream with something queued. Bounded by `n` per `spec.md` §2
        // "process(ctx, n) advances timers and drains deferred work for up
        // to N streams."
        let mut driven = 0;
        let indices: Vec<usize> = self.streams.iter_indices().collect();
        for index in indices {
            if driven >= n {
                break;
            }
            let Some(id) = self.streams.current_id(index) else {
                continue;
            };
            if self.drive_stream(id, now) {
                driven += 1;
            }
        }

        self.reap_closed_streams();
        Ok(())
    }

    fn handle_timer(&mut self, id: StreamId, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::Retransmit => self.on_retransmit(id, now),
            TimerKind::Persist => self.on_persist(id, now),
            TimerKind::DelayedAck => {
                let _ = self.send_pure_ack(id, now);
            }
            TimerKind::KeepAlive => self.on_keep_alive(id, now),
            TimerKind::TimeWait => {
                machine::on_time_wait_expiry(id.index, &mut self.timers);
                if let Some(stream) = self.streams.get(id) {
                    if let Some(tuple) = stream.four_tuple() {
                        self.table.remove_connected(&tuple);
                    }
                }
                self.streams.remove(id);
            }
        }
    }

    fn on_retransmit(&mut self, id: StreamId, now: Instant) {
        let Some(stream) = self.streams.get(id) else { return };
        let phase = stream.phase;
        let (local, remote, device) = (stream.local, stream.remote, stream.device);

        match phase {
            Phase::SynSent => {
                let fatal = {
                    let stream = self.streams.get_mut(id).unwrap();
                    stream.send.retx_count += 1;
                    if stream.send.retx_count > stream.nb_retries {
                        stream.enter_terminal_error(crate::tcp::RemoteEvents::RTO_EXHAUSTED);
                        warn!("{id}: SYN retransmission exhausted after {} tries", stream.send.retx_count);
                        true
                    } else {
                        stream.send.rto = stream.send.rto * 2;
                        stream.clamp_rto(self.config.rto_min, self.config.rto_max);
                        false
                    }
                };
                if fatal {
                    self.timers.cancel_all(id.index);
                    return;
                }
                let stream = self.streams.get(id).unwrap();
                let seq = stream.send.iss;
                let pkt = stream.build_segment(Flags::SYN, seq, &[], self.config.tx_headroom, false);
                if let (Some(l), Some(r)) = (local, remote) {
                    self.push_to_device(device, l, r, pkt);
                }
                self.timers.schedule(id.index, TimerKind::Retransmit, now, now + self.streams.get(id).unwrap().send.rto);
            }
            _ => {
                let fatal = {
                    let stream = self.streams.get_mut(id).unwrap();
                    machine::on_retransmit_timeout(id.index, stream, now, &self.config, &mut self.timers)
                };
                if fatal {
                    return;
                }
                self.drive_stream(id, now);
            }
        }
    }

    fn on_persist(&mut self, id: StreamId, now: Instant) {
        let Some(stream) = self.streams.get_mut(id) else { return };
        if stream.send.wnd != 0 || stream.send_buffer.is_empty() {
            return;
        }
        let local = stream.local;
        let remote = stream.remote;
        let device = stream.device;
        if let Some(pkt) = self.streams.get_mut(id).unwrap().build_zero_window_probe(now, self.config.tx_headroom, false) {
            if let (Some(l), Some(r)) = (local, remote) {
                self.push_to_device(device, l, r, pkt);
            }
        }
        let backoff = self.streams.get(id).unwrap().send.rto;
        self.timers.schedule(id.index, TimerKind::Persist, now, now + backoff * 2);
    }

    fn on_keep_alive(&mut self, id: StreamId, now: Instant) {
        let Some(stream) = self.streams.get(id) else { return };
        if stream.phase != Phase::Established {
            return;
        }
        let (local, remote, device) = (stream.local, stream.remote, stream.device);
        let seq = stream.send.una.wrapping_sub(1);
        let pkt = stream.build_segment(Flags::ACK, seq, &[], self.config.tx_headroom, false);
        if let (Some(l), Some(r)) = (local, remote) {
            self.push_to_device(device, l, r, pkt);
        }
        self.timers.schedule(id.index, TimerKind::KeepAlive, now, now + self.config.keep_alive_idle);
    }

    /// Carve and emit as much new data/FIN as budget allows; re-arm the
    /// retransmission timer if anything is now in flight. Returns `true`
    /// if the stream was actually touched (had work to do), for the
    /// `process(ctx, n)` per-stream budget.
    fn drive_stream(&mut self, id: StreamId, now: Instant) -> bool {
        let headroom = self.config.tx_headroom;
        let Some(stream) = self.streams.get_mut(id) else { return false };
        if stream.send.wnd == 0 {
            if !self.timers.is_armed(id.index, TimerKind::Persist) && !stream.send_buffer.is_empty() {
                self.timers.schedule(id.index, TimerKind::Persist, now, now + stream.send.rto);
            }
            return false;
        }
        let segments = stream.poll_transmit(now, headroom, false);
        if segments.is_empty() {
            return false;
        }
        let (local, remote, device) = (stream.local, stream.remote, stream.device);
        if stream.send.una != stream.send.nxt && !self.timers.is_armed(id.index, TimerKind::Retransmit) {
            let rto = stream.send.rto;
            self.timers.schedule(id.index, TimerKind::Retransmit, now, now + rto);
        }
        if let (Some(l), Some(r)) = (local, remote) {
            for pkt in segments {
                self.push_to_device(device, l, r, pkt);
            }
        }
        true
    }

    /// `spec.md` §3 "Lifecycle": free a stream once it is CLOSED and the
    /// user committed to `close`/`abort`, or once TIME_WAIT has already
    /// removed it (handled directly in `handle_timer`).
    fn reap_closed_streams(&mut self) {
        let candidates: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.phase == Phase::Closed && s.destroy_on_close)
            .map(|(id, _)| id)
            .collect();
        for id in candidates {
            if let Some(tuple) = self.streams.get(id).and_then(|s| s.four_tuple()) {
                self.table.remove_connected(&tuple);
            }
            self.timers.cancel_all(id.index);
            self.streams.remove(id);
        }
    }
}

fn repr_payload_offset(pkt: &PacketBuffer) -> usize {
    match TcpPacket::new_checked(pkt.segment()) {
        Ok(p) => (p.data_offset() as usize) * 4,
        Err(_) => pkt.len(),
    }
}

fn build_syn_ack(entry: &ShadowEntry, local: IpAddr, remote: IpAddr, headroom: usize) -> PacketBuffer {
    let repr = Repr {
        src_port: entry.tuple.local_port,
        dst_port: entry.tuple.remote_port,
        flags: Flags::SYN | Flags::ACK,
        seq_number: entry.iss,
        ack_number: Some(entry.irs.wrapping_add(1)),
        window_len: u16::MAX,
        window_scale: entry.options.wscale_local,
        max_seg_size: Some(entry.options.mss as u16),
        timestamp: None,
        payload_len: 0,
    };
    let mut pkt = PacketBuffer::with_headroom(headroom);
    pkt.reserve_segment(repr.header_len());
    {
        let mut tcp_pkt = TcpPacket::new_unchecked(pkt.segment_mut());
        repr.emit(&mut tcp_pkt);
        tcp_pkt.fill_checksum(&local, &remote);
    }
    pkt.meta.checksum_computed = true;
    pkt.meta.l4_len = repr.header_len() as u16;
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VecDevice;
    use std::net::Ipv4Addr;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 80),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 4000),
        )
    }

    fn new_ctx() -> Context {
        Context::new(ContextConfig::default(), vec![Box::new(VecDevice::new(0, 1500))]).unwrap()
    }

    /// Build a raw inbound segment (as `rx_bulk` would receive it from the
    /// device) with `src`/`dst` already resolved in `meta`, matching what
    /// the out-of-scope L3 layer is expected to have done per `spec.md` §1.
    #[allow(clippy::too_many_arguments)]
    fn make_segment(
        src: SocketAddr,
        dst: SocketAddr,
        flags: Flags,
        seq: u32,
        ack: Option<u32>,
        window: u16,
        mss: Option<u16>,
        wscale: Option<u8>,
        payload: &[u8],
    ) -> PacketBuffer {
        let repr = Repr {
            src_port: src.port(),
            dst_port: dst.port(),
            flags,
            seq_number: Seq::new(seq),
            ack_number: ack.map(Seq::new),
            window_len: window,
            window_scale: wscale,
            max_seg_size: mss,
            timestamp: None,
            payload_len: payload.len(),
        };
        let mut pkt = PacketBuffer::with_headroom(0);
        pkt.reserve_segment(repr.header_len() + payload.len());
        {
            let mut tcp_pkt = TcpPacket::new_unchecked(pkt.segment_mut());
            repr.emit(&mut tcp_pkt);
            tcp_pkt.payload_mut().copy_from_slice(payload);
            tcp_pkt.fill_checksum(&src.ip(), &dst.ip());
        }
        pkt.meta.checksum_computed = true;
        pkt.meta.src_addr = Some(src.ip());
        pkt.meta.dst_addr = Some(dst.ip());
        pkt
    }

    fn parse_outbound(pkt: &PacketBuffer) -> Repr {
        let packet = TcpPacket::new_checked(pkt.segment()).unwrap();
        Repr::parse_trusting_checksum(&packet).unwrap()
    }

    /// `spec.md` §8 scenario 1 "Passive establish".
    #[test]
    fn passive_establish() {
        let mut ctx = new_ctx();
        let (client, server) = addrs();
        let listener = ctx.open(OpenParams::default()).unwrap();
        ctx.listen(listener, server).unwrap();

        let now = Instant::from_millis(0);
        let syn = make_segment(client, server, Flags::SYN, 1000, None, 65535, Some(1460), Some(7), &[]);
        let mut rej = Vec::new();
        let mut reasons = Vec::new();
        let delivered = ctx.rx_bulk(vec![syn], &mut rej, &mut reasons, 1, now);
        assert_eq!(delivered, 1);
        assert!(rej.is_empty());

        let mut out = Vec::new();
        assert_eq!(ctx.tx_bulk(DeviceId(0), &mut out, 8), 1);
        let syn_ack = parse_outbound(&out[0]);
        assert!(syn_ack.flags.syn() && syn_ack.flags.ack());
        assert_eq!(syn_ack.ack_number, Some(Seq::new(1001)));
        let iss = syn_ack.seq_number;

        let ack = make_segment(client, server, Flags::ACK, 1001, Some(iss.wrapping_add(1).0), 65535, None, None, &[]);
        let mut rej = Vec::new();
        let mut reasons = Vec::new();
        assert_eq!(ctx.rx_bulk(vec![ack], &mut rej, &mut reasons, 1, now), 1);

        let mut accepted = [StreamId { index: 0, generation: 0 }; 4];
        let n = ctx.accept(listener, &mut accepted).unwrap();
        assert_eq!(n, 1);
        let state = ctx.get_state(accepted[0]).unwrap();
        assert_eq!(state.phase, Phase::Established);
    }

    /// `spec.md` §8 scenario 4 "Graceful close", abbreviated to shutdown
    /// through FIN_WAIT_2 (the peer-FIN/TIME_WAIT half is exercised by
    /// `time_wait_expires_and_destroys_stream`).
    #[test]
    fn graceful_shutdown_reaches_fin_wait_2() {
        let mut ctx = new_ctx();
        let (local, remote) = addrs();
        let id = ctx.establish(EstablishParams {
            local,
            remote,
            iss: 1000,
            irs: 5000,
            snd_wnd: 65535,
            rcv_wnd_scale: None,
            peer_wnd_scale: None,
            mss: 1460,
            private: false,
            device: DeviceId(0),
        }).unwrap();

        let now = Instant::from_millis(0);
        ctx.shutdown(id).unwrap();
        ctx.process(8, now).unwrap();

        let mut out = Vec::new();
        assert_eq!(ctx.tx_bulk(DeviceId(0), &mut out, 8), 1);
        let fin = parse_outbound(&out[0]);
        assert!(fin.flags.fin());
        assert_eq!(ctx.get_state(id).unwrap().phase, Phase::FinWait1);

        let ack = make_segment(remote, local, Flags::ACK, 5000, Some(fin.seq_number.wrapping_add(1).0), 65535, None, None, &[]);
        let mut rej = Vec::new();
        let mut reasons = Vec::new();
        assert_eq!(ctx.rx_bulk(vec![ack], &mut rej, &mut reasons, 1, now), 1);
        assert_eq!(ctx.get_state(id).unwrap().phase, Phase::FinWait2);
    }

    /// `spec.md` §8 scenario 5 "Abort".
    #[test]
    fn abort_wipes_recv_buffer_and_sends_rst() {
        let mut ctx = new_ctx();
        let (local, remote) = addrs();
        let id = ctx.establish(EstablishParams {
            local,
            remote,
            iss: 1000,
            irs: 5000,
            snd_wnd: 65535,
            rcv_wnd_scale: None,
            peer_wnd_scale: None,
            mss: 1460,
            private: false,
            device: DeviceId(0),
        }).unwrap();

        let now = Instant::from_millis(0);
        let data = make_segment(remote, local, Flags::ACK, 5000, Some(1000), 65535, None, None, b"hello");
        let mut rej = Vec::new();
        let mut reasons = Vec::new();
        ctx.rx_bulk(vec![data], &mut rej, &mut reasons, 1, now);
        let mut buf = [0u8; 1];
        // data is queued; now abort before the user drains it.
        ctx.abort(id, now).unwrap();

        let mut out = Vec::new();
        assert_eq!(ctx.tx_bulk(DeviceId(0), &mut out, 8), 1);
        assert!(parse_outbound(&out[0]).flags.contains(Flags::RST));
        // the stream is gone: any further op sees InvalidArgument.
        assert_eq!(ctx.recv(id, &mut buf), Err(Error::InvalidArgument));
    }

    /// `spec.md` §8 "TIME_WAIT streams are destroyed no later than one
    /// `process` call after 2·MSL ticks have elapsed."
    #[test]
    fn time_wait_expires_and_destroys_stream() {
        let mut cfg = ContextConfig::default();
        cfg.msl = crate::time::Duration::from_millis(100);
        cfg.tick = crate::time::Duration::from_millis(10);
        let mut ctx = Context::new(cfg, vec![Box::new(VecDevice::new(0, 1500))]).unwrap();
        let (local, remote) = addrs();
        let id = ctx.establish(EstablishParams {
            local,
            remote,
            iss: 1000,
            irs: 5000,
            snd_wnd: 65535,
            rcv_wnd_scale: None,
            peer_wnd_scale: None,
            mss: 1460,
            private: false,
            device: DeviceId(0),
        }).unwrap();

        let now = Instant::from_millis(0);
        ctx.shutdown(id).unwrap();
        ctx.process(8, now).unwrap();
        let mut out = Vec::new();
        ctx.tx_bulk(DeviceId(0), &mut out, 8);
        let fin = parse_outbound(&out[0]);

        let fin_ack = make_segment(remote, local, Flags::FIN | Flags::ACK, 5000, Some(fin.seq_number.wrapping_add(1).0), 65535, None, None, &[]);
        let mut rej = Vec::new();
        let mut reasons = Vec::new();
        ctx.rx_bulk(vec![fin_ack], &mut rej, &mut reasons, 1, now);
        assert_eq!(ctx.get_state(id).unwrap().phase, Phase::TimeWait);

        // 2*MSL = 200ms have elapsed; process() must reap the stream.
        let later = now + crate::time::Duration::from_millis(250);
        ctx.process(8, later).unwrap();
        assert_eq!(ctx.get_state(id), Err(Error::InvalidArgument));
    }

    /// `spec.md` §8 "a repeated user op that is already in progress fails
    /// with the `already invoked` condition."
    #[test]
    fn repeated_close_is_already_invoked() {
        let mut ctx = new_ctx();
        let (local, remote) = addrs();
        let id = ctx.establish(EstablishParams {
            local,
            remote,
            iss: 1000,
            irs: 5000,
            snd_wnd: 65535,
            rcv_wnd_scale: None,
            peer_wnd_scale: None,
            mss: 1460,
            private: false,
            device: DeviceId(0),
        }).unwrap();
        ctx.close(id).unwrap();
        assert_eq!(ctx.close(id), Err(Error::AlreadyInvoked));
        assert_eq!(ctx.get_state(id).unwrap().phase, Phase::Established);
    }

    /// `spec.md` §8 scenario 2 "Reliable delivery under loss": a
    /// third duplicate ACK fast-retransmits `snd.una`'s segment.
    #[test]
    fn three_duplicate_acks_trigger_fast_retransmit() {
        let mut ctx = new_ctx();
        let (local, remote) = addrs();
        let id = ctx.establish(EstablishParams {
            local,
            remote,
            iss: 1000,
            irs: 5000,
            snd_wnd: 65535,
            rcv_wnd_scale: None,
            peer_wnd_scale: None,
            mss: 1460,
            private: false,
            device: DeviceId(0),
        }).unwrap();
        ctx.send(id, &[0u8; 3000]).unwrap();
        let now = Instant::from_millis(0);
        ctx.process(8, now).unwrap();
        let mut out = Vec::new();
        ctx.tx_bulk(DeviceId(0), &mut out, 8);
        assert!(!out.is_empty());

        let dup = make_segment(remote, local, Flags::ACK, 5000, Some(1000), 65535, None, None, &[]);
        let mut rej = Vec::new();
        let mut reasons = Vec::new();
        for _ in 0..3 {
            ctx.rx_bulk(vec![dup.clone()], &mut rej, &mut reasons, 1, now);
        }
        let mut out2 = Vec::new();
        ctx.tx_bulk(DeviceId(0), &mut out2, 8);
        assert!(!out2.is_empty());
        let retx = parse_outbound(&out2[0]);
        assert_eq!(retx.seq_number, Seq::new(1000));
    }
}
