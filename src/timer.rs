/*! The timer wheel driving retransmission, persist, delayed-ACK, keep-alive,
and TIME_WAIT expiry (`spec.md` §4.3).

A hashed wheel: each stream/kind pair occupies a single bucket keyed by
`deadline_tick % capacity`, with a carried "rounds" counter for deadlines
further out than one revolution. Insertion, cancellation and per-tick drain
are all amortized O(1), matching the budget `spec.md` §2 sets aside for this
component. A stream is referred to here purely by its pool index, never by
pointer, per `spec.md` §9 "Stream identity and back-pointers" — the same
discipline `crate::pool::Pool` uses for the stream arena itself.
*/

use rustc_hash::FxHashMap;

use crate::time::{Duration, Instant};

pub type StreamIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retransmit,
    Persist,
    DelayedAck,
    KeepAlive,
    TimeWait,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    stream: StreamIndex,
    kind: TimerKind,
    generation: u64,
    rounds_left: u32,
}

/// Per-tick bucket capacity. Not tied to any particular tick duration; a
/// longer-than-one-revolution timer simply carries extra rounds.
const WHEEL_LEN: usize = 1024;

#[derive(Debug)]
pub struct TimerWheel {
    slots: Vec<Vec<Entry>>,
    now_tick: u64,
    tick_duration: Duration,
    /// Current (slot, generation) for every armed (stream, kind) pair. An
    /// entry popped from `slots` whose generation no longer matches here is
    /// stale — it was cancelled or superseded after being scheduled.
    armed: FxHashMap<(StreamIndex, TimerKind), (usize, u64)>,
    next_generation: u64,
}

impl TimerWheel {
    pub fn new(tick_duration: Duration) -> TimerWheel {
        TimerWheel {
            slots: (0..WHEEL_LEN).map(|_| Vec::new()).collect(),
            now_tick: 0,
            tick_duration,
            armed: FxHashMap::default(),
            next_generation: 1,
        }
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    pub fn now_tick(&self) -> u64 {
        self.now_tick
    }

    fn ticks_from_now(&self, deadline: Instant, now: Instant) -> u64 {
        let remaining = deadline.checked_sub_duration(now);
        let ticks = remaining.total_millis() / self.tick_duration.total_millis().max(1);
        ticks + 1 // always at least one tick out, so "now" never self-cancels
    }

    /// Arm (or re-arm) the single timer of `kind` owned by `stream`. Per
    /// `spec.md` §3/§9, at most one timer of each kind is active per stream;
    /// a second call for the same pair replaces the first.
    pub fn schedule(&mut self, stream: StreamIndex, kind: TimerKind, now: Instant, deadline: Instant) {
        let ticks = self.ticks_from_now(deadline, now);
        let slot = ((self.now_tick + ticks) % WHEEL_LEN as u64) as usize;
        let rounds_left = (ticks / WHEEL_LEN as u64) as u32;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.slots[slot].push(Entry {
            stream,
            kind,
            generation,
            rounds_left,
        });
        self.armed.insert((stream, kind), (slot, generation));
    }

    /// Disarm the timer of `kind` owned by `stream`, if any. The stale
    /// wheel entry is left in place and filtered out lazily on drain.
    pub fn cancel(&mut self, stream: StreamIndex, kind: TimerKind) {
        self.armed.remove(&(stream, kind));
    }

    pub fn is_armed(&self, stream: StreamIndex, kind: TimerKind) -> bool {
        self.armed.contains_key(&(stream, kind))
    }

    /// Drop every timer owned by `stream`, e.g. on destruction.
    pub fn cancel_all(&mut self, stream: StreamIndex) {
        self.armed.retain(|&(s, _), _| s != stream);
    }

    /// Advance the wheel by one tick and return every (stream, kind) pair
    /// that fired, still armed with the generation it was scheduled under.
    pub fn advance_one_tick(&mut self) -> Vec<(StreamIndex, TimerKind)> {
        let slot = (self.now_tick % WHEEL_LEN as u64) as usize;
        self.now_tick += 1;

        let mut fired = Vec::new();
        let mut carried = Vec::new();
        for entry in self.slots[slot].drain(..) {
            if entry.rounds_left > 0 {
                carried.push(Entry {
                    rounds_left: entry.rounds_left - 1,
                    ..entry
                });
                continue;
            }
            let current = self.armed.get(&(entry.stream, entry.kind));
            if current == Some(&(slot, entry.generation)) {
                self.armed.remove(&(entry.stream, entry.kind));
                fired.push((entry.stream, entry.kind));
            }
            // else: stale (cancelled, or superseded by a later schedule())
        }
        self.slots[slot].extend(carried);
        fired
    }

    /// Advance by however many whole ticks have elapsed since `now_tick`
    /// was last at `now`, draining every expiry in order. Used by
    /// `Context::process` to catch up after an arbitrary time gap.
    pub fn advance_to(&mut self, elapsed: Duration) -> Vec<(StreamIndex, TimerKind)> {
        let ticks = elapsed.total_millis() / self.tick_duration.total_millis().max(1);
        let mut fired = Vec::new();
        for _ in 0..ticks {
            fired.extend(self.advance_one_tick());
        }
        fired
    }
}

impl Instant {
    /// Saturating variant of `self - other` returning a `Duration`
    /// (re-exposed here rather than in `time.rs` since only the timer
    /// wheel's tick math needs it).
    pub fn checked_sub_duration(&self, other: Instant) -> Duration {
        if *self <= other {
            Duration::ZERO
        } else {
            *self - other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_enough_ticks_elapse() {
        let mut wheel = TimerWheel::new(Duration::from_millis(100));
        let now = Instant::from_millis(0);
        wheel.schedule(5, TimerKind::Retransmit, now, now + Duration::from_millis(250));
        let mut total = Vec::new();
        for _ in 0..4 {
            total.extend(wheel.advance_one_tick());
        }
        assert_eq!(total, vec![(5, TimerKind::Retransmit)]);
    }

    #[test]
    fn cancel_suppresses_a_pending_fire() {
        let mut wheel = TimerWheel::new(Duration::from_millis(100));
        let now = Instant::from_millis(0);
        wheel.schedule(1, TimerKind::KeepAlive, now, now + Duration::from_millis(100));
        wheel.cancel(1, TimerKind::KeepAlive);
        let fired = wheel.advance_one_tick();
        assert!(fired.is_empty());
    }

    #[test]
    fn rescheduling_replaces_the_single_slot_for_that_kind() {
        let mut wheel = TimerWheel::new(Duration::from_millis(100));
        let now = Instant::from_millis(0);
        wheel.schedule(1, TimerKind::Retransmit, now, now + Duration::from_millis(100));
        wheel.schedule(1, TimerKind::Retransmit, now, now + Duration::from_millis(300));
        let mut total = Vec::new();
        for _ in 0..5 {
            total.extend(wheel.advance_one_tick());
        }
        assert_eq!(total, vec![(1, TimerKind::Retransmit)]);
    }

    #[test]
    fn survives_multiple_wheel_revolutions() {
        let mut wheel = TimerWheel::new(Duration::from_millis(1));
        let now = Instant::from_millis(0);
        // 1500 ticks > WHEEL_LEN (1024): exercises the rounds-left carry.
        wheel.schedule(9, TimerKind::TimeWait, now, now + Duration::from_millis(1500));
        let fired = wheel.advance_to(Duration::from_millis(1500));
        assert_eq!(fired, vec![(9, TimerKind::TimeWait)]);
    }
}
