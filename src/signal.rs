/*! Signal sinks: the edge-triggered notification channel for a stream condition.

Per `spec.md` §3/§6 and §9 "Signal sink polymorphism": a sink is either an
event flag (idempotent "raise" primitive) or a callback record, never both.
*/

/// An idempotent, edge-triggered flag. `raise` may be called any number of
/// times while the condition holds; `take` clears it and reports whether it
/// had been raised since the last `take`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventFlag {
    raised: bool,
}

impl EventFlag {
    pub fn raise(&mut self) {
        self.raised = true;
    }

    pub fn take(&mut self) -> bool {
        core::mem::take(&mut self.raised)
    }

    pub fn is_raised(&self) -> bool {
        self.raised
    }
}

/// A callback record: a plain function pointer plus an opaque user word,
/// mirroring `struct tle_stream_cb` (function pointer + opaque argument).
#[derive(Clone, Copy)]
pub struct Callback {
    pub func: fn(u64, SinkKind),
    pub data: u64,
}

impl core::fmt::Debug for Callback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Callback")
            .field("func", &(self.func as usize))
            .field("data", &self.data)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Error,
    Recv,
    Send,
}

/// A sink is either unconfigured, an event flag, or a callback — never both,
/// enforced at construction and at `update_cfg` time.
#[derive(Debug, Default, Clone, Copy)]
pub enum Sink {
    #[default]
    None,
    Event(EventFlag),
    Callback(Callback),
}

impl Sink {
    pub fn is_configured(&self) -> bool {
        !matches!(self, Sink::None)
    }

    /// Arm the sink: raise the event flag, or invoke the callback.
    pub fn arm(&mut self, kind: SinkKind) {
        match self {
            Sink::None => {}
            Sink::Event(flag) => flag.raise(),
            Sink::Callback(cb) => (cb.func)(cb.data, kind),
        }
    }
}

/// The three sinks a stream may carry, per `spec.md` §3.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sinks {
    pub err: Sink,
    pub recv: Sink,
    pub send: Sink,
}

impl Sinks {
    pub fn arm_err(&mut self) {
        self.err.arm(SinkKind::Error);
    }

    pub fn arm_recv(&mut self) {
        self.recv.arm(SinkKind::Recv);
    }

    pub fn arm_send(&mut self) {
        self.send.arm(SinkKind::Send);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_flag_is_idempotent_and_edge_triggered() {
        let mut flag = EventFlag::default();
        assert!(!flag.is_raised());
        flag.raise();
        flag.raise();
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn sink_defaults_to_unconfigured() {
        let sink = Sink::default();
        assert!(!sink.is_configured());
    }
}
