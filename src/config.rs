/*! Context-scoped parameters.

Per `spec.md` §9 ("Global parameters... all scoped to the context, not
process-global. No hidden module-level state."), every tunable a stream
needs at creation time comes from here rather than from a constant.
*/

use crate::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    /// Number of stream slots in the context's pool.
    pub max_streams: usize,
    /// Number of lightweight half-open shadow entries per listening stream.
    pub listen_backlog: usize,
    /// MSS advertised/assumed absent explicit negotiation.
    pub default_mss: usize,
    /// Max retransmission attempts before a stream is declared dead (§4.3).
    pub nb_retries: u8,
    /// Initial retransmission timeout.
    pub rto_initial: Duration,
    /// Floor for the retransmission timeout, post smoothing.
    pub rto_min: Duration,
    /// Ceiling for the retransmission timeout.
    pub rto_max: Duration,
    /// Maximum Segment Lifetime, governing TIME_WAIT duration (2*MSL).
    pub msl: Duration,
    /// Idle interval after which a keep-alive probe is armed.
    pub keep_alive_idle: Duration,
    /// Delayed-ACK hold-off.
    pub delayed_ack: Duration,
    /// Tick granularity for the timer wheel.
    pub tick: Duration,
    /// Headroom (in bytes) reserved ahead of each emitted segment for the
    /// device's L2/L3 header synthesis (`spec.md` §6 "Packet buffer").
    pub tx_headroom: usize,
    /// Minimum spacing between challenge ACKs sent to the same stream
    /// (`spec.md` §4.5 supplement, RFC 5961).
    pub challenge_ack_interval: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            max_streams: 1024,
            listen_backlog: 128,
            default_mss: 536,
            nb_retries: 3,
            rto_initial: Duration::from_secs(1),
            rto_min: Duration::from_millis(200),
            rto_max: Duration::from_secs(60),
            // spec.md §9: "The exact MSL used for TIME_WAIT is not fixed by
            // the surface; adopt 30 s unless the context overrides it."
            msl: Duration::from_secs(30),
            keep_alive_idle: Duration::from_secs(7200),
            delayed_ack: Duration::from_millis(200),
            tick: Duration::from_millis(100),
            tx_headroom: 40,
            challenge_ack_interval: Duration::from_millis(1000),
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_streams == 0
            || self.default_mss == 0
            || self.nb_retries == 0
            || self.tick == Duration::ZERO
        {
            return Err(crate::error::Error::InvalidArgument);
        }
        Ok(())
    }
}
