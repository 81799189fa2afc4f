//! Engine configuration.

use std::time::Duration;

use crate::frame::MIN_MSS;

/// Inbound new-session rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Initial counting-filter size; grows by the same step when the
    /// filter fills past 10%.
    pub filter_size: usize,
    /// Attempts from one address within a filter's lifetime at which
    /// further attempts are rejected.
    pub max_hits: u8,
    /// Filter lifetime before it is recreated.
    pub window: Duration,
    /// Minimum gap between two accepted new sessions.
    pub min_accept_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            filter_size: 1000,
            max_hits: 15,
            window: Duration::from_secs(30),
            min_accept_interval: Duration::from_millis(100),
        }
    }
}

/// Configuration for an [`Engine`](crate::manager::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port the engine's sessions are keyed on.
    pub local_port: u16,
    /// Maximum segment size of one datagram.
    pub mss: usize,
    /// Outbound handshakes in flight above which a warning is logged once.
    pub max_outbound_connections: usize,
    /// Period of the selector's readiness poll.
    pub poll_interval: Duration,
    /// Emit a trace event per frame sent and received.
    pub trace_protocol: bool,
    /// Segments a connection may buffer before it is failed.
    pub read_buffer_capacity: usize,
    /// Size window of a datagram that may open a new inbound session.
    pub initial_packet_min: usize,
    pub initial_packet_max: usize,
    pub rate_limit: RateLimitConfig,
    /// How long the timer thread lingers with no sessions before exiting.
    pub timer_linger: Duration,
}

impl EngineConfig {
    /// The effective segment size, never below [`MIN_MSS`].
    pub fn effective_mss(&self) -> usize {
        self.mss.max(MIN_MSS)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_port: 6881,
            mss: 1400,
            max_outbound_connections: 2048,
            poll_interval: Duration::from_millis(100),
            trace_protocol: false,
            read_buffer_capacity: 256,
            initial_packet_min: 96,
            initial_packet_max: 96 + 512 / 2,
            rate_limit: RateLimitConfig::default(),
            timer_linger: Duration::from_secs(30),
        }
    }
}
