//! Typed configuration knobs.
//!
//! Injected explicitly at construction; the core never consults process
//! globals.

use std::time::Duration;

/// Largest payload a single RUDP packet carries: path MTU minus the
/// RUDP header overhead.
pub const DEFAULT_SEGMENT_SIZE: usize = 1200;

/// Knobs for the RUDP core (transports, channels, channel streams).
#[derive(Debug, Clone)]
pub struct RudpConfig {
    /// Maximum payload bytes per packet.
    pub segment_size: usize,
    /// Floor for RTT estimation and the ACK deadline math.
    pub min_rtt: Duration,
    /// Idle lifetime before a channel is declared dead.
    pub lifetime: Duration,
    /// Channel-number probe attempts before giving up with 508.
    pub max_channel_attempts: u32,
    /// Backgrounding phase this subsystem participates in.
    pub backgrounding_phase: u32,
}

impl Default for RudpConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            min_rtt: Duration::from_millis(80),
            lifetime: Duration::from_secs(600),
            max_channel_attempts: 5,
            backgrounding_phase: 2,
        }
    }
}

/// Knobs for the framed messaging layers.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Largest frame accepted before the session fails with 412.
    pub max_message_size: usize,
    /// Whether TCP frames carry a leading channel id word.
    pub frames_have_channel_number: bool,
    /// Backgrounding phase this subsystem participates in.
    pub backgrounding_phase: u32,
    /// Default linger before tear-down on shutdown.
    pub default_linger: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            frames_have_channel_number: false,
            backgrounding_phase: 3,
            default_linger: Duration::from_secs(1),
        }
    }
}
