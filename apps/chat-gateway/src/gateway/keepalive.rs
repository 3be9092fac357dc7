//! Liveness probing cadence for a single connection.
//!
//! The outbound loop sends a ping every `ping_period`; the inbound loop gives
//! up on a peer it has not heard from within `pong_wait`. Probing several
//! times per window means one lost pong never evicts a healthy peer.

use std::time::Duration;

/// Probes sent per idle window.
const PROBES_PER_WINDOW: u32 = 10;

/// Timing policy shared by the read and write halves of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepalivePolicy {
    /// Silence tolerated before the read half gives up.
    pub pong_wait: Duration,
    /// Interval between pings on the write half.
    pub ping_period: Duration,
    /// Deadline for flushing a single write batch.
    pub write_wait: Duration,
}

impl KeepalivePolicy {
    /// Derive the ping cadence from the idle window.
    pub fn from_idle_window(pong_wait: Duration, write_wait: Duration) -> Self {
        let ping_period = (pong_wait / PROBES_PER_WINDOW).max(Duration::from_millis(1));
        Self {
            pong_wait,
            ping_period,
            write_wait,
        }
    }
}
