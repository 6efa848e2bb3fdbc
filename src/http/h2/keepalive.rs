//! Keep-alive PING state machine
//!
//! Driven from the connection's tick. After `interval` without any inbound
//! frame a PING goes out; if nothing at all arrives within `timeout` after
//! that, the connection is considered dead. Any received frame counts as
//! proof of life, not only the PING ACK.

use std::time::{Duration, Instant};

/// Keep-alive state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveState {
    /// Traffic seen recently
    Idle,
    /// The caller must send a PING now
    SendPing,
    /// A PING is outstanding
    PingSent,
    /// No response to the PING in time
    Timeout,
}

/// Payload of keep-alive PINGs, so their ACKs can be told apart
pub const KEEP_ALIVE_PING_PAYLOAD: [u8; 8] = *b"h2serve!";

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    timeout: Duration,
    state: KeepAliveState,
    last_frame: Instant,
    ping_sent: Option<Instant>,
}

impl KeepAlive {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        KeepAlive {
            interval,
            timeout,
            state: KeepAliveState::Idle,
            last_frame: now,
            ping_sent: None,
        }
    }

    /// Advance the state machine
    ///
    /// `frame_received` is true when at least one frame arrived since the
    /// last call.
    pub fn process(&mut self, frame_received: bool, now: Instant) -> KeepAliveState {
        if frame_received {
            self.last_frame = now;
            self.ping_sent = None;
            if self.state == KeepAliveState::PingSent {
                self.state = KeepAliveState::Idle;
            }
            return self.state;
        }

        match self.state {
            KeepAliveState::Idle => {
                if now.saturating_duration_since(self.last_frame) > self.interval {
                    self.state = KeepAliveState::PingSent;
                    self.ping_sent = Some(now);
                    return KeepAliveState::SendPing;
                }
            }
            KeepAliveState::PingSent => {
                let sent = self.ping_sent.unwrap_or(now);
                if now.saturating_duration_since(sent) > self.timeout {
                    self.state = KeepAliveState::Timeout;
                }
            }
            KeepAliveState::SendPing | KeepAliveState::Timeout => {}
        }
        self.state
    }

    pub fn state(&self) -> KeepAliveState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_after_idle_interval() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(Duration::from_secs(10), Duration::from_secs(5), start);
        assert_eq!(ka.process(false, start + Duration::from_secs(5)), KeepAliveState::Idle);
        assert_eq!(
            ka.process(false, start + Duration::from_secs(11)),
            KeepAliveState::SendPing
        );
        assert_eq!(
            ka.process(false, start + Duration::from_secs(12)),
            KeepAliveState::PingSent
        );
    }

    #[test]
    fn test_timeout_without_response() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(Duration::from_secs(10), Duration::from_secs(5), start);
        ka.process(false, start + Duration::from_secs(11));
        assert_eq!(
            ka.process(false, start + Duration::from_secs(17)),
            KeepAliveState::Timeout
        );
    }

    #[test]
    fn test_any_frame_resets() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(Duration::from_secs(10), Duration::from_secs(5), start);
        ka.process(false, start + Duration::from_secs(11));
        assert_eq!(
            ka.process(true, start + Duration::from_secs(12)),
            KeepAliveState::Idle
        );
        assert_eq!(
            ka.process(false, start + Duration::from_secs(20)),
            KeepAliveState::Idle
        );
    }
}
