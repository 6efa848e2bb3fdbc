//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 9113 Section 5.2.
//!
//! Two credit pools apply to every DATA frame, one for the connection and one
//! for the stream. Each pool exists twice: an input side charged by DATA the
//! peer sends and replenished by our WINDOW_UPDATEs, and an output side
//! charged by DATA we send and replenished by the peer's WINDOW_UPDATEs.

use super::settings::MAX_WINDOW_SIZE;

/// Flow control window
///
/// A signed credit counter. Consumption is clamped so it never drives the
/// window below zero, but a SETTINGS_INITIAL_WINDOW_SIZE reduction may
/// legitimately leave an output window negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowWindow {
    available: i64,
}

impl FlowWindow {
    /// Create a window holding `initial` bytes of credit
    pub fn new(initial: u32) -> Self {
        FlowWindow {
            available: initial as i64,
        }
    }

    /// Current credit, possibly negative
    pub fn available(&self) -> i64 {
        self.available
    }

    /// Check if any credit is left
    pub fn has_capacity(&self) -> bool {
        self.available > 0
    }

    /// Take up to `requested` bytes of credit
    ///
    /// Returns `(granted, remaining)` where `granted = min(requested, available)`.
    pub fn consume(&mut self, requested: usize) -> (usize, i64) {
        let granted = (requested as i64).min(self.available.max(0));
        self.available -= granted;
        (granted as usize, self.available)
    }

    /// Return credit after a WINDOW_UPDATE
    ///
    /// Returns false, leaving the window untouched, if the result would
    /// exceed 2^31-1.
    pub fn try_restore(&mut self, amount: u32) -> bool {
        let next = self.available + amount as i64;
        if next > MAX_WINDOW_SIZE as i64 {
            return false;
        }
        self.available = next;
        true
    }

    /// Check whether a SETTINGS delta can be applied without overflow
    pub fn can_apply_delta(&self, delta: i64) -> bool {
        self.available + delta <= MAX_WINDOW_SIZE as i64
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE delta, checked beforehand with
    /// `can_apply_delta`
    pub fn apply_delta(&mut self, delta: i64) {
        self.available += delta;
    }
}

/// Receive-side flow control for a connection or a stream
///
/// `try_advance` charges bytes the peer sent; `try_update_window` returns
/// credit as the application consumes them and reports when a WINDOW_UPDATE
/// should go out, batching increments until half the initial window is
/// unacknowledged.
#[derive(Debug, Clone)]
pub struct InputFlowControl {
    window: FlowWindow,
    initial_window_size: u32,
    min_update_increment: u32,
    unacked_bytes: u32,
    window_updates_disabled: bool,
    aborted: bool,
}

impl InputFlowControl {
    /// Create input flow control with the window we advertised
    pub fn new(initial_window_size: u32) -> Self {
        InputFlowControl {
            window: FlowWindow::new(initial_window_size),
            initial_window_size,
            min_update_increment: initial_window_size / 2,
            unacked_bytes: 0,
            window_updates_disabled: false,
            aborted: false,
        }
    }

    /// Current receive credit
    pub fn available(&self) -> i64 {
        self.window.available()
    }

    /// Charge `bytes` received from the peer
    ///
    /// Returns false when the peer sent more than it was allowed to; the
    /// caller raises FLOW_CONTROL_ERROR at the appropriate scope. Data for an
    /// aborted window is still checked against the credit that was open
    /// when the abort happened.
    pub fn try_advance(&mut self, bytes: usize) -> bool {
        if bytes as i64 > self.window.available() {
            return false;
        }
        if self.aborted {
            // Nobody will read this data; it counts as consumed already.
            return true;
        }
        self.window.consume(bytes);
        true
    }

    /// Return `bytes` of credit after the application consumed them
    ///
    /// On success yields the WINDOW_UPDATE increment to send, 0 if none is
    /// due yet. Fails only if the window would overflow.
    pub fn try_update_window(&mut self, bytes: u32) -> Option<u32> {
        if self.aborted {
            return Some(0);
        }
        if !self.window.try_restore(bytes) {
            return None;
        }
        if self.window_updates_disabled {
            return Some(0);
        }

        self.unacked_bytes += bytes;
        if self.unacked_bytes < self.min_update_increment {
            return Some(0);
        }

        let update = self.unacked_bytes;
        self.unacked_bytes = 0;
        Some(update)
    }

    /// Stop issuing WINDOW_UPDATEs, once the peer can send no more data
    pub fn stop_window_updates(&mut self) {
        self.window_updates_disabled = true;
    }

    /// Abort the window
    ///
    /// Returns the credit this window had consumed, which the caller hands
    /// back to the connection window without telling the peer.
    pub fn abort(&mut self) -> u32 {
        if self.aborted {
            return 0;
        }
        self.aborted = true;
        let consumed = self.initial_window_size as i64 - self.window.available();
        consumed.max(0) as u32
    }

    /// Check if the window was aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

/// Send-side flow control for a connection or a stream
#[derive(Debug, Clone)]
pub struct OutputFlowControl {
    window: FlowWindow,
    aborted: bool,
}

impl OutputFlowControl {
    /// Create output flow control from the peer's advertised window
    pub fn new(initial_window_size: u32) -> Self {
        OutputFlowControl {
            window: FlowWindow::new(initial_window_size),
            aborted: false,
        }
    }

    /// Current send credit, possibly negative
    pub fn available(&self) -> i64 {
        self.window.available()
    }

    /// Check if anything may be sent right now
    pub fn is_available(&self) -> bool {
        !self.aborted && self.window.has_capacity()
    }

    /// Take up to `requested` bytes of send credit
    pub fn consume(&mut self, requested: usize) -> usize {
        if self.aborted {
            return 0;
        }
        self.window.consume(requested).0
    }

    /// Apply a WINDOW_UPDATE from the peer, false on overflow
    pub fn try_update_window(&mut self, increment: u32) -> bool {
        // Updates racing with an abort are harmless.
        if self.aborted {
            return true;
        }
        self.window.try_restore(increment)
    }

    /// Check a SETTINGS_INITIAL_WINDOW_SIZE delta
    pub fn can_apply_delta(&self, delta: i64) -> bool {
        self.window.can_apply_delta(delta)
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE delta
    pub fn apply_delta(&mut self, delta: i64) {
        self.window.apply_delta(delta);
    }

    /// Abort, refusing all further consumption
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Reset to a fresh window for stream reuse
    pub fn reset(&mut self, initial_window_size: u32) {
        self.window = FlowWindow::new(initial_window_size);
        self.aborted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_clamps() {
        let mut window = FlowWindow::new(100);
        assert_eq!(window.consume(30), (30, 70));
        assert_eq!(window.consume(100), (70, 0));
        assert_eq!(window.consume(10), (0, 0));
        assert!(!window.has_capacity());
    }

    #[test]
    fn test_consume_restore_round_trip() {
        let mut window = FlowWindow::new(65_535);
        let (granted, _) = window.consume(1000);
        assert!(window.try_restore(granted as u32));
        assert_eq!(window.available(), 65_535);
    }

    #[test]
    fn test_restore_overflow_fails() {
        let mut window = FlowWindow::new(MAX_WINDOW_SIZE);
        assert!(!window.try_restore(1));
        assert_eq!(window.available(), MAX_WINDOW_SIZE as i64);

        let mut window = FlowWindow::new(10);
        assert!(window.try_restore(MAX_WINDOW_SIZE - 10));
        assert!(!window.try_restore(1));
    }

    #[test]
    fn test_negative_delta_then_consume() {
        let mut window = OutputFlowControl::new(100);
        window.consume(80);
        assert!(window.can_apply_delta(-50));
        window.apply_delta(-50);
        assert_eq!(window.available(), -30);
        assert!(!window.is_available());
        assert_eq!(window.consume(10), 0);

        assert!(window.try_update_window(40));
        assert_eq!(window.consume(100), 10);
    }

    #[test]
    fn test_delta_overflow_detected() {
        let window = OutputFlowControl::new(MAX_WINDOW_SIZE - 5);
        assert!(window.can_apply_delta(5));
        assert!(!window.can_apply_delta(6));
    }

    #[test]
    fn test_input_advance_beyond_window() {
        let mut input = InputFlowControl::new(100);
        assert!(input.try_advance(60));
        assert!(!input.try_advance(41));
        assert!(input.try_advance(40));
    }

    #[test]
    fn test_input_window_update_batching() {
        let mut input = InputFlowControl::new(100);
        assert!(input.try_advance(100));
        assert_eq!(input.try_update_window(30), Some(0));
        assert_eq!(input.try_update_window(30), Some(60));
        assert_eq!(input.try_update_window(10), Some(0));
        assert_eq!(input.available(), 70);
    }

    #[test]
    fn test_input_stop_window_updates() {
        let mut input = InputFlowControl::new(100);
        input.try_advance(100);
        input.stop_window_updates();
        assert_eq!(input.try_update_window(100), Some(0));
    }

    #[test]
    fn test_input_abort_returns_consumed() {
        let mut input = InputFlowControl::new(100);
        input.try_advance(40);
        input.try_update_window(10);
        assert_eq!(input.abort(), 30);
        assert_eq!(input.abort(), 0);
        // still bounded by the window at abort time
        assert!(input.try_advance(70));
        assert!(!input.try_advance(71));
        assert_eq!(input.try_update_window(5), Some(0));
    }
}
