//! Flow-control windows (RFC 7540 Section 5.2 and 6.9).
//!
//! A connection keeps one [`SendWindow`] and one [`RecvWindow`] for itself
//! and one of each per stream. Outbound DATA needs credit in both send
//! windows; inbound DATA is charged against both receive windows and handed
//! back in WINDOW_UPDATE frames once the application has consumed it.

use crate::h2::consts::MAX_WINDOW_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowControlError {
    #[error("flow-control window would exceed 2^31-1")]
    Overflow,
    #[error("peer sent {received} bytes with only {available} bytes of window")]
    Exceeded { received: usize, available: i64 },
}

/// Credit the peer has granted us for outbound DATA.
///
/// The window is signed: a SETTINGS_INITIAL_WINDOW_SIZE reduction may push
/// it below zero, in which case nothing can be sent until the peer restores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    window: i64,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    pub fn available(&self) -> usize {
        self.window.max(0) as usize
    }

    /// Applies a WINDOW_UPDATE increment.
    pub fn increase(&mut self, increment: u32) -> Result<(), FlowControlError> {
        self.apply_delta(increment as i64)
    }

    /// Applies the difference between an old and a new initial window size.
    pub fn apply_delta(&mut self, delta: i64) -> Result<(), FlowControlError> {
        let next = self.window + delta;
        if next > MAX_WINDOW_SIZE as i64 {
            return Err(FlowControlError::Overflow);
        }
        self.window = next;
        Ok(())
    }

    pub fn consume(&mut self, len: usize) {
        debug_assert!(len as i64 <= self.window);
        self.window -= len as i64;
    }
}

/// Credit we have granted the peer for inbound DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    window: i64,
    target: u32,
    unacknowledged: u32,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
            target: initial,
            unacknowledged: 0,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    pub fn unacknowledged(&self) -> u32 {
        self.unacknowledged
    }

    /// Charges an inbound DATA frame against the window.
    pub fn receive(&mut self, len: usize) -> Result<(), FlowControlError> {
        if len as i64 > self.window {
            return Err(FlowControlError::Exceeded {
                received: len,
                available: self.window,
            });
        }
        self.window -= len as i64;
        Ok(())
    }

    /// Records `len` bytes consumed by the application. Returns the increment
    /// to announce once at least half of the target window is waiting to be
    /// restocked.
    pub fn release(&mut self, len: usize) -> Option<u32> {
        self.unacknowledged = self.unacknowledged.saturating_add(len as u32);
        if self.unacknowledged == 0 || self.unacknowledged < self.target / 2 {
            return None;
        }
        let increment = self.unacknowledged;
        self.unacknowledged = 0;
        self.window += increment as i64;
        Some(increment)
    }

    /// Moves the window and its target by the difference between an old and
    /// a new SETTINGS_INITIAL_WINDOW_SIZE. The window may go negative.
    pub fn apply_delta(&mut self, delta: i64) {
        self.window += delta;
        self.target = (self.target as i64 + delta).clamp(0, MAX_WINDOW_SIZE as i64) as u32;
    }

    /// Raises the target window, returning the increment to announce.
    pub fn grow_to(&mut self, target: u32) -> Option<u32> {
        if target <= self.target {
            return None;
        }
        let increment = target - self.target;
        self.target = target;
        self.window += increment as i64;
        Some(increment)
    }
}

/// How many bytes of a `requested`-byte write may go out right now: bounded
/// by both send windows and by the peer's maximum frame size.
pub fn send_capacity(
    stream: &SendWindow,
    connection: &SendWindow,
    requested: usize,
    max_frame_size: usize,
) -> usize {
    requested
        .min(stream.available())
        .min(connection.available())
        .min(max_frame_size)
}

/// Takes up to `requested` bytes of credit from both windows at once.
pub fn reserve(
    stream: &mut SendWindow,
    connection: &mut SendWindow,
    requested: usize,
    max_frame_size: usize,
) -> usize {
    let len = send_capacity(stream, connection, requested, max_frame_size);
    stream.consume(len);
    connection.consume(len);
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;

    #[test]
    fn increase_past_maximum_overflows() {
        let mut window = SendWindow::new(MAX_WINDOW_SIZE - 10);
        assert!(window.increase(10).is_ok());
        assert_eq!(window.increase(1), Err(FlowControlError::Overflow));
        assert_eq!(window.window(), MAX_WINDOW_SIZE as i64);
    }

    #[test]
    fn settings_delta_can_go_negative() {
        let mut window = SendWindow::new(100);
        window.consume(80);
        window.apply_delta(-50).unwrap();
        assert_eq!(window.window(), -30);
        assert_eq!(window.available(), 0);
        window.increase(40).unwrap();
        assert_eq!(window.available(), 10);
    }

    #[test]
    fn receive_beyond_window_is_rejected() {
        let mut window = RecvWindow::new(10);
        window.receive(6).unwrap();
        assert!(matches!(
            window.receive(5),
            Err(FlowControlError::Exceeded { received: 5, available: 4 })
        ));
    }

    #[test]
    fn release_restocks_at_half_the_target() {
        let mut window = RecvWindow::new(100);
        window.receive(100).unwrap();
        assert_eq!(window.release(30), None);
        assert_eq!(window.release(19), None);
        assert_eq!(window.release(1), Some(50));
        assert_eq!(window.window(), 50);
        assert_eq!(window.unacknowledged(), 0);
    }

    #[test]
    fn shrinking_receive_window_can_go_negative() {
        let mut window = RecvWindow::new(65_535);
        window.receive(1_000).unwrap();
        window.apply_delta(100 - 65_535);
        assert_eq!(window.window(), -900);
        assert!(window.receive(1).is_err());
        assert_eq!(window.release(1_000), Some(1_000));
        assert_eq!(window.window(), 100);
    }

    #[test]
    fn grow_to_announces_the_difference() {
        let mut window = RecvWindow::new(65_535);
        assert_eq!(window.grow_to(1 << 20), Some((1 << 20) - 65_535));
        assert_eq!(window.grow_to(1000), None);
        assert_eq!(window.window(), 1 << 20);
    }

    #[test]
    fn reserve_takes_from_both_windows() {
        let mut stream = SendWindow::new(10);
        let mut connection = SendWindow::new(4);
        assert_eq!(reserve(&mut stream, &mut connection, 8, 16_384), 4);
        assert_eq!(stream.window(), 6);
        assert_eq!(connection.window(), 0);
        assert_eq!(reserve(&mut stream, &mut connection, 8, 16_384), 0);
    }

    #[test]
    fn reserve_respects_max_frame_size() {
        let mut stream = SendWindow::new(100_000);
        let mut connection = SendWindow::new(100_000);
        assert_eq!(reserve(&mut stream, &mut connection, 50_000, 16_384), 16_384);
    }

    /// Two streams share one connection window while WINDOW_UPDATE frames for
    /// all three windows arrive in random order. In-flight bytes never exceed
    /// what the peer granted.
    #[test]
    fn in_flight_bytes_never_exceed_granted_windows() {
        let mut rng = rand::rng();

        for _ in 0..200 {
            let initial: u32 = rng.random_range(0..2_000);
            let mut connection = SendWindow::new(initial);
            let mut streams = [SendWindow::new(initial), SendWindow::new(initial)];
            let mut pending = [rng.random_range(1..20_000usize), rng.random_range(1..20_000usize)];
            let mut granted_conn = initial as u64;
            let mut granted_stream = [initial as u64, initial as u64];
            let mut sent_conn = 0u64;
            let mut sent_stream = [0u64, 0u64];

            // 0 = connection, 1 and 2 = streams
            let mut updates: Vec<(usize, u32)> = (0..60)
                .map(|_| (rng.random_range(0..3usize), rng.random_range(0..1_500u32)))
                .collect();
            updates.shuffle(&mut rng);

            for (target, increment) in updates {
                match target {
                    0 => {
                        connection.increase(increment).unwrap();
                        granted_conn += increment as u64;
                    }
                    n => {
                        streams[n - 1].increase(increment).unwrap();
                        granted_stream[n - 1] += increment as u64;
                    }
                }

                for idx in 0..2 {
                    let len = reserve(&mut streams[idx], &mut connection, pending[idx], 16_384);
                    pending[idx] -= len;
                    sent_stream[idx] += len as u64;
                    sent_conn += len as u64;

                    assert!(sent_stream[idx] <= granted_stream[idx]);
                    assert!(sent_conn <= granted_conn);
                    assert!(streams[idx].window() >= 0);
                    assert!(connection.window() >= 0);
                }
            }
        }
    }
}
