//! Retransmission timing: the external timer contract and the backoff
//! policy driving it.

use std::time::Duration;

/// State reported by an external timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No timer is running.
    Cancelled,
    /// Running, the intermediate threshold has not passed.
    PreIntermediate,
    /// The intermediate threshold has passed, the final one has not.
    PostIntermediate,
    /// The final threshold has passed.
    Expired,
}

/// External monotonic timer, supplied by the embedding application.
///
/// The stack arms the timer when it starts waiting for the peer and polls
/// it on every read attempt. Implementations only need to remember the two
/// thresholds and compare against a monotonic clock; nothing here may
/// block.
pub trait Timer {
    /// Arm the timer with an intermediate and a final threshold.
    fn set(&mut self, intermediate: Duration, final_: Duration);

    /// Cancel the timer; subsequent [`Timer::get`] returns
    /// [`TimerState::Cancelled`].
    fn cancel(&mut self);

    /// Report the current timer state.
    fn get(&self) -> TimerState;
}

/// Doubling retransmission timeout, clamped to a configured range.
///
/// Every expiry without progress doubles the timeout up to the maximum;
/// any progress event resets it to the minimum. The sequence of timeouts
/// under persistent loss is therefore geometric with ratio 2 until it
/// saturates.
#[derive(Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    /// Consecutive expiries spent at the maximum timeout.
    saturated: usize,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Backoff {
            min,
            max,
            current: min,
            saturated: 0,
        }
    }

    /// The timeout to arm next.
    pub fn timeout(&self) -> Duration {
        self.current
    }

    /// Register an expiry without progress.
    pub fn bump(&mut self) {
        if self.current >= self.max {
            self.saturated += 1;
            return;
        }
        self.current = (self.current * 2).min(self.max);
    }

    /// Register progress; the timeout returns to the minimum.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.saturated = 0;
    }

    /// Number of consecutive expiries spent at the maximum timeout.
    pub fn saturated_expiries(&self) -> usize {
        self.saturated
    }
}
