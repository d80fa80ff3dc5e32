//! Sliding window of accepted-request timestamps.
//!
//! Internal to the admission controller; the cap is passed in on every call
//! so hot-reconfigured limits take effect without rebuilding the window.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub(crate) struct RateWindow {
    window: Duration,
    accepted: VecDeque<Instant>,
}

impl RateWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            accepted: VecDeque::new(),
        }
    }

    /// Record an acceptance if the window has room.
    ///
    /// On rejection returns the time until the oldest timestamp in the
    /// window expires, i.e. when the next slot opens.
    pub(crate) fn try_accept(&mut self, now: Instant, cap: u32) -> Result<(), Duration> {
        self.prune(now);
        if self.accepted.len() >= cap as usize {
            let retry_after = match self.accepted.front() {
                Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                None => self.window,
            };
            return Err(retry_after);
        }
        self.accepted.push_back(now);
        Ok(())
    }

    /// Acceptances still available in the current window.
    pub(crate) fn remaining(&mut self, now: Instant, cap: u32) -> u32 {
        self.prune(now);
        (cap as usize).saturating_sub(self.accepted.len()) as u32
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.accepted.front() {
            if *oldest + self.window <= now {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
    }
}
