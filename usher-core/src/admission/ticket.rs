//! Ticket lifecycle and controller status types.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one admission ticket.
///
/// Happy path is `Queued → Running → Completed`. A ticket short-circuits to
/// `Rejected` (queue full, rate limited, or cancelled while queued) or
/// `TimedOut` (queued past the wait timeout). A `Running` ticket only ever
/// becomes `Completed`; it is never forcibly rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketState {
    /// Waiting in the FIFO queue for a slot.
    Queued,
    /// Holding an execution slot.
    Running,
    /// Finished and released, successfully or not.
    Completed,
    /// Never ran: queue full, rate limited, or cancelled.
    Rejected,
    /// Never ran: waited past the admission timeout.
    TimedOut,
}

impl TicketState {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Point-in-time view of the admission controller.
///
/// Every field carries an explicit default; a fresh controller reports
/// `AdmissionSnapshot::default()` with its configured limits filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    /// Requests currently holding a slot.
    pub running: usize,
    /// Requests currently waiting in the queue.
    pub queued: usize,
    /// Running requests past their admission deadline, flagged for the
    /// caller's own cancellation policy.
    pub running_over_deadline: usize,
    /// Acceptances still available in the current rate window.
    pub remaining_rate_allowance: u32,
    /// Tickets that reached `Running`.
    pub total_accepted: u64,
    /// Tickets released after a successful downstream call.
    pub total_completed: u64,
    /// Tickets released after a failed or abandoned downstream call.
    pub total_failed: u64,
    /// Arrivals rejected because the queue was full.
    pub total_rejected_queue_full: u64,
    /// Arrivals rejected by the rate gate.
    pub total_rejected_rate_limited: u64,
    /// Queued tickets that waited past the timeout.
    pub total_timed_out: u64,
    /// Queued tickets cancelled by their caller.
    pub total_cancelled: u64,
    /// Configured concurrency limit at snapshot time.
    pub max_concurrent_requests: usize,
    /// Configured queue capacity at snapshot time.
    pub max_queue_size: usize,
}

/// What happened to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The ticket was still queued and has been removed; its slot is free.
    Dequeued,
    /// The ticket is already running; the cancellation was recorded but the
    /// downstream call is not terminated by this controller.
    Advisory,
    /// No queued or running ticket with that ID.
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_labels() {
        assert_eq!(TicketState::Queued.as_str(), "queued");
        assert_eq!(TicketState::TimedOut.as_str(), "timed_out");
    }

    #[test]
    fn test_snapshot_defaults_to_zero() {
        let snapshot = AdmissionSnapshot::default();
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.total_accepted, 0);
        assert_eq!(snapshot.remaining_rate_allowance, 0);
    }
}
