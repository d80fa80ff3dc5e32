//! Admission control: concurrency limiting, FIFO queueing, and rate limiting
//! in front of the downstream inference call.
//!
//! A request is admitted immediately while slots are free, waits in a
//! bounded FIFO queue when they are not, and is rejected synchronously when
//! the queue is full or the rolling rate cap is hit. Queue waits are awaits
//! on a oneshot grant, not blocked threads.
//!
//! All shared state (in-flight set, queue, rate window, limits) lives behind
//! one mutex per controller instance; the critical sections are short and
//! never span an await.

pub mod rate_window;
pub mod ticket;

pub use ticket::{AdmissionSnapshot, CancelOutcome, TicketState};

use crate::metrics::{AggregateStats, MetricsRecorder};
use rate_window::RateWindow;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use usher_common::{AdmissionConfig, Error, Result};

/// Metric tag for time spent between arrival and leaving the queue.
pub const OP_ADMISSION_WAIT: &str = "admission.wait";
/// Metric tag for time spent holding a slot.
pub const OP_ADMISSION_RUN: &str = "admission.run";

const RATE_WINDOW: Duration = Duration::from_secs(60);

struct RunningTicket {
    admitted_at: Instant,
    deadline: Instant,
    cancel_requested: bool,
}

struct Waiter {
    request_id: uuid::Uuid,
    seq: u64,
    enqueued_at: Instant,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct Counters {
    accepted: u64,
    completed: u64,
    failed: u64,
    rejected_queue_full: u64,
    rejected_rate_limited: u64,
    timed_out: u64,
    cancelled: u64,
}

struct ControllerState {
    limits: AdmissionConfig,
    next_seq: u64,
    running: HashMap<uuid::Uuid, RunningTicket>,
    queue: VecDeque<Waiter>,
    rate: RateWindow,
    counters: Counters,
}

struct ControllerInner {
    state: Mutex<ControllerState>,
    recorder: Arc<MetricsRecorder>,
}

impl ControllerInner {
    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Free `request_id`'s slot and hand it to the next live waiter.
    ///
    /// Skips waiters whose receiver is already gone (timed out or cancelled
    /// while their grant was in flight), so a slot can never leak. Returns
    /// false when the ID holds no slot, which makes release idempotent.
    fn release_locked(state: &mut ControllerState, request_id: uuid::Uuid) -> bool {
        if state.running.remove(&request_id).is_none() {
            return false;
        }

        while let Some(waiter) = state.queue.pop_front() {
            let Waiter {
                request_id: next_id,
                seq,
                enqueued_at,
                grant,
            } = waiter;
            let now = Instant::now();
            state.running.insert(
                next_id,
                RunningTicket {
                    admitted_at: now,
                    deadline: now + state.limits.request_timeout(),
                    cancel_requested: false,
                },
            );
            if grant.send(()).is_ok() {
                state.counters.accepted += 1;
                debug!(
                    request_id = %next_id,
                    seq,
                    waited_ms = enqueued_at.elapsed().as_millis() as u64,
                    state = TicketState::Running.as_str(),
                    "granted queued request"
                );
                return true;
            }
            state.running.remove(&next_id);
        }
        true
    }

    /// Release with an outcome. Returns false if the slot was already freed.
    fn finish(&self, request_id: uuid::Uuid, success: bool) -> bool {
        let admitted_at = {
            let mut state = self.lock_state();
            let Some(ticket) = state.running.get(&request_id) else {
                return false;
            };
            let admitted_at = ticket.admitted_at;
            Self::release_locked(&mut state, request_id);
            if success {
                state.counters.completed += 1;
            } else {
                state.counters.failed += 1;
            }
            admitted_at
        };
        self.recorder
            .record(OP_ADMISSION_RUN, admitted_at.elapsed(), success);
        debug!(
            request_id = %request_id,
            success,
            state = TicketState::Completed.as_str(),
            "released"
        );
        true
    }
}

/// RAII handle for one running request's slot.
///
/// The slot is freed exactly once: either explicitly through
/// [`complete`](AdmissionPermit::complete), or on drop (recorded as an
/// unsuccessful run) when the downstream call failed, panicked, or was
/// cancelled.
pub struct AdmissionPermit {
    inner: Arc<ControllerInner>,
    request_id: uuid::Uuid,
    finished: bool,
}

impl AdmissionPermit {
    /// The admitted request's ID.
    pub fn request_id(&self) -> uuid::Uuid {
        self.request_id
    }

    /// Release the slot, recording a successful run.
    pub fn complete(mut self) {
        self.finished = true;
        self.inner.finish(self.request_id, true);
    }

    /// Release the slot, recording an unsuccessful run.
    pub fn fail(mut self) {
        self.finished = true;
        self.inner.finish(self.request_id, false);
    }

    /// Whether this request has run past the admission deadline. The
    /// controller never kills running work; enforcement is the caller's.
    pub fn deadline_exceeded(&self) -> bool {
        let state = self.inner.lock_state();
        state
            .running
            .get(&self.request_id)
            .is_some_and(|t| Instant::now() > t.deadline)
    }

    /// Whether a caller asked to cancel this running request.
    pub fn cancel_requested(&self) -> bool {
        let state = self.inner.lock_state();
        state
            .running
            .get(&self.request_id)
            .is_some_and(|t| t.cancel_requested)
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("request_id", &self.request_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.finish(self.request_id, false);
        }
    }
}

/// Gate deciding whether a request runs now, waits, or is rejected.
///
/// Owns the in-flight set, the bounded FIFO wait queue, and the rolling rate
/// window. One instance per composition root; nothing here is global. Clones
/// share the same state.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<ControllerInner>,
}

impl AdmissionController {
    /// Create a controller with the given limits.
    pub fn new(limits: AdmissionConfig, recorder: Arc<MetricsRecorder>) -> Result<Self> {
        limits.validate().map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                state: Mutex::new(ControllerState {
                    limits,
                    next_seq: 0,
                    running: HashMap::new(),
                    queue: VecDeque::new(),
                    rate: RateWindow::new(RATE_WINDOW),
                    counters: Counters::default(),
                }),
                recorder,
            }),
        })
    }

    /// Admit a request, waiting in the FIFO queue if all slots are busy.
    ///
    /// Returns the slot's RAII permit, or synchronously one of the
    /// backpressure errors: [`Error::RateLimited`] (with retry-after),
    /// [`Error::QueueFull`], [`Error::AdmissionTimeout`] after waiting too
    /// long, or [`Error::AdmissionCancelled`] if the caller cancelled the
    /// queued ticket.
    pub async fn admit(&self, request_id: uuid::Uuid) -> Result<AdmissionPermit> {
        let (grant_rx, timeout, enqueued_at) = {
            let mut state = self.inner.lock_state();
            let now = Instant::now();
            let limits = state.limits.clone();

            if limits.enable_rate_limiting {
                if let Err(retry_after) = state.rate.try_accept(now, limits.rate_limit_per_minute)
                {
                    state.counters.rejected_rate_limited += 1;
                    drop(state);
                    self.inner.recorder.record(OP_ADMISSION_WAIT, Duration::ZERO, false);
                    debug!(
                        request_id = %request_id,
                        retry_after_ms = retry_after.as_millis() as u64,
                        state = TicketState::Rejected.as_str(),
                        "rate limited"
                    );
                    return Err(Error::RateLimited { retry_after });
                }
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            if state.running.len() < limits.max_concurrent_requests {
                state.running.insert(
                    request_id,
                    RunningTicket {
                        admitted_at: now,
                        deadline: now + limits.request_timeout(),
                        cancel_requested: false,
                    },
                );
                state.counters.accepted += 1;
                drop(state);
                self.inner.recorder.record(OP_ADMISSION_WAIT, Duration::ZERO, true);
                debug!(
                    request_id = %request_id,
                    seq,
                    state = TicketState::Running.as_str(),
                    "admitted immediately"
                );
                return Ok(AdmissionPermit {
                    inner: self.inner.clone(),
                    request_id,
                    finished: false,
                });
            }

            if !limits.enable_queuing || state.queue.len() >= limits.max_queue_size {
                let queued = state.queue.len();
                state.counters.rejected_queue_full += 1;
                drop(state);
                self.inner.recorder.record(OP_ADMISSION_WAIT, Duration::ZERO, false);
                warn!(
                    request_id = %request_id,
                    queued,
                    state = TicketState::Rejected.as_str(),
                    "queue full"
                );
                return Err(Error::QueueFull { queued });
            }

            let (grant_tx, grant_rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                request_id,
                seq,
                enqueued_at: now,
                grant: grant_tx,
            });
            debug!(
                request_id = %request_id,
                seq,
                depth = state.queue.len(),
                state = TicketState::Queued.as_str(),
                "queued"
            );
            (grant_rx, limits.request_timeout(), now)
        };

        match tokio::time::timeout(timeout, grant_rx).await {
            Ok(Ok(())) => {
                self.inner
                    .recorder
                    .record(OP_ADMISSION_WAIT, enqueued_at.elapsed(), true);
                Ok(AdmissionPermit {
                    inner: self.inner.clone(),
                    request_id,
                    finished: false,
                })
            }
            Ok(Err(_)) => {
                // Grant sender dropped without firing: cancelled while queued
                self.inner
                    .recorder
                    .record(OP_ADMISSION_WAIT, enqueued_at.elapsed(), false);
                Err(Error::AdmissionCancelled)
            }
            Err(_) => {
                let mut state = self.inner.lock_state();
                let was_queued = Self::remove_from_queue(&mut state, request_id);
                if !was_queued {
                    // The grant raced the timeout and the slot is ours; hand
                    // it straight on so it cannot leak
                    ControllerInner::release_locked(&mut state, request_id);
                }
                state.counters.timed_out += 1;
                drop(state);
                self.inner
                    .recorder
                    .record(OP_ADMISSION_WAIT, enqueued_at.elapsed(), false);
                debug!(
                    request_id = %request_id,
                    state = TicketState::TimedOut.as_str(),
                    "timed out waiting for admission"
                );
                Err(Error::AdmissionTimeout)
            }
        }
    }

    /// Release a running request's slot.
    ///
    /// Idempotent: releasing an unknown or already-released ID does nothing
    /// and returns false, so the in-flight count can never underflow.
    pub fn release(&self, request_id: uuid::Uuid) -> bool {
        self.inner.finish(request_id, true)
    }

    /// Cancel a ticket.
    ///
    /// A queued ticket is removed immediately, freeing its queue slot; its
    /// `admit` call returns [`Error::AdmissionCancelled`]. Cancelling a
    /// running ticket only records the request.
    pub fn cancel(&self, request_id: uuid::Uuid) -> CancelOutcome {
        let mut state = self.inner.lock_state();
        if Self::remove_from_queue(&mut state, request_id) {
            state.counters.cancelled += 1;
            debug!(
                request_id = %request_id,
                state = TicketState::Rejected.as_str(),
                "cancelled while queued"
            );
            return CancelOutcome::Dequeued;
        }
        if let Some(ticket) = state.running.get_mut(&request_id) {
            ticket.cancel_requested = true;
            debug!(request_id = %request_id, "cancellation noted for running request");
            return CancelOutcome::Advisory;
        }
        CancelOutcome::NotFound
    }

    /// Swap in new limits at runtime.
    ///
    /// Applies to subsequently admitted requests only; queued waiters keep
    /// the timeout they were admitted under and nothing in flight is evicted.
    pub fn reconfigure(&self, limits: AdmissionConfig) -> Result<()> {
        limits.validate().map_err(|e| Error::Config(e.to_string()))?;
        let mut state = self.inner.lock_state();
        info!(
            max_concurrent = limits.max_concurrent_requests,
            max_queue = limits.max_queue_size,
            rate_per_minute = limits.rate_limit_per_minute,
            "admission limits reconfigured"
        );
        state.limits = limits;
        Ok(())
    }

    /// Aggregate run-time statistics over the window.
    pub fn metrics(&self, window: Duration) -> AggregateStats {
        self.inner.recorder.get_stats(Some(OP_ADMISSION_RUN), window)
    }

    /// Aggregate queue-wait statistics over the window.
    pub fn wait_metrics(&self, window: Duration) -> AggregateStats {
        self.inner.recorder.get_stats(Some(OP_ADMISSION_WAIT), window)
    }

    /// Point-in-time counters and occupancy.
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let mut state = self.inner.lock_state();
        let now = Instant::now();
        let cap = state.limits.rate_limit_per_minute;
        let remaining = if state.limits.enable_rate_limiting {
            state.rate.remaining(now, cap)
        } else {
            cap
        };
        AdmissionSnapshot {
            running: state.running.len(),
            queued: state.queue.len(),
            running_over_deadline: state.running.values().filter(|t| now > t.deadline).count(),
            remaining_rate_allowance: remaining,
            total_accepted: state.counters.accepted,
            total_completed: state.counters.completed,
            total_failed: state.counters.failed,
            total_rejected_queue_full: state.counters.rejected_queue_full,
            total_rejected_rate_limited: state.counters.rejected_rate_limited,
            total_timed_out: state.counters.timed_out,
            total_cancelled: state.counters.cancelled,
            max_concurrent_requests: state.limits.max_concurrent_requests,
            max_queue_size: state.limits.max_queue_size,
        }
    }

    fn remove_from_queue(state: &mut ControllerState, request_id: uuid::Uuid) -> bool {
        match state.queue.iter().position(|w| w.request_id == request_id) {
            Some(index) => {
                state.queue.remove(index);
                true
            }
            None => false,
        }
    }
}
