//! # Host Interfaces
//!
//! Everything the estimator consumes from the platform: a clock, byte
//! counters, the modem activity query, the serving network state and a
//! sink for published estimates. The statistics store lives in
//! [`crate::stats`].
//!
//! All traits are `Send` so a fully wired estimator can move onto the
//! runtime worker thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use quanta::Instant;

use crate::activity::{ActivityTicket, ModemActivityReport};
use crate::error::ActivityError;
use crate::estimator::EstimatorEvent;
use crate::identity::ServiceState;
use crate::publisher::BandwidthUpdate;

/// Monotonic milliseconds. Modem report timestamps must use the same
/// time base.
pub trait Clock: Send {
    fn now_ms(&self) -> u64;
}

/// Absolute mobile byte counters since boot.
///
/// Signed: a counter reset or glitch may make them go backwards.
pub trait TrafficCounters: Send {
    /// Returns `(tx_bytes, rx_bytes)`.
    fn read(&mut self) -> (i64, i64);
}

/// Asynchronous modem activity query.
///
/// `request` must not block. The host answers later, from any thread, by
/// calling [`ActivityReply::complete`] exactly once. A reply that is never
/// completed is abandoned by the estimator's watchdog.
pub trait ModemActivitySource: Send {
    fn request(&mut self, reply: ActivityReply);
}

/// Pull access to the serving network state.
pub trait ServiceStateSource: Send {
    fn service_state(&self) -> ServiceState;
}

/// Receives every published estimate.
pub trait BandwidthSink: Send {
    fn on_bandwidth_changed(&mut self, update: BandwidthUpdate);
}

impl BandwidthSink for Sender<BandwidthUpdate> {
    fn on_bandwidth_changed(&mut self, update: BandwidthUpdate) {
        if self.send(update).is_err() {
            tracing::trace!("bandwidth consumer gone, update dropped");
        }
    }
}

impl BandwidthSink for Vec<BandwidthUpdate> {
    fn on_bandwidth_changed(&mut self, update: BandwidthUpdate) {
        self.push(update);
    }
}

// ─── Activity reply ─────────────────────────────────────────────────────────

/// Completion handle for one modem activity request.
#[derive(Debug)]
pub struct ActivityReply {
    ticket: ActivityTicket,
    events: Sender<EstimatorEvent>,
}

impl ActivityReply {
    pub(crate) fn new(ticket: ActivityTicket, events: Sender<EstimatorEvent>) -> Self {
        ActivityReply { ticket, events }
    }

    pub fn ticket(&self) -> ActivityTicket {
        self.ticket
    }

    /// Posts the result onto the estimator's queue. A result for an
    /// estimator that is gone is dropped.
    pub fn complete(self, result: Result<ModemActivityReport, ActivityError>) {
        let event = EstimatorEvent::ActivityReturned {
            ticket: self.ticket,
            result,
        };
        if self.events.send(event).is_err() {
            tracing::debug!(generation = self.ticket.generation(), "activity reply after teardown dropped");
        }
    }
}

// ─── Clocks ─────────────────────────────────────────────────────────────────

/// Milliseconds since construction, from `quanta`'s monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Externally driven clock for replays and tests. Clones share the time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
