//! # Modem Activity Poller
//!
//! Decides when the byte counters justify asking the modem for its
//! cumulative tx/rx active time, and tracks the single outstanding request.
//!
//! ```text
//!   Idle ──begin()──▶ InFlight ──accept(ticket)──▶ Idle
//!                        │
//!                        └──expire(now)──▶ Idle   (watchdog)
//! ```
//!
//! Each request carries an [`ActivityTicket`] stamped with a generation
//! number. A completion whose ticket is not the one in flight (it arrived
//! after the watchdog gave up) is stale and ignored.

use serde::Deserialize;

use crate::config::EstimatorConfig;
use crate::sampler::TrafficDelta;

/// Modem transmit power levels reported separately.
pub const NUM_TX_POWER_LEVELS: usize = 5;
/// Poll byte threshold is the sample byte threshold divided by this.
pub const TRAFFIC_MODEM_POLL_BYTE_RATIO: i64 = 8;
/// Upper bound of the per-tick poll byte threshold.
pub const TRAFFIC_POLL_BYTE_THRESHOLD_MAX: i64 = 20_000;
/// Rx active time absorbs tx time when `tx / rx > NUM / DEN`.
pub const TX_OVER_RX_TIME_RATIO_NUM: i64 = 3;
pub const TX_OVER_RX_TIME_RATIO_DEN: i64 = 2;

// ─── Reports ────────────────────────────────────────────────────────────────

/// Cumulative modem activity since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ModemActivityReport {
    pub timestamp_ms: u64,
    /// Transmit time per power level.
    pub tx_time_ms: [u64; NUM_TX_POWER_LEVELS],
    pub rx_time_ms: u64,
}

impl ModemActivityReport {
    pub fn total_tx_time_ms(&self) -> u64 {
        self.tx_time_ms.iter().sum()
    }

    /// Activity between `earlier` and `self`.
    pub fn delta_since(&self, earlier: &ModemActivityReport) -> ActivityDelta {
        ActivityDelta {
            time_delta_ms: self.timestamp_ms as i64 - earlier.timestamp_ms as i64,
            tx_time_ms: self.total_tx_time_ms() as i64 - earlier.total_tx_time_ms() as i64,
            rx_time_ms: self.rx_time_ms as i64 - earlier.rx_time_ms as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityDelta {
    pub time_delta_ms: i64,
    pub tx_time_ms: i64,
    pub rx_time_ms: i64,
}

impl ActivityDelta {
    /// Active time attributed to the receive direction. When transmit
    /// dominates, received bytes also flowed during transmit time.
    pub fn rx_active_time_ms(&self) -> i64 {
        if self.tx_time_ms * TX_OVER_RX_TIME_RATIO_DEN > self.rx_time_ms * TX_OVER_RX_TIME_RATIO_NUM {
            self.tx_time_ms + self.rx_time_ms
        } else {
            self.rx_time_ms
        }
    }
}

// ─── Request trigger ────────────────────────────────────────────────────────

fn poll_threshold(byte_threshold: i64) -> i64 {
    (byte_threshold / TRAFFIC_MODEM_POLL_BYTE_RATIO).min(TRAFFIC_POLL_BYTE_THRESHOLD_MAX)
}

/// Byte activity is worth a modem query unless both tick deltas are below
/// their poll thresholds and both accumulators are below the full byte
/// thresholds.
pub fn traffic_warrants_request(
    tick: TrafficDelta,
    accumulated: TrafficDelta,
    tx_byte_threshold: i64,
    rx_byte_threshold: i64,
) -> bool {
    let quiet = tick.tx_bytes < poll_threshold(tx_byte_threshold)
        && tick.rx_bytes < poll_threshold(rx_byte_threshold)
        && accumulated.tx_bytes < tx_byte_threshold
        && accumulated.rx_bytes < rx_byte_threshold;
    !quiet
}

// ─── Poller ─────────────────────────────────────────────────────────────────

/// Identifies one activity request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityTicket {
    generation: u64,
}

impl ActivityTicket {
    pub fn new(generation: u64) -> Self {
        ActivityTicket { generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    ticket: ActivityTicket,
    started_ms: u64,
}

#[derive(Debug)]
pub struct ActivityPoller {
    min_interval_ms: u64,
    timeout_ms: u64,
    fallback_interval_ms: u64,
    generation: u64,
    in_flight: Option<InFlight>,
    last_request_ms: Option<u64>,
    last_filter_update_ms: Option<u64>,
}

impl ActivityPoller {
    pub fn new(config: &EstimatorConfig) -> Self {
        ActivityPoller {
            min_interval_ms: config.modem_poll_min_interval_ms(),
            timeout_ms: config.activity_request_timeout.as_millis() as u64,
            fallback_interval_ms: config.filter_update_max_interval.as_millis() as u64,
            generation: 0,
            in_flight: None,
            last_request_ms: None,
            last_filter_update_ms: None,
        }
    }

    pub fn in_flight(&self) -> Option<ActivityTicket> {
        self.in_flight.map(|f| f.ticket)
    }

    /// No request outstanding and the minimum gap since the last one has
    /// passed.
    pub fn request_allowed(&self, now_ms: u64) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        match self.last_request_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.min_interval_ms,
            None => true,
        }
    }

    pub fn begin(&mut self, now_ms: u64) -> ActivityTicket {
        self.generation += 1;
        let ticket = ActivityTicket::new(self.generation);
        self.in_flight = Some(InFlight {
            ticket,
            started_ms: now_ms,
        });
        self.last_request_ms = Some(now_ms);
        ticket
    }

    /// Clears the in-flight request if `ticket` is it. Returns `false` for
    /// stale completions.
    pub fn accept(&mut self, ticket: ActivityTicket) -> bool {
        match self.in_flight {
            Some(f) if f.ticket == ticket => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    pub fn watchdog_deadline_ms(&self) -> Option<u64> {
        self.in_flight
            .map(|f| f.started_ms.saturating_add(self.timeout_ms))
    }

    /// Abandons the in-flight request once the watchdog deadline passed.
    pub fn expire(&mut self, now_ms: u64) -> Option<ActivityTicket> {
        let deadline = self.watchdog_deadline_ms()?;
        if now_ms < deadline {
            return None;
        }
        self.in_flight.take().map(|f| f.ticket)
    }

    pub fn mark_filter_update(&mut self, now_ms: u64) {
        self.last_filter_update_ms = Some(now_ms);
    }

    /// The fallback filter update is due.
    pub fn filter_update_due(&self, now_ms: u64) -> bool {
        match self.last_filter_update_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.fallback_interval_ms,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(timestamp_ms: u64, tx: [u64; 5], rx: u64) -> ModemActivityReport {
        ModemActivityReport {
            timestamp_ms,
            tx_time_ms: tx,
            rx_time_ms: rx,
        }
    }

    // ─── Report arithmetic ──────────────────────────────────────────────

    #[test]
    fn tx_time_sums_power_levels() {
        let r = report(0, [10, 20, 30, 40, 50], 0);
        assert_eq!(r.total_tx_time_ms(), 150);
    }

    #[test]
    fn delta_between_reports() {
        let a = report(1_000, [100, 0, 0, 0, 0], 500);
        let b = report(6_000, [150, 50, 0, 0, 100], 650);
        let d = b.delta_since(&a);
        assert_eq!(d.time_delta_ms, 5_000);
        assert_eq!(d.tx_time_ms, 200);
        assert_eq!(d.rx_time_ms, 150);
    }

    #[test]
    fn rx_time_absorbs_dominant_tx() {
        let d = ActivityDelta {
            time_delta_ms: 5_000,
            tx_time_ms: 300,
            rx_time_ms: 150,
        };
        assert_eq!(d.rx_active_time_ms(), 450);

        // 300 * 2 == 200 * 3: not strictly greater
        let d = ActivityDelta {
            rx_time_ms: 200,
            ..d
        };
        assert_eq!(d.rx_active_time_ms(), 200);
    }

    // ─── Trigger ────────────────────────────────────────────────────────

    #[test]
    fn quiet_traffic_does_not_poll() {
        let tick = TrafficDelta {
            tx_bytes: 100,
            rx_bytes: 100,
        };
        // thresholds 200 KB / 400 KB: poll thresholds 20000 (capped) each
        assert!(!traffic_warrants_request(tick, tick, 200 * 1024, 400 * 1024));
    }

    #[test]
    fn busy_tick_polls() {
        let tick = TrafficDelta {
            tx_bytes: 100,
            rx_bytes: 20_000,
        };
        assert!(traffic_warrants_request(tick, tick, 200 * 1024, 400 * 1024));
    }

    #[test]
    fn accumulated_bytes_poll() {
        let tick = TrafficDelta {
            tx_bytes: 0,
            rx_bytes: 0,
        };
        let acc = TrafficDelta {
            tx_bytes: 200 * 1024,
            rx_bytes: 0,
        };
        assert!(traffic_warrants_request(tick, acc, 200 * 1024, 400 * 1024));
    }

    #[test]
    fn small_threshold_scales_poll_threshold() {
        // 10 KB threshold: poll threshold 1280 bytes
        let tick = TrafficDelta {
            tx_bytes: 1_280,
            rx_bytes: 0,
        };
        let acc = TrafficDelta {
            tx_bytes: 0,
            rx_bytes: 0,
        };
        assert!(traffic_warrants_request(tick, acc, 10 * 1024, 10 * 1024));
        let tick = TrafficDelta {
            tx_bytes: 1_279,
            ..tick
        };
        assert!(!traffic_warrants_request(tick, acc, 10 * 1024, 10 * 1024));
    }

    // ─── State machine ──────────────────────────────────────────────────

    #[test]
    fn one_request_at_a_time() {
        let mut poller = ActivityPoller::new(&EstimatorConfig::default());
        assert!(poller.request_allowed(0));
        let ticket = poller.begin(0);
        assert_eq!(poller.in_flight(), Some(ticket));
        assert!(!poller.request_allowed(60_000));

        assert!(poller.accept(ticket));
        assert!(!poller.accept(ticket));
        assert!(poller.in_flight().is_none());
    }

    #[test]
    fn minimum_gap_between_requests() {
        let mut poller = ActivityPoller::new(&EstimatorConfig::default());
        let ticket = poller.begin(10_000);
        poller.accept(ticket);
        assert!(!poller.request_allowed(14_999));
        assert!(poller.request_allowed(15_000));
    }

    #[test]
    fn watchdog_abandons_request() {
        let mut poller = ActivityPoller::new(&EstimatorConfig::default());
        let ticket = poller.begin(1_000);
        assert_eq!(poller.watchdog_deadline_ms(), Some(11_000));
        assert_eq!(poller.expire(10_999), None);
        assert_eq!(poller.expire(11_000), Some(ticket));

        // late completion is stale
        assert!(!poller.accept(ticket));
        let next = poller.begin(11_000);
        assert_ne!(next, ticket);
        assert!(next.generation() > ticket.generation());
    }

    #[test]
    fn fallback_filter_cadence() {
        let mut poller = ActivityPoller::new(&EstimatorConfig::default());
        assert!(poller.filter_update_due(0));
        poller.mark_filter_update(1_000);
        assert!(!poller.filter_update_due(6_099));
        assert!(poller.filter_update_due(6_100));
    }
}
