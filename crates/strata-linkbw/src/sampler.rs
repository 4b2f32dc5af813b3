//! # Counter Sampler
//!
//! Periodic byte counter polling, active only while the device is in a
//! state where cellular throughput is meaningful: screen on, default route
//! over cellular, and this subscription carrying data.
//!
//! A negative delta means the counters glitched. The glitching tick and
//! the one after it are both discarded.

/// Byte counts for one tick, or accumulated since the last modem report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub tx_bytes: i64,
    pub rx_bytes: i64,
}

/// Conditions that must all hold for the sampler to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollGate {
    pub screen_on: bool,
    pub default_route_cellular: bool,
    pub active_data: bool,
}

impl PollGate {
    pub fn is_open(&self) -> bool {
        self.screen_on && self.default_route_cellular && self.active_data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Delta accumulated.
    Counted(TrafficDelta),
    /// This tick or the previous one glitched; nothing accumulated.
    Discarded(TrafficDelta),
}

#[derive(Debug)]
pub struct CounterSampler {
    gate: PollGate,
    last_tx_bytes: i64,
    last_rx_bytes: i64,
    last_tick_valid: bool,
    accumulated: TrafficDelta,
    next_tick_ms: Option<u64>,
}

impl Default for CounterSampler {
    fn default() -> Self {
        CounterSampler {
            gate: PollGate::default(),
            last_tx_bytes: 0,
            last_rx_bytes: 0,
            last_tick_valid: true,
            accumulated: TrafficDelta::default(),
            next_tick_ms: None,
        }
    }
}

impl CounterSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self) -> PollGate {
        self.gate
    }

    /// Each setter returns `true` if the value changed.
    pub fn set_screen_on(&mut self, on: bool) -> bool {
        std::mem::replace(&mut self.gate.screen_on, on) != on
    }

    pub fn set_default_route_cellular(&mut self, cellular: bool) -> bool {
        std::mem::replace(&mut self.gate.default_route_cellular, cellular) != cellular
    }

    pub fn set_active_data(&mut self, active: bool) -> bool {
        std::mem::replace(&mut self.gate.active_data, active) != active
    }

    pub fn next_tick_ms(&self) -> Option<u64> {
        self.next_tick_ms
    }

    pub fn tick_due(&self, now_ms: u64) -> bool {
        self.next_tick_ms.is_some_and(|t| now_ms >= t)
    }

    /// Cancels the scheduled tick.
    pub fn stop(&mut self) {
        self.next_tick_ms = None;
    }

    pub fn accumulated(&self) -> TrafficDelta {
        self.accumulated
    }

    pub fn reset_accumulators(&mut self) {
        self.accumulated = TrafficDelta::default();
    }

    /// Folds one counter reading in and schedules the next tick
    /// `interval_ms` later.
    pub fn tick(&mut self, tx_bytes: i64, rx_bytes: i64, now_ms: u64, interval_ms: u64) -> TickOutcome {
        let delta = TrafficDelta {
            tx_bytes: tx_bytes - self.last_tx_bytes,
            rx_bytes: rx_bytes - self.last_rx_bytes,
        };
        self.next_tick_ms = Some(now_ms + interval_ms);
        self.last_tx_bytes = tx_bytes;
        self.last_rx_bytes = rx_bytes;

        let valid = delta.tx_bytes >= 0 && delta.rx_bytes >= 0;
        if !self.last_tick_valid || !valid {
            self.last_tick_valid = valid;
            return TickOutcome::Discarded(delta);
        }

        self.accumulated.tx_bytes += delta.tx_bytes;
        self.accumulated.rx_bytes += delta.rx_bytes;
        TickOutcome::Counted(delta)
    }
}
