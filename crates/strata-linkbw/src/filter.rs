//! # Bandwidth Filter
//!
//! One instance per link direction. Turns an accepted byte/active-time
//! sample into an instantaneous rate, and blends it into the estimate with
//! an exponentially weighted filter whose time constant depends on how much
//! the operating condition changed since the previous update.
//!
//! $$w = \mathrm{round}\left(128 \cdot e^{-\Delta t / \tau}\right), \qquad
//! \hat{b} \leftarrow \frac{\hat{b} \cdot w + x \cdot (128 - w)}{128}$$
//!
//! The weight is fixed point and the blend is computed in `i64`,
//! multiplying before dividing, so results are bit-reproducible.
//!
//! When no sample is usable the filter input falls back to the long-term
//! average for the current network, then to the static per-RAT baseline.

use crate::config::EstimatorConfig;
use crate::identity::IdentitySnapshot;
use crate::publisher::UpdateBaseline;
use crate::stats::{hierarchical_average, LinkDirection, NetworkStatsStore};

/// Fixed-point base of the filter weight.
pub const FILTER_SCALE: i64 = 128;
/// Weight is forced to 0 once the elapsed time exceeds this many time
/// constants.
pub const LARGE_TIME_DECAY_RATIO: i64 = 4;
/// Samples faster than this multiple of the static baseline are bogus.
pub const MAX_BW_TO_STATIC_BW_RATIO: i64 = 15;
/// RATs with a static baseline above this use the per-level byte table.
pub const HIGH_BANDWIDTH_THRESHOLD_KBPS: i32 = 5_000;
/// Byte threshold seeds in KB, `[direction][signal level]`.
pub const BYTE_DELTA_THRESHOLD_KB: [[i64; 5]; 2] =
    [[200, 300, 400, 600, 1_000], [400, 600, 800, 1_000, 1_000]];
pub const LOW_BW_TO_AVG_BW_RATIO_NUM: i64 = 3;
pub const LOW_BW_TO_AVG_BW_RATIO_DEN: i64 = 8;
pub const BYTE_DELTA_ACC_THRESHOLD_MAX_KB: i64 = 8_000;
pub const BYTE_DELTA_THRESHOLD_MIN_KB: i64 = 10;
/// Error percentages are clamped to ±this.
pub const MAX_ERROR_PERCENT: i64 = 100 * 100;

/// Everything a filter operation reads from the rest of the engine.
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub identity: &'a IdentitySnapshot,
    pub config: &'a EstimatorConfig,
    pub now_ms: u64,
}

impl FilterContext<'_> {
    fn avg_used_kbps(
        &self,
        store: &dyn NetworkStatsStore,
        direction: LinkDirection,
    ) -> Option<i32> {
        hierarchical_average(
            store,
            &self.identity.fine_key(),
            &self.identity.coarse_key(),
            direction,
            self.identity.level_index(),
            self.config.stats_count_threshold,
        )
        .filter(|&avg| avg > 0)
    }
}

/// Why a sample was not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRejection {
    /// Fewer bytes moved than the direction's byte threshold.
    BelowByteThreshold { bytes: i64, threshold: i64 },
    /// The modem was active for too short a time to trust the rate.
    ActiveTimeTooShort { active_ms: i64 },
    /// Negative, or implausibly high for the current RAT.
    OutOfRange { kbps: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted { kbps: i32 },
    Rejected(SampleRejection),
}

/// Estimate quality of one cycle, as percent error against the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    pub direction: LinkDirection,
    pub sample_kbps: i32,
    /// Last value sent to consumers.
    pub published_error_percent: i32,
    /// Long-term average.
    pub average_error_percent: i32,
    /// Filter output.
    pub filtered_error_percent: i32,
    /// Static baseline ("cold start").
    pub static_error_percent: i32,
}

/// Instantaneous rate in kbps: `bytes * 8 / ms * 1000 / 1024`, left to
/// right in integer arithmetic.
pub fn sample_kbps(bytes: i64, active_ms: i64) -> i64 {
    bytes * 8 / active_ms * 1000 / 1024
}

/// Fixed-point weight of the previous estimate after `elapsed_sec`.
pub fn filter_weight(elapsed_sec: i64, time_constant_sec: i64) -> i64 {
    if elapsed_sec > LARGE_TIME_DECAY_RATIO * time_constant_sec {
        return 0;
    }
    let decay = (-(elapsed_sec as f64) / time_constant_sec as f64).exp();
    (FILTER_SCALE as f64 * decay).round() as i64
}

/// `(prev * w + input * (128 - w)) / 128`, clamped to `0..=i32::MAX`.
pub fn blend(prev_kbps: i32, input_kbps: i32, weight: i64) -> i32 {
    let prev = i64::from(prev_kbps);
    let input = i64::from(input_kbps);
    let out = (prev * weight + input * FILTER_SCALE - input * weight) / FILTER_SCALE;
    out.clamp(0, i64::from(i32::MAX)) as i32
}

/// Bytes an average rate moves in `duration_ms`, scaled by 3/8.
fn byte_count_threshold(avg_kbps: i64, duration_ms: i64) -> i64 {
    let avg_bytes = avg_kbps / 8 * duration_ms;
    let result = avg_bytes * LOW_BW_TO_AVG_BW_RATIO_NUM / LOW_BW_TO_AVG_BW_RATIO_DEN;
    result.min(i64::from(i32::MAX))
}

fn error_percent(estimate_kbps: i32, sample_kbps: i32) -> i32 {
    let err = 100 * (i64::from(estimate_kbps) - i64::from(sample_kbps)) / i64::from(sample_kbps);
    err.clamp(-MAX_ERROR_PERCENT, MAX_ERROR_PERCENT) as i32
}

/// Per-direction filter state.
#[derive(Debug, Clone)]
pub struct BandwidthFilter {
    direction: LinkDirection,
    filter_kbps: i32,
    byte_threshold: i64,
    avg_used_kbps: Option<i32>,
    sample_kbps: i32,
    sample_valid: bool,
    sample_valid_at_ms: Option<u64>,
    static_kbps: i32,
    last_published_kbps: i32,
}

impl BandwidthFilter {
    /// Starts at the static baseline so the estimate is always defined.
    pub fn new(direction: LinkDirection, static_kbps: i32) -> Self {
        BandwidthFilter {
            direction,
            filter_kbps: static_kbps,
            byte_threshold: BYTE_DELTA_THRESHOLD_KB[direction.index()][0] * 1024,
            avg_used_kbps: None,
            sample_kbps: 0,
            sample_valid: false,
            sample_valid_at_ms: None,
            static_kbps,
            last_published_kbps: 0,
        }
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn filtered_kbps(&self) -> i32 {
        self.filter_kbps
    }

    pub fn byte_threshold(&self) -> i64 {
        self.byte_threshold
    }

    pub fn static_kbps(&self) -> i32 {
        self.static_kbps
    }

    /// Result of the most recent average lookup.
    pub fn avg_used_kbps(&self) -> Option<i32> {
        self.avg_used_kbps
    }

    pub fn sample(&self) -> Option<i32> {
        self.sample_valid.then_some(self.sample_kbps)
    }

    pub fn last_published_kbps(&self) -> i32 {
        self.last_published_kbps
    }

    /// Sets the static baseline. Returns `true` if it changed.
    pub fn set_static_kbps(&mut self, kbps: i32) -> bool {
        let changed = self.static_kbps != kbps;
        self.static_kbps = kbps;
        changed
    }

    /// Drops the pending sample; every counter poll starts with no sample.
    pub fn invalidate_sample(&mut self) {
        self.sample_valid = false;
    }

    /// Hierarchical long-term average for the current network, without
    /// touching the cached value.
    pub fn avg_used_link_bandwidth_kbps(
        &self,
        ctx: &FilterContext<'_>,
        store: &dyn NetworkStatsStore,
    ) -> Option<i32> {
        ctx.avg_used_kbps(store, self.direction)
    }

    /// Long-term average if usable, else the static baseline. Caches the
    /// average lookup.
    pub fn link_bandwidth_kbps(
        &mut self,
        ctx: &FilterContext<'_>,
        store: &dyn NetworkStatsStore,
    ) -> i32 {
        self.avg_used_kbps = ctx.avg_used_kbps(store, self.direction);
        self.avg_used_kbps.unwrap_or(self.static_kbps)
    }

    /// Recomputes the byte threshold. Must run whenever the RAT, static
    /// baseline or signal level changes.
    pub fn update_byte_threshold(&mut self, ctx: &FilterContext<'_>, store: &dyn NetworkStatsStore) {
        let window_ms = ctx.config.modem_poll_min_interval_ms() as i64;
        let dir = self.direction.index();

        if self.static_kbps > HIGH_BANDWIDTH_THRESHOLD_KBPS {
            let seed = BYTE_DELTA_THRESHOLD_KB[dir][ctx.identity.level_index()] * 1024;
            self.byte_threshold = match ctx.avg_used_kbps(store, self.direction) {
                Some(avg) => {
                    let low_bytes = byte_count_threshold(i64::from(avg), window_ms);
                    if low_bytes > 0 {
                        low_bytes
                            .max(seed)
                            .min(BYTE_DELTA_ACC_THRESHOLD_MAX_KB * 1024)
                    } else {
                        seed
                    }
                }
                None => seed,
            };
            return;
        }

        self.byte_threshold = byte_count_threshold(i64::from(self.static_kbps), window_ms)
            .max(BYTE_DELTA_THRESHOLD_MIN_KB * 1024)
            .min(BYTE_DELTA_THRESHOLD_KB[dir][0] * 1024);
    }

    /// Validates one byte/active-time sample and, if accepted, records it
    /// in the long-term statistics for both network keys.
    pub fn update_sample(
        &mut self,
        bytes: i64,
        active_ms: i64,
        ctx: &FilterContext<'_>,
        store: &mut dyn NetworkStatsStore,
    ) -> SampleOutcome {
        self.update_byte_threshold(ctx, store);
        if bytes < self.byte_threshold {
            return SampleOutcome::Rejected(SampleRejection::BelowByteThreshold {
                bytes,
                threshold: self.byte_threshold,
            });
        }
        if active_ms <= 0 || active_ms < ctx.config.min_active_time.as_millis() as i64 {
            return SampleOutcome::Rejected(SampleRejection::ActiveTimeTooShort { active_ms });
        }
        let kbps = sample_kbps(bytes, active_ms);
        if kbps > i64::from(self.static_kbps) * MAX_BW_TO_STATIC_BW_RATIO || kbps < 0 {
            return SampleOutcome::Rejected(SampleRejection::OutOfRange { kbps });
        }

        let kbps = kbps as i32;
        self.sample_valid = true;
        self.sample_kbps = kbps;

        let level = ctx.identity.level_index();
        for key in [ctx.identity.coarse_key(), ctx.identity.fine_key()] {
            if let Err(e) = store.update(&key, self.direction, level, kbps as u64) {
                tracing::warn!(direction = %self.direction, network = %key, error = %e, "failed to persist bandwidth sample");
            }
        }
        SampleOutcome::Accepted { kbps }
    }

    /// One filter step. Runs after every sample update (valid or not) and
    /// on the fallback cadence.
    pub fn update_filter(
        &mut self,
        ctx: &FilterContext<'_>,
        store: &dyn NetworkStatsStore,
        baseline: &UpdateBaseline,
    ) {
        let avg_kbps = self.link_bandwidth_kbps(ctx, store);
        let input_kbps = if self.sample_valid {
            self.sample_kbps
        } else {
            avg_kbps
        };

        let elapsed_sec = self
            .sample_valid_at_ms
            .map(|t| (ctx.now_ms.saturating_sub(t) / 1000) as i64)
            .unwrap_or(0);

        let identity = ctx.identity;
        let condition_changed = (baseline.signal_dbm - identity.signal_dbm).abs()
            > ctx.config.rssi_delta_threshold_db
            || baseline.plmn != identity.plmn
            || baseline.rat != identity.rat
            || (self.sample_valid && self.sample_kbps > avg_kbps);
        let time_constant_sec = if condition_changed {
            ctx.config.time_constant_small_sec
        } else {
            ctx.config.time_constant_large_sec
        };

        if self.sample_valid {
            self.sample_valid_at_ms = Some(ctx.now_ms);
        }

        if input_kbps == self.filter_kbps {
            return;
        }

        let weight = filter_weight(elapsed_sec, i64::from(time_constant_sec));
        if weight == 0 {
            self.filter_kbps = input_kbps;
        } else {
            self.filter_kbps = blend(self.filter_kbps, input_kbps, weight);
        }
        tracing::trace!(
            direction = %self.direction,
            weight,
            scale = FILTER_SCALE,
            input_kbps,
            avg_kbps,
            filter_kbps = self.filter_kbps,
            "filter updated"
        );
    }

    /// Drops the sample and snaps the estimate to the long-term average or
    /// static baseline, skipping the blend.
    pub fn reset(&mut self, ctx: &FilterContext<'_>, store: &dyn NetworkStatsStore) {
        self.sample_valid = false;
        self.filter_kbps = self.link_bandwidth_kbps(ctx, store);
    }

    /// Estimate moved more than `threshold_percent` from the last published
    /// value. Only meaningful once a long-term average exists.
    pub fn has_large_change(&self, threshold_percent: i64) -> bool {
        let delta = (i64::from(self.last_published_kbps) - i64::from(self.filter_kbps)).abs();
        self.avg_used_kbps.is_some()
            && delta * 100 > threshold_percent * i64::from(self.last_published_kbps)
    }

    /// Records the value about to be published: the estimate, or −1 when it
    /// rests on the static table alone.
    pub fn mark_published(&mut self) -> i32 {
        self.last_published_kbps = match self.avg_used_kbps {
            Some(_) => self.filter_kbps,
            None => -1,
        };
        self.last_published_kbps
    }

    /// Error accounting of the last cycle; telemetry only.
    pub fn error_report(&self, coarse_count: u32, count_threshold: u32) -> Option<ErrorReport> {
        if !self.sample_valid || coarse_count <= count_threshold + 1 || self.sample_kbps == 0 {
            return None;
        }
        let avg = self.avg_used_kbps?;
        let sample = self.sample_kbps;
        Some(ErrorReport {
            direction: self.direction,
            sample_kbps: sample,
            published_error_percent: error_percent(self.last_published_kbps, sample),
            average_error_percent: error_percent(avg, sample),
            filtered_error_percent: error_percent(self.filter_kbps, sample),
            static_error_percent: error_percent(self.static_kbps, sample),
        })
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, filter_kbps: i32, last_published_kbps: i32) {
        self.filter_kbps = filter_kbps;
        self.last_published_kbps = last_published_kbps;
    }
}
