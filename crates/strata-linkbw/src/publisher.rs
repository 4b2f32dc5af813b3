//! # Estimate Publisher
//!
//! Decides after every filter cycle whether consumers should hear about the
//! new estimate. Both directions are always published together.

use serde::Serialize;

use crate::filter::BandwidthFilter;
use crate::host::BandwidthSink;
use crate::identity::{IdentitySnapshot, Rat, UNKNOWN_PLMN};

/// Bandwidth pair delivered to consumers. `-1` means "no estimate" for that
/// direction (no long-term statistics yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BandwidthUpdate {
    pub tx_kbps: i32,
    pub rx_kbps: i32,
}

/// Operating condition at the previous filter cycle.
///
/// Compared against the current identity both to pick the filter time
/// constant and to force a publish after a network change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBaseline {
    pub signal_dbm: i32,
    pub signal_level: Option<u8>,
    pub rat: Rat,
    pub plmn: String,
}

impl Default for UpdateBaseline {
    fn default() -> Self {
        UpdateBaseline {
            signal_dbm: -1,
            signal_level: None,
            rat: Rat::Unknown,
            plmn: UNKNOWN_PLMN.to_string(),
        }
    }
}

impl UpdateBaseline {
    pub fn capture(identity: &IdentitySnapshot) -> Self {
        UpdateBaseline {
            signal_dbm: identity.signal_dbm,
            signal_level: Some(identity.signal_level),
            rat: identity.rat,
            plmn: identity.plmn.clone(),
        }
    }

    fn network_changed(&self, identity: &IdentitySnapshot) -> bool {
        self.rat != identity.rat
            || self.signal_level != Some(identity.signal_level)
            || self.plmn != identity.plmn
    }
}

pub struct EstimatePublisher {
    threshold_percent: i64,
    baseline: UpdateBaseline,
    published: u64,
}

impl EstimatePublisher {
    pub fn new(threshold_percent: i64) -> Self {
        EstimatePublisher {
            threshold_percent,
            baseline: UpdateBaseline::default(),
            published: 0,
        }
    }

    pub fn baseline(&self) -> &UpdateBaseline {
        &self.baseline
    }

    /// Number of updates pushed to the sink so far.
    pub fn published_count(&self) -> u64 {
        self.published
    }

    pub fn rebase(&mut self, identity: &IdentitySnapshot) {
        self.baseline = UpdateBaseline::capture(identity);
    }

    /// Publishes if either direction moved enough or the network changed,
    /// then records the current condition as the new baseline.
    pub fn evaluate(
        &mut self,
        tx: &mut BandwidthFilter,
        rx: &mut BandwidthFilter,
        identity: &IdentitySnapshot,
        sink: &mut dyn BandwidthSink,
    ) -> Option<BandwidthUpdate> {
        let changed = tx.has_large_change(self.threshold_percent)
            || rx.has_large_change(self.threshold_percent)
            || self.baseline.network_changed(identity);

        let update = if identity.is_known() && changed {
            let update = BandwidthUpdate {
                tx_kbps: tx.mark_published(),
                rx_kbps: rx.mark_published(),
            };
            tracing::debug!(
                tx_kbps = update.tx_kbps,
                rx_kbps = update.rx_kbps,
                rat = identity.rat_name(),
                plmn = %identity.plmn,
                level = identity.signal_level,
                "bandwidth published"
            );
            sink.on_bandwidth_changed(update);
            self.published += 1;
            Some(update)
        } else {
            None
        };

        self.rebase(identity);
        update
    }
}
