//! # strata-linkbw
//!
//! Adaptive link bandwidth estimation for one cellular data subscription.
//!
//! Mobile byte counters are polled while the device is actively using
//! cellular data. When enough traffic has flowed, the modem is asked for
//! its cumulative tx/rx active time; bytes divided by active time gives an
//! instantaneous sample. Samples feed long-term per-network statistics and
//! a time-decaying filter, and the filtered estimate is published when it
//! moves far enough or the serving network changes.
//!
//! ## Crate structure
//!
//! - [`config`] — Tunables, TOML input, static per-RAT bandwidth table
//! - [`identity`] — Serving network identity and statistics keys
//! - [`stats`] — Long-term per-network statistics (memory and JSON file)
//! - [`sampler`] — Gated byte counter polling
//! - [`activity`] — Modem activity request trigger and watchdog
//! - [`filter`] — Per-direction sample validation and filtering
//! - [`publisher`] — Publish decision and update baseline
//! - [`estimator`] — Event-driven core tying the above together
//! - [`host`] — Platform traits (clock, counters, modem, sink)
//! - [`runtime`] — Worker thread owning one estimator
//! - [`scenario`] — Scripted replay on a manual clock

pub mod activity;
pub mod config;
pub mod error;
pub mod estimator;
pub mod filter;
pub mod host;
pub mod identity;
pub mod publisher;
pub mod runtime;
pub mod sampler;
pub mod scenario;
pub mod stats;

pub use config::{EstimatorConfig, EstimatorConfigInput};
pub use estimator::{DefaultNetwork, EstimatorEvent, HostBindings, LinkBandwidthEstimator};
pub use publisher::BandwidthUpdate;
pub use runtime::EstimatorRuntime;
pub use stats::{JsonFileStatsStore, MemoryStatsStore, NetworkStatsStore};
