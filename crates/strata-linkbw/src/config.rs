use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const CONFIG_VERSION: u32 = 1;

/// Seed values for the per-RAT static bandwidth table, `"RAT:rx,tx"` in kbps.
pub const DEFAULT_STATIC_BANDWIDTH: &[&str] = &[
    "GPRS:24,24",
    "EDGE:70,18",
    "UMTS:115,115",
    "CDMA:14,14",
    "CDMA - 1xRTT:30,30",
    "CDMA - EvDo rev. 0:750,48",
    "CDMA - EvDo rev. A:950,550",
    "HSDPA:4300,620",
    "HSUPA:4300,1800",
    "HSPA:4300,1800",
    "CDMA - EvDo rev. B:1500,550",
    "CDMA - eHRPD:750,48",
    "HSPA+:13000,3400",
    "TD_SCDMA:115,115",
    "LTE:30000,15000",
    "NR_NSA:47000,18000",
    "NR_NSA_MMWAVE:145000,60000",
    "NR:145000,60000",
    "NR_MMWAVE:145000,60000",
];

/// Baseline used for a RAT that has no static table entry.
pub const DEFAULT_LINK_BANDWIDTH_KBPS: i32 = 14;

// ─── Raw (TOML) input ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EstimatorConfigInput {
    pub version: u32,
    pub poll_interval_ms: Option<u64>,
    pub modem_poll_min_interval_ms: Option<u64>,
    pub modem_report_max_delta_ms: Option<u64>,
    pub filter_update_max_interval_ms: Option<u64>,
    pub activity_request_timeout_ms: Option<u64>,
    pub min_active_time_ms: Option<u64>,
    pub time_constant_small_sec: Option<u32>,
    pub time_constant_large_sec: Option<u32>,
    pub rssi_delta_threshold_db: Option<i32>,
    pub publish_threshold_percent: Option<i64>,
    pub stats_count_threshold: Option<u32>,
    /// Overrides merged over [`DEFAULT_STATIC_BANDWIDTH`].
    pub static_bandwidth: Vec<String>,
    pub default_bandwidth_kbps: Option<i32>,
}

// ─── Static bandwidth table ─────────────────────────────────────────────────

/// Technology default bandwidth for one RAT name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticBandwidth {
    pub rx_kbps: i32,
    pub tx_kbps: i32,
}

/// Immutable RAT-name → bandwidth lookup, built once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticBandwidthTable {
    entries: HashMap<String, StaticBandwidth>,
}

impl StaticBandwidthTable {
    /// Builds a table from `"RAT:rx,tx"` entries. Later entries win.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, ConfigError> {
        let mut table = StaticBandwidthTable {
            entries: HashMap::new(),
        };
        table.merge(entries)?;
        Ok(table)
    }

    fn merge<S: AsRef<str>>(&mut self, entries: &[S]) -> Result<(), ConfigError> {
        for entry in entries {
            let (name, bandwidth) = parse_entry(entry.as_ref())?;
            self.entries.insert(name, bandwidth);
        }
        Ok(())
    }

    pub fn get(&self, rat_name: &str) -> Option<StaticBandwidth> {
        self.entries.get(rat_name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StaticBandwidthTable {
    fn default() -> Self {
        let mut entries = HashMap::with_capacity(DEFAULT_STATIC_BANDWIDTH.len());
        for entry in DEFAULT_STATIC_BANDWIDTH {
            if let Ok((name, bandwidth)) = parse_entry(entry) {
                entries.insert(name, bandwidth);
            }
        }
        StaticBandwidthTable { entries }
    }
}

fn parse_entry(entry: &str) -> Result<(String, StaticBandwidth), ConfigError> {
    let malformed = || ConfigError::StaticEntry(entry.to_string());
    let (name, values) = entry.split_once(':').ok_or_else(malformed)?;
    let (rx, tx) = values.split_once(',').ok_or_else(malformed)?;
    let rx_kbps = rx.trim().parse::<i32>().map_err(|_| malformed())?;
    let tx_kbps = tx.trim().parse::<i32>().map_err(|_| malformed())?;
    let name = name.trim();
    if name.is_empty() || rx_kbps < 0 || tx_kbps < 0 {
        return Err(malformed());
    }
    Ok((name.to_string(), StaticBandwidth { rx_kbps, tx_kbps }))
}

// ─── Resolved config ────────────────────────────────────────────────────────

/// Tunables of the estimator. Fixed numeric constants of the filter live
/// next to the code that uses them.
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub version: u32,
    /// Byte counter sampling cadence while the radio is active.
    pub poll_interval: Duration,
    /// Minimum gap between two modem activity requests.
    pub modem_poll_min_interval: Duration,
    /// Two reports further apart than this produce no sample.
    pub modem_report_max_delta: Duration,
    /// Fallback filter update cadence when no report is requested.
    pub filter_update_max_interval: Duration,
    /// Watchdog for a request the host never answers.
    pub activity_request_timeout: Duration,
    /// Samples with less active time than this are ignored.
    pub min_active_time: Duration,
    /// Fast time constant, used when the operating condition changed.
    pub time_constant_small_sec: u32,
    /// Slow time constant.
    pub time_constant_large_sec: u32,
    pub rssi_delta_threshold_db: i32,
    pub publish_threshold_percent: i64,
    /// Minimum sample count before a long-term average is trusted.
    pub stats_count_threshold: u32,
    pub static_bandwidth: StaticBandwidthTable,
    pub default_bandwidth_kbps: i32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            poll_interval: Duration::from_millis(1_000),
            modem_poll_min_interval: Duration::from_millis(5_000),
            modem_report_max_delta: Duration::from_millis(10_000),
            filter_update_max_interval: Duration::from_millis(5_100),
            activity_request_timeout: Duration::from_millis(10_000),
            min_active_time: Duration::from_millis(200),
            time_constant_small_sec: 6,
            time_constant_large_sec: 6,
            rssi_delta_threshold_db: 6,
            publish_threshold_percent: 15,
            stats_count_threshold: 5,
            static_bandwidth: StaticBandwidthTable::default(),
            default_bandwidth_kbps: DEFAULT_LINK_BANDWIDTH_KBPS,
        }
    }
}

impl EstimatorConfigInput {
    pub fn resolve(self) -> Result<EstimatorConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = EstimatorConfig::default();
        let ms = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };

        let mut static_bandwidth = defaults.static_bandwidth.clone();
        static_bandwidth.merge(&self.static_bandwidth)?;

        let config = EstimatorConfig {
            version,
            poll_interval: ms(self.poll_interval_ms, defaults.poll_interval),
            modem_poll_min_interval: ms(
                self.modem_poll_min_interval_ms,
                defaults.modem_poll_min_interval,
            ),
            modem_report_max_delta: ms(
                self.modem_report_max_delta_ms,
                defaults.modem_report_max_delta,
            ),
            filter_update_max_interval: ms(
                self.filter_update_max_interval_ms,
                defaults.filter_update_max_interval,
            ),
            activity_request_timeout: ms(
                self.activity_request_timeout_ms,
                defaults.activity_request_timeout,
            ),
            min_active_time: ms(self.min_active_time_ms, defaults.min_active_time),
            time_constant_small_sec: self
                .time_constant_small_sec
                .unwrap_or(defaults.time_constant_small_sec),
            time_constant_large_sec: self
                .time_constant_large_sec
                .unwrap_or(defaults.time_constant_large_sec),
            rssi_delta_threshold_db: self
                .rssi_delta_threshold_db
                .unwrap_or(defaults.rssi_delta_threshold_db),
            publish_threshold_percent: self
                .publish_threshold_percent
                .unwrap_or(defaults.publish_threshold_percent),
            stats_count_threshold: self
                .stats_count_threshold
                .unwrap_or(defaults.stats_count_threshold),
            static_bandwidth,
            default_bandwidth_kbps: self
                .default_bandwidth_kbps
                .unwrap_or(defaults.default_bandwidth_kbps)
                .max(0),
        };
        config.validate()?;
        Ok(config)
    }
}

impl EstimatorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(EstimatorConfig::default());
        }
        let parsed: EstimatorConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "poll_interval_ms",
            });
        }
        if self.min_active_time.is_zero() {
            return Err(ConfigError::Zero {
                field: "min_active_time_ms",
            });
        }
        if self.time_constant_small_sec == 0 {
            return Err(ConfigError::Zero {
                field: "time_constant_small_sec",
            });
        }
        if self.time_constant_large_sec == 0 {
            return Err(ConfigError::Zero {
                field: "time_constant_large_sec",
            });
        }
        if self.stats_count_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "stats_count_threshold",
            });
        }
        Ok(())
    }

    pub(crate) fn modem_poll_min_interval_ms(&self) -> u64 {
        self.modem_poll_min_interval.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_default() {
        let cfg = EstimatorConfig::from_toml_str("  ").unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(1_000));
        assert_eq!(cfg.filter_update_max_interval, Duration::from_millis(5_100));
        assert_eq!(cfg.stats_count_threshold, 5);
        assert_eq!(cfg.static_bandwidth.len(), DEFAULT_STATIC_BANDWIDTH.len());
    }

    #[test]
    fn parse_toml_config_overrides() {
        let toml = r#"
            version = 1
            poll_interval_ms = 500
            time_constant_small_sec = 2
            time_constant_large_sec = 12
            publish_threshold_percent = 20
            static_bandwidth = ["LTE:40000,20000", "NTN:50,10"]
        "#;

        let cfg = EstimatorConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.time_constant_small_sec, 2);
        assert_eq!(cfg.time_constant_large_sec, 12);
        assert_eq!(cfg.publish_threshold_percent, 20);
        assert_eq!(
            cfg.static_bandwidth.get("LTE"),
            Some(StaticBandwidth {
                rx_kbps: 40_000,
                tx_kbps: 20_000
            })
        );
        assert_eq!(
            cfg.static_bandwidth.get("NTN"),
            Some(StaticBandwidth {
                rx_kbps: 50,
                tx_kbps: 10
            })
        );
        // untouched seed entries survive the merge
        assert_eq!(
            cfg.static_bandwidth.get("HSPA"),
            Some(StaticBandwidth {
                rx_kbps: 4_300,
                tx_kbps: 1_800
            })
        );
    }

    #[test]
    fn seed_table_names_with_separators() {
        let table = StaticBandwidthTable::default();
        assert_eq!(
            table.get("CDMA - EvDo rev. A"),
            Some(StaticBandwidth {
                rx_kbps: 950,
                tx_kbps: 550
            })
        );
        assert!(table.get("UNKNOWN").is_none());
    }

    #[test]
    fn malformed_static_entry_rejected() {
        let err = EstimatorConfig::from_toml_str(r#"static_bandwidth = ["LTE=3,4"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::StaticEntry(_)));

        let err = EstimatorConfig::from_toml_str(r#"static_bandwidth = ["LTE:3"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::StaticEntry(_)));
    }

    #[test]
    fn unsupported_version_rejected() {
        let err = EstimatorConfig::from_toml_str("version = 7").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(7)));
    }

    #[test]
    fn zero_time_constant_rejected() {
        let err = EstimatorConfig::from_toml_str("time_constant_large_sec = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Zero {
                field: "time_constant_large_sec"
            }
        ));
    }

    #[test]
    fn zero_min_active_time_rejected() {
        let err = EstimatorConfig::from_toml_str("min_active_time_ms = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Zero {
                field: "min_active_time_ms"
            }
        ));
        assert!(EstimatorConfig::from_toml_str("min_active_time_ms = 1").is_ok());
    }
}
