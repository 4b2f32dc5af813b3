//! # Per-Network Statistics Store
//!
//! Long-term running sum and count of accepted bandwidth samples, keyed by
//! network (PLMN, RAT name, optional tracking area), link direction and
//! signal level. Lookups fall back from the per tracking-area key to the
//! all-tracking-area key.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::identity::{NetworkKey, NUM_SIGNAL_LEVEL};

/// Link direction. Both directions are always estimated and published
/// together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkDirection {
    Tx,
    Rx,
}

impl LinkDirection {
    pub const ALL: [LinkDirection; 2] = [LinkDirection::Tx, LinkDirection::Rx];

    pub fn index(self) -> usize {
        match self {
            LinkDirection::Tx => 0,
            LinkDirection::Rx => 1,
        }
    }
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkDirection::Tx => write!(f, "tx"),
            LinkDirection::Rx => write!(f, "rx"),
        }
    }
}

/// Aggregate of accepted samples for one (network, direction, level).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub sum_kbps: u64,
    pub count: u32,
}

impl StatsEntry {
    /// Integer average, or `None` with fewer than `min_count` samples.
    pub fn average_kbps(&self, min_count: u32) -> Option<i32> {
        if self.count == 0 || self.count < min_count {
            return None;
        }
        let avg = self.sum_kbps / u64::from(self.count);
        Some(avg.min(i32::MAX as u64) as i32)
    }
}

/// Read/modify/write contract of the long-term statistics.
///
/// Single writer: the estimator owns the store and serializes every call.
pub trait NetworkStatsStore: Send {
    /// Returns `(0, 0)` for unknown keys. Never fails.
    fn read(&self, key: &NetworkKey, direction: LinkDirection, level: usize) -> StatsEntry;

    /// Appends one sample. The in-memory view is always updated; an error
    /// only reports that persisting it failed.
    fn update(
        &mut self,
        key: &NetworkKey,
        direction: LinkDirection,
        level: usize,
        value_kbps: u64,
    ) -> Result<(), StoreError>;

    /// Every network that has at least one entry.
    fn networks(&self) -> Vec<NetworkKey>;
}

/// Fine (per tracking area) then coarse lookup of a usable average.
pub fn hierarchical_average(
    store: &dyn NetworkStatsStore,
    fine: &NetworkKey,
    coarse: &NetworkKey,
    direction: LinkDirection,
    level: usize,
    min_count: u32,
) -> Option<i32> {
    store
        .read(fine, direction, level)
        .average_kbps(min_count)
        .or_else(|| store.read(coarse, direction, level).average_kbps(min_count))
}

// ─── In-memory store ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StatsKey {
    network: NetworkKey,
    direction: LinkDirection,
    level: u8,
}

impl StatsKey {
    fn new(network: &NetworkKey, direction: LinkDirection, level: usize) -> Self {
        StatsKey {
            network: network.clone(),
            direction,
            level: level.min(NUM_SIGNAL_LEVEL - 1) as u8,
        }
    }
}

/// Process-lifetime store. Entries are created lazily and never removed.
#[derive(Debug, Default)]
pub struct MemoryStatsStore {
    entries: HashMap<StatsKey, StatsEntry>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an entry directly. Used when loading persisted data.
    pub fn insert(
        &mut self,
        key: &NetworkKey,
        direction: LinkDirection,
        level: usize,
        entry: StatsEntry,
    ) {
        self.entries.insert(StatsKey::new(key, direction, level), entry);
    }

    fn records(&self) -> Vec<StatsRecord> {
        let mut records: Vec<StatsRecord> = self
            .entries
            .iter()
            .map(|(key, entry)| StatsRecord {
                network: key.network.clone(),
                direction: key.direction,
                level: key.level,
                sum_kbps: entry.sum_kbps,
                count: entry.count,
            })
            .collect();
        records.sort_by(|a, b| {
            (&a.network, a.direction, a.level).cmp(&(&b.network, b.direction, b.level))
        });
        records
    }
}

impl NetworkStatsStore for MemoryStatsStore {
    fn read(&self, key: &NetworkKey, direction: LinkDirection, level: usize) -> StatsEntry {
        self.entries
            .get(&StatsKey::new(key, direction, level))
            .copied()
            .unwrap_or_default()
    }

    fn update(
        &mut self,
        key: &NetworkKey,
        direction: LinkDirection,
        level: usize,
        value_kbps: u64,
    ) -> Result<(), StoreError> {
        let entry = self
            .entries
            .entry(StatsKey::new(key, direction, level))
            .or_default();
        entry.sum_kbps = entry.sum_kbps.saturating_add(value_kbps);
        entry.count = entry.count.saturating_add(1);
        Ok(())
    }

    fn networks(&self) -> Vec<NetworkKey> {
        let set: BTreeSet<&NetworkKey> = self.entries.keys().map(|k| &k.network).collect();
        set.into_iter().cloned().collect()
    }
}

// ─── File-backed store ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct StatsRecord {
    network: NetworkKey,
    direction: LinkDirection,
    level: u8,
    sum_kbps: u64,
    count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatsFile {
    version: u32,
    records: Vec<StatsRecord>,
}

const STATS_FILE_VERSION: u32 = 1;

/// Memory store persisted as JSON, rewritten after every update.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct JsonFileStatsStore {
    path: PathBuf,
    inner: MemoryStatsStore,
}

impl JsonFileStatsStore {
    /// Opens `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut inner = MemoryStatsStore::new();
        match fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => {
                let file: StatsFile = serde_json::from_str(&contents)?;
                if file.version != STATS_FILE_VERSION {
                    return Err(StoreError::UnsupportedVersion(file.version));
                }
                for record in file.records {
                    inner.insert(
                        &record.network,
                        record.direction,
                        usize::from(record.level),
                        StatsEntry {
                            sum_kbps: record.sum_kbps,
                            count: record.count,
                        },
                    );
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(path = %path.display(), networks = inner.networks().len(), "stats store opened");
        Ok(JsonFileStatsStore { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StoreError> {
        let file = StatsFile {
            version: STATS_FILE_VERSION,
            records: self.inner.records(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl NetworkStatsStore for JsonFileStatsStore {
    fn read(&self, key: &NetworkKey, direction: LinkDirection, level: usize) -> StatsEntry {
        self.inner.read(key, direction, level)
    }

    fn update(
        &mut self,
        key: &NetworkKey,
        direction: LinkDirection,
        level: usize,
        value_kbps: u64,
    ) -> Result<(), StoreError> {
        self.inner.update(key, direction, level, value_kbps)?;
        self.persist()
    }

    fn networks(&self) -> Vec<NetworkKey> {
        self.inner.networks()
    }
}

/// Human-readable per-level averages and counts of one network.
pub fn render_network(store: &dyn NetworkStatsStore, key: &NetworkKey) -> String {
    let mut out = format!("{key}\n");
    for direction in LinkDirection::ALL {
        let entries: Vec<StatsEntry> = (0..NUM_SIGNAL_LEVEL)
            .map(|level| store.read(key, direction, level))
            .collect();
        out.push_str(&format!("{direction}\n avgKbps"));
        for entry in &entries {
            out.push_str(&format!(" {}", entry.average_kbps(1).unwrap_or(0)));
        }
        out.push_str("\n count");
        for entry in &entries {
            out.push_str(&format!(" {}", entry.count));
        }
        out.push('\n');
    }
    out
}
