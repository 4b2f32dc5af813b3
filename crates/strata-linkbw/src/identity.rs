//! # Network Identity Tracker
//!
//! Holds the serving network identity (PLMN, RAT, NR mode, tracking area)
//! and signal strength, and derives the statistics keys from them.
//!
//! The host exposes its view of the world as a [`ServiceState`]; the tracker
//! folds it into an [`IdentitySnapshot`] and reports which parts changed so
//! the estimator can reset its filters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Placeholder PLMN before the serving network is known.
pub const UNKNOWN_PLMN: &str = "";

/// Signal levels are bucketed 0 (none/poor) to 4 (great).
pub const NUM_SIGNAL_LEVEL: usize = 5;

pub const RAT_NAME_NR_NSA: &str = "NR_NSA";
pub const RAT_NAME_NR_NSA_MMWAVE: &str = "NR_NSA_MMWAVE";
pub const RAT_NAME_NR_SA_MMWAVE: &str = "NR_MMWAVE";

// ─── Radio access technology ────────────────────────────────────────────────

/// Data radio access technology of the serving cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Rat {
    #[default]
    Unknown,
    Gprs,
    Edge,
    Umts,
    Cdma,
    EvdoRev0,
    EvdoRevA,
    OneXRtt,
    Hsdpa,
    Hsupa,
    Hspa,
    Iden,
    EvdoRevB,
    Lte,
    Ehrpd,
    HspaPlus,
    Gsm,
    TdScdma,
    Iwlan,
    LteCa,
    Nr,
}

const ALL_RATS: [Rat; 21] = [
    Rat::Unknown,
    Rat::Gprs,
    Rat::Edge,
    Rat::Umts,
    Rat::Cdma,
    Rat::EvdoRev0,
    Rat::EvdoRevA,
    Rat::OneXRtt,
    Rat::Hsdpa,
    Rat::Hsupa,
    Rat::Hspa,
    Rat::Iden,
    Rat::EvdoRevB,
    Rat::Lte,
    Rat::Ehrpd,
    Rat::HspaPlus,
    Rat::Gsm,
    Rat::TdScdma,
    Rat::Iwlan,
    Rat::LteCa,
    Rat::Nr,
];

impl Rat {
    /// Canonical network type name, as used in the static bandwidth table.
    pub fn network_type_name(self) -> &'static str {
        match self {
            Rat::Unknown => "UNKNOWN",
            Rat::Gprs => "GPRS",
            Rat::Edge => "EDGE",
            Rat::Umts => "UMTS",
            Rat::Cdma => "CDMA",
            Rat::EvdoRev0 => "CDMA - EvDo rev. 0",
            Rat::EvdoRevA => "CDMA - EvDo rev. A",
            Rat::OneXRtt => "CDMA - 1xRTT",
            Rat::Hsdpa => "HSDPA",
            Rat::Hsupa => "HSUPA",
            Rat::Hspa => "HSPA",
            Rat::Iden => "iDEN",
            Rat::EvdoRevB => "CDMA - EvDo rev. B",
            Rat::Lte => "LTE",
            Rat::Ehrpd => "CDMA - eHRPD",
            Rat::HspaPlus => "HSPA+",
            Rat::Gsm => "GSM",
            Rat::TdScdma => "TD_SCDMA",
            Rat::Iwlan => "IWLAN",
            Rat::LteCa => "LTE_CA",
            Rat::Nr => "NR",
        }
    }
}

impl fmt::Display for Rat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.network_type_name())
    }
}

impl FromStr for Rat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ALL_RATS
            .iter()
            .copied()
            .find(|rat| rat.network_type_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown RAT {s:?}"))
    }
}

impl TryFrom<String> for Rat {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// NR operating mode layered over the data RAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NrMode {
    #[default]
    None,
    /// LTE anchor with a connected NR secondary cell, sub-6 GHz.
    Nsa,
    NsaMmwave,
    /// Standalone NR, sub-6 GHz.
    Sa,
    SaMmwave,
}

/// Name keying both the static table and the statistics store.
pub fn rat_name(rat: Rat, nr_mode: NrMode) -> &'static str {
    match (rat, nr_mode) {
        (Rat::Lte, NrMode::Nsa) => RAT_NAME_NR_NSA,
        (Rat::Lte, NrMode::NsaMmwave) => RAT_NAME_NR_NSA_MMWAVE,
        (Rat::Nr, NrMode::Sa) => Rat::Nr.network_type_name(),
        (Rat::Nr, _) => RAT_NAME_NR_SA_MMWAVE,
        (rat, _) => rat.network_type_name(),
    }
}

// ─── Host-side view ─────────────────────────────────────────────────────────

/// Serving cell identity as reported by the modem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellIdentity {
    pub plmn: Option<String>,
    /// Tracking area code (LTE/NR) or location area code (GSM/WCDMA).
    pub tac: Option<i32>,
}

/// Snapshot of the host's service state, pulled on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceState {
    /// Registered operator MCC+MNC, preferred over the cell's PLMN.
    pub operator_numeric: Option<String>,
    pub cell: CellIdentity,
    /// `None` while there is no packet-switched registration.
    pub data_rat: Option<Rat>,
    /// NR secondary cell connected (NSA).
    pub nr_connected: bool,
    /// NR carrier is in the mmWave range.
    pub nr_mmwave: bool,
}

impl ServiceState {
    pub fn plmn(&self) -> &str {
        self.operator_numeric
            .as_deref()
            .or(self.cell.plmn.as_deref())
            .unwrap_or(UNKNOWN_PLMN)
    }

    pub fn nr_mode(&self, rat: Rat) -> NrMode {
        match rat {
            Rat::Lte if self.nr_connected => {
                if self.nr_mmwave {
                    NrMode::NsaMmwave
                } else {
                    NrMode::Nsa
                }
            }
            Rat::Nr => {
                if self.nr_mmwave {
                    NrMode::SaMmwave
                } else {
                    NrMode::Sa
                }
            }
            _ => NrMode::None,
        }
    }
}

/// Signal strength notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalStrength {
    pub dbm: i32,
    /// 0..=4; larger values are clamped.
    pub level: u8,
}

// ─── Statistics key ─────────────────────────────────────────────────────────

/// Identity of a network in the statistics store.
///
/// A coarse key has no tracking area (`tac == None`) and aggregates every
/// tracking area of the PLMN/RAT pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkKey {
    pub plmn: String,
    pub rat_name: String,
    pub tac: Option<i32>,
}

impl NetworkKey {
    /// Key for `plmn`/`rat_name`, or the shared placeholder when the RAT is
    /// unknown.
    pub fn lookup(plmn: &str, tac: Option<i32>, rat_name: &str) -> Self {
        if rat_name == Rat::Unknown.network_type_name() {
            return Self::placeholder();
        }
        NetworkKey {
            plmn: plmn.to_string(),
            rat_name: rat_name.to_string(),
            tac,
        }
    }

    pub fn placeholder() -> Self {
        NetworkKey {
            plmn: UNKNOWN_PLMN.to_string(),
            rat_name: Rat::Unknown.network_type_name().to_string(),
            tac: None,
        }
    }

    pub fn is_coarse(&self) -> bool {
        self.tac.is_none()
    }
}

impl fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plmn{}Rat{}", self.plmn, self.rat_name)?;
        match self.tac {
            Some(tac) => write!(f, "Tac{tac}"),
            None => write!(f, "Tac*"),
        }
    }
}

// ─── Snapshot + tracker ─────────────────────────────────────────────────────

/// Current network identity, read by every other component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySnapshot {
    pub plmn: String,
    pub rat: Rat,
    pub nr_mode: NrMode,
    pub tac: i32,
    pub signal_level: u8,
    pub signal_dbm: i32,
}

impl Default for IdentitySnapshot {
    fn default() -> Self {
        IdentitySnapshot {
            plmn: UNKNOWN_PLMN.to_string(),
            rat: Rat::Unknown,
            nr_mode: NrMode::None,
            tac: 0,
            signal_level: 0,
            signal_dbm: 0,
        }
    }
}

impl IdentitySnapshot {
    pub fn rat_name(&self) -> &'static str {
        rat_name(self.rat, self.nr_mode)
    }

    /// Both PLMN and RAT are known; only then are estimates published.
    pub fn is_known(&self) -> bool {
        self.plmn != UNKNOWN_PLMN && self.rat != Rat::Unknown
    }

    /// Per tracking-area key.
    pub fn fine_key(&self) -> NetworkKey {
        NetworkKey::lookup(&self.plmn, Some(self.tac), self.rat_name())
    }

    /// All-tracking-area key.
    pub fn coarse_key(&self) -> NetworkKey {
        NetworkKey::lookup(&self.plmn, None, self.rat_name())
    }

    pub fn level_index(&self) -> usize {
        usize::from(self.signal_level).min(NUM_SIGNAL_LEVEL - 1)
    }
}

/// What an identity refresh changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityChange {
    pub plmn: bool,
    pub rat: bool,
}

impl IdentityChange {
    pub fn any(&self) -> bool {
        self.plmn || self.rat
    }
}

/// Owns the [`IdentitySnapshot`]; the only writer of it.
#[derive(Debug, Default)]
pub struct IdentityTracker {
    snapshot: IdentitySnapshot,
}

impl IdentityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &IdentitySnapshot {
        &self.snapshot
    }

    /// Folds a fresh service state into the snapshot.
    ///
    /// The RAT is only updated when the host has packet-switched
    /// registration info; the tracking area and NR mode always follow.
    pub fn apply_service_state(&mut self, state: &ServiceState) -> IdentityChange {
        let mut change = IdentityChange::default();
        self.snapshot.tac = state.cell.tac.unwrap_or(0);

        let plmn = state.plmn();
        if plmn != self.snapshot.plmn {
            change.plmn = true;
            self.snapshot.plmn = plmn.to_string();
        }

        if let Some(rat) = state.data_rat {
            if rat != self.snapshot.rat {
                change.rat = true;
                self.snapshot.rat = rat;
            }
        }
        self.snapshot.nr_mode = state.nr_mode(self.snapshot.rat);
        change
    }

    /// Re-reads only the NR mode. Returns `true` if it changed.
    pub fn refresh_nr_mode(&mut self, state: &ServiceState) -> bool {
        let mode = state.nr_mode(self.snapshot.rat);
        let changed = mode != self.snapshot.nr_mode;
        self.snapshot.nr_mode = mode;
        changed
    }

    pub fn apply_signal(&mut self, signal: SignalStrength) {
        self.snapshot.signal_dbm = signal.dbm;
        self.snapshot.signal_level = signal.level.min((NUM_SIGNAL_LEVEL - 1) as u8);
    }
}
