//! Core race split figures library: pace, speed, deficit and relative speed per boat and marker.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

mod figures;
mod grid;

pub use grid::{resolve_grid_step, transpose, DistanceLookup};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FiguresError {
    #[error("grid step undefined: fewer than two distinct integer distances")]
    UndefinedGrid,
    #[error("no valid split at distance {distance} m")]
    NoValidDataAtDistance { distance: i64 },
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Outlier classification attached to a split by an upstream classifier.
///
/// On the wire this is a nullable boolean: `true` is an outlier, `false` is not,
/// and `null` (or a missing field) means the classifier never looked at it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum OutlierFlag {
    Outlier,
    NotOutlier,
    Unknown,
}

impl Default for OutlierFlag {
    fn default() -> Self {
        OutlierFlag::Unknown
    }
}

impl From<Option<bool>> for OutlierFlag {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => OutlierFlag::Outlier,
            Some(false) => OutlierFlag::NotOutlier,
            None => OutlierFlag::Unknown,
        }
    }
}

impl From<OutlierFlag> for Option<bool> {
    fn from(value: OutlierFlag) -> Self {
        match value {
            OutlierFlag::Outlier => Some(true),
            OutlierFlag::NotOutlier => Some(false),
            OutlierFlag::Unknown => None,
        }
    }
}

impl OutlierFlag {
    pub fn is_usable(self, unknown_is_valid: bool) -> bool {
        match self {
            OutlierFlag::Outlier => false,
            OutlierFlag::NotOutlier => true,
            OutlierFlag::Unknown => unknown_is_valid,
        }
    }
}

/// One timing record of one boat at one distance marker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Split {
    pub distance_meter: i64,
    /// Cumulative elapsed time since the race start.
    #[serde(default)]
    pub result_time_ms: Option<i64>,
    #[serde(default)]
    pub invalid_mark_reason: Option<String>,
    #[serde(default)]
    pub is_outlier: OutlierFlag,
}

impl Split {
    pub fn new(distance_meter: i64, result_time_ms: i64) -> Self {
        Self {
            distance_meter,
            result_time_ms: Some(result_time_ms),
            invalid_mark_reason: None,
            is_outlier: OutlierFlag::Unknown,
        }
    }

    /// A split that was reported at `distance_meter` without any time.
    pub fn untimed(distance_meter: i64) -> Self {
        Self {
            distance_meter,
            result_time_ms: None,
            invalid_mark_reason: None,
            is_outlier: OutlierFlag::Unknown,
        }
    }

    pub fn with_invalid_mark(mut self, reason: impl Into<String>) -> Self {
        self.invalid_mark_reason = Some(reason.into());
        self
    }

    pub fn with_outlier(mut self, flag: OutlierFlag) -> Self {
        self.is_outlier = flag;
        self
    }

    /// Validity with the default treatment of unclassified splits (usable).
    pub fn is_valid(&self) -> bool {
        self.usable_time(true).is_some()
    }

    /// The result time when the split may enter aggregate computations.
    pub(crate) fn usable_time(&self, unknown_outlier_is_valid: bool) -> Option<i64> {
        if self.invalid_mark_reason.is_some()
            || !self.is_outlier.is_usable(unknown_outlier_is_valid)
        {
            return None;
        }
        self.result_time_ms
    }
}

#[derive(Deserialize)]
struct BoatEntryRepr {
    id: String,
    #[serde(default)]
    splits: Vec<Split>,
}

impl From<BoatEntryRepr> for BoatEntry {
    fn from(repr: BoatEntryRepr) -> Self {
        BoatEntry::new(repr.id, repr.splits)
    }
}

/// A boat in a race together with its splits, kept sorted by distance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "BoatEntryRepr")]
pub struct BoatEntry {
    pub id: String,
    splits: Vec<Split>,
}

impl BoatEntry {
    pub fn new(id: impl Into<String>, mut splits: Vec<Split>) -> Self {
        splits.sort_by_key(|s| s.distance_meter);
        Self {
            id: id.into(),
            splits,
        }
    }

    pub fn splits(&self) -> &[Split] {
        &self.splits
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Race {
    #[serde(default)]
    pub id: Option<String>,
    pub boats: Vec<BoatEntry>,
}

impl Race {
    pub fn figures(&self, params: &Params) -> Result<RaceFigures, FiguresError> {
        compute_figures(&self.boats, params)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ResultTimeOrCode {
    Time(i64),
    Code(String),
}

/// Derived metrics for one boat at one distance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Figures {
    pub deficit: Option<i64>,
    pub pace: Option<i64>,
    pub speed: Option<f64>,
    pub rel_diff_to_avg_speed: Option<f64>,
    pub result_time_or_code: Option<ResultTimeOrCode>,
}

/// Field-wide aggregates at one distance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DistanceSummary {
    pub best_time_ms: Option<i64>,
    pub avg_speed: Option<f64>,
    pub reported: usize,
    pub valid: usize,
    pub consecutive_step: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RaceFigures {
    pub grid_step: Option<i64>,
    pub boats: BTreeMap<String, BTreeMap<i64, Figures>>,
    pub distances: BTreeMap<i64, DistanceSummary>,
}

impl RaceFigures {
    pub fn is_empty(&self) -> bool {
        self.boats.is_empty()
    }

    pub fn get(&self, boat: &str, distance: i64) -> Option<&Figures> {
        self.boats.get(boat)?.get(&distance)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyDistancePolicy {
    /// Report a distance without any valid split as `NoValidDataAtDistance`.
    Fault,
    /// Emit code-only figures for that distance and carry on.
    Skip,
}

impl Default for EmptyDistancePolicy {
    fn default() -> Self {
        EmptyDistancePolicy::Fault
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    pub empty_distance: EmptyDistancePolicy,
    pub strict_grid: bool,
    pub unknown_outlier_is_valid: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            empty_distance: EmptyDistancePolicy::Fault,
            strict_grid: false,
            unknown_outlier_is_valid: true,
        }
    }
}

impl Params {
    pub fn hash_sha256(&self) -> Result<String, FiguresError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| FiguresError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

/// Compute figures for every boat at every distance it reported a split for.
///
/// Returns an empty result when the race has fewer than two distinct distances,
/// unless `params.strict_grid` asks for `UndefinedGrid` instead.
pub fn compute_figures(boats: &[BoatEntry], params: &Params) -> Result<RaceFigures, FiguresError> {
    validate_boats(boats)?;

    let lookup = transpose(boats);
    let grid_step = match resolve_grid_step(lookup.keys().map(|&d| Some(d))) {
        Ok(step) => step,
        Err(FiguresError::UndefinedGrid) if !params.strict_grid => {
            debug!(
                distances = lookup.len(),
                "grid step undefined; no figures produced"
            );
            return Ok(RaceFigures::default());
        }
        Err(err) => return Err(err),
    };
    debug!(
        boats = boats.len(),
        distances = lookup.len(),
        grid_step,
        "computing race figures"
    );

    figures::walk_distances(&lookup, grid_step, params)
}

fn validate_boats(boats: &[BoatEntry]) -> Result<(), FiguresError> {
    let mut ids = HashSet::with_capacity(boats.len());
    for boat in boats {
        if boat.id.trim().is_empty() {
            return Err(FiguresError::MalformedInput("boat with empty id".into()));
        }
        if !ids.insert(boat.id.as_str()) {
            return Err(FiguresError::MalformedInput(format!(
                "duplicate boat id '{}'",
                boat.id
            )));
        }
        let mut distances = HashSet::with_capacity(boat.splits.len());
        for split in &boat.splits {
            if split.distance_meter < 0 {
                return Err(FiguresError::MalformedInput(format!(
                    "boat '{}': negative distance {}",
                    boat.id, split.distance_meter
                )));
            }
            if let Some(time) = split.result_time_ms {
                if time < 0 {
                    return Err(FiguresError::MalformedInput(format!(
                        "boat '{}': negative result time {} at {} m",
                        boat.id, time, split.distance_meter
                    )));
                }
            }
            if !distances.insert(split.distance_meter) {
                return Err(FiguresError::MalformedInput(format!(
                    "boat '{}': duplicate split at {} m",
                    boat.id, split.distance_meter
                )));
            }
        }
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
