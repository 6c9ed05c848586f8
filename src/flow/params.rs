//! Flow simulation parameters and configuration

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::water::{SOURCE_AMOUNT, SOURCE_RADIUS};

/// How concurrent workers share the water grid during a generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyModel {
    /// Reads hit a frozen copy of the pre-generation depths and each shard
    /// accumulates its transfers in a private delta buffer. Deltas are merged
    /// at the barrier, so the outcome does not depend on visit order or on
    /// the number of workers.
    #[default]
    Snapshot,
    /// Every depth cell is updated in place with atomic read-modify-write.
    /// Transfers are visible to cells visited later in the same generation,
    /// so the outcome depends on visit order and thread interleaving.
    Atomic,
}

impl ConcurrencyModel {
    pub fn all() -> &'static [Self] {
        &[Self::Snapshot, Self::Atomic]
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Snapshot => "Frozen reads, per-shard deltas merged at the barrier",
            Self::Atomic => "In-place atomic transfers, order-sensitive",
        }
    }
}

impl std::fmt::Display for ConcurrencyModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snapshot => write!(f, "snapshot"),
            Self::Atomic => write!(f, "atomic"),
        }
    }
}

impl FromStr for ConcurrencyModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "snapshot" | "delta" => Ok(Self::Snapshot),
            "atomic" | "legacy" => Ok(Self::Atomic),
            other => Err(format!("unknown concurrency model '{}' (expected snapshot or atomic)", other)),
        }
    }
}

/// Simulation parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowParams {
    /// Number of worker shards (and pool threads) per generation
    pub workers: usize,

    /// Sharing discipline for the water grid during a generation
    pub model: ConcurrencyModel,

    /// Seed for the traversal permutation (random when absent)
    pub seed: Option<u64>,

    /// Surface height contributed by one depth unit
    pub depth_scale: f32,

    /// Half-width of the square a source injection covers
    pub source_radius: usize,

    /// Depth units added per covered cell on injection
    pub source_amount: u32,

    /// Pause between generations of the play loop, in milliseconds
    pub tick_delay_ms: u64,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            workers: 4,
            model: ConcurrencyModel::Snapshot,
            seed: None,
            depth_scale: 0.01,
            source_radius: SOURCE_RADIUS,
            source_amount: SOURCE_AMOUNT,
            tick_delay_ms: 0,
        }
    }
}

impl FlowParams {
    /// Load parameters from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FlowError::NotFound { path: path.to_path_buf() },
            _ => FlowError::Io(e),
        })?;
        let params: Self = serde_json::from_str(&text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(FlowError::Config("workers must be at least 1".into()));
        }
        if !self.depth_scale.is_finite() || self.depth_scale <= 0.0 {
            return Err(FlowError::Config(format!(
                "depth_scale must be positive, got {}",
                self.depth_scale
            )));
        }
        if self.source_amount == 0 {
            return Err(FlowError::Config("source_amount must be at least 1".into()));
        }
        if i64::try_from(self.source_radius).is_err() {
            return Err(FlowError::Config(format!(
                "source_radius {} is too large",
                self.source_radius
            )));
        }
        Ok(())
    }
}
