// levels/mod.rs
//
// Expression levels and the two leveling schemes. A level is a threshold on
// k-mer occurrence counts; one filter is built per level.
mod calibration;
mod metadata;

pub use calibration::{Calibration, CALIBRATION_MAGIC};
pub use metadata::{LevelMetadata, METADATA_VERSION};

use serde::{Deserialize, Serialize};

use crate::error::{IbfError, Result};

/// Requested leveling, as configured for a build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LevelSpec {
    /// Literal occurrence-count thresholds shared by every bin.
    Global(Vec<u32>),
    /// A fixed number of levels whose thresholds are derived per bin from its
    /// own count distribution.
    Samplewise { levels: usize },
}

impl LevelSpec {
    pub fn level_count(&self) -> usize {
        match self {
            LevelSpec::Global(thresholds) => thresholds.len(),
            LevelSpec::Samplewise { levels } => *levels,
        }
    }

    /// Check the levels and resolve them into the persisted scheme, with
    /// global thresholds sorted ascending.
    pub fn resolve(&self) -> Result<SchemeKind> {
        match self {
            LevelSpec::Global(thresholds) => {
                if thresholds.is_empty() {
                    return Err(IbfError::InvalidConfig(
                        "at least one expression threshold is required".to_string(),
                    ));
                }
                let mut sorted = thresholds.clone();
                sorted.sort_unstable();
                if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
                    return Err(IbfError::DuplicateThreshold(pair[0]));
                }
                Ok(SchemeKind::Global { thresholds: sorted })
            }
            LevelSpec::Samplewise { levels } => {
                if *levels == 0 {
                    return Err(IbfError::InvalidConfig(
                        "at least one expression level is required".to_string(),
                    ));
                }
                Ok(SchemeKind::Samplewise { levels: *levels })
            }
        }
    }
}

/// The leveling scheme recorded in the index metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SchemeKind {
    Global { thresholds: Vec<u32> },
    Samplewise { levels: usize },
}

impl SchemeKind {
    pub fn level_count(&self) -> usize {
        match self {
            SchemeKind::Global { thresholds } => thresholds.len(),
            SchemeKind::Samplewise { levels } => *levels,
        }
    }

    pub fn is_samplewise(&self) -> bool {
        matches!(self, SchemeKind::Samplewise { .. })
    }

    /// File name of a level's filter, appended to the index prefix.
    pub fn level_file_name(&self, level: usize) -> String {
        match self {
            SchemeKind::Global { thresholds } => format!("IBF_{}", thresholds[level]),
            SchemeKind::Samplewise { .. } => format!("IBF_Level_{}", level),
        }
    }

    /// Human readable label of a level, for logs and reports.
    pub fn level_label(&self, level: usize) -> String {
        match self {
            SchemeKind::Global { thresholds } => format!("threshold {}", thresholds[level]),
            SchemeKind::Samplewise { .. } => format!("level {}", level),
        }
    }
}

/// Upper median of an ascending slice.
fn median(sorted: &[u32]) -> Option<u32> {
    sorted.get(sorted.len() / 2).copied()
}

/// Derive `levels` thresholds for one bin by taking medians recursively: the
/// first is the median of all counts, each following one the median of the
/// counts above the previous threshold. Once no counts remain the previous
/// threshold repeats.
///
/// `counts` must be sorted ascending.
pub fn samplewise_thresholds(counts: &[u32], levels: usize) -> Vec<u32> {
    let mut thresholds = Vec::with_capacity(levels);
    let mut remaining = counts;
    let mut previous = 0u32;
    for _ in 0..levels {
        let threshold = median(remaining).unwrap_or(previous);
        thresholds.push(threshold);
        previous = threshold;
        let above = remaining.partition_point(|&c| c <= threshold);
        remaining = &remaining[above..];
    }
    thresholds
}

/// The samplewise bucket a count falls into: the highest level whose
/// threshold it reaches, with counts below every threshold in bucket 0.
pub fn bucket_of(count: u32, thresholds: &[u32]) -> usize {
    thresholds
        .partition_point(|&t| t <= count)
        .saturating_sub(1)
}
