// src/stats.rs

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ibf::Membership;
use crate::store::LevelStore;

/// Fill and false positive statistics of every level of an index
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexStats {
    pub bin_names: Vec<String>,
    pub hash_count: usize,
    pub compressed: bool,
    pub samplewise: bool,

    // Per-level analysis
    pub level_stats: Vec<LevelStats>,

    // Per-bin analysis across levels
    pub bin_fill: Vec<SizeDistribution>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LevelStats {
    pub level: usize,
    pub label: String,
    pub bin_size: u64,
    pub fpr: f64,
    pub memory_bytes: usize,
    pub set_bits: Vec<u64>,
    /// Fraction of set bits in each bin.
    pub fill: Vec<f64>,
    /// `fill^h`, the false positive rate each bin actually shows.
    pub empirical_fpr: Vec<f64>,
}

/// Spread of the fill ratio of one bin over the levels.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SizeDistribution {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Minimum, upper median and maximum of a bin's occurrence counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSummary {
    pub len: usize,
    pub min: u32,
    pub median: u32,
    pub max: u32,
}

impl CountSummary {
    pub fn from_counts(counts: impl IntoIterator<Item = u32>) -> Self {
        let mut counts: Vec<u32> = counts.into_iter().collect();
        if counts.is_empty() {
            return Self::default();
        }
        counts.sort_unstable();
        Self {
            len: counts.len(),
            min: counts[0],
            median: counts[counts.len() / 2],
            max: counts[counts.len() - 1],
        }
    }
}

impl IndexStats {
    /// Load each level of the store once and measure its bins.
    pub fn analyze(store: &LevelStore) -> Result<Self> {
        let metadata = store.metadata();
        let mut level_stats = Vec::with_capacity(store.level_count());

        for level in 0..store.level_count() {
            let filter = store.load_level(level)?;
            let set_bits = filter.occupancy();
            let bin_size = filter.bin_size();
            let fill: Vec<f64> = set_bits
                .iter()
                .map(|&bits| bits as f64 / bin_size as f64)
                .collect();
            let empirical_fpr = fill
                .iter()
                .map(|f| f.powi(metadata.hash_count as i32))
                .collect();
            level_stats.push(LevelStats {
                level,
                label: store.scheme().level_label(level),
                bin_size,
                fpr: store.fpr(level),
                memory_bytes: filter.memory_bytes(),
                set_bits,
                fill,
                empirical_fpr,
            });
        }

        let bin_fill = (0..store.bin_count())
            .map(|bin| Self::bin_distribution(&level_stats, bin))
            .collect();

        Ok(IndexStats {
            bin_names: metadata.bin_names.keys().cloned().collect(),
            hash_count: metadata.hash_count,
            compressed: metadata.compressed,
            samplewise: metadata.scheme.is_samplewise(),
            level_stats,
            bin_fill,
        })
    }

    fn bin_distribution(level_stats: &[LevelStats], bin: usize) -> SizeDistribution {
        if level_stats.is_empty() {
            return SizeDistribution::default();
        }
        let fills = level_stats.iter().map(|level| level.fill[bin]);
        SizeDistribution {
            min: fills.clone().fold(f64::INFINITY, f64::min),
            max: fills.clone().fold(0.0, f64::max),
            mean: fills.sum::<f64>() / level_stats.len() as f64,
        }
    }

    /// The worst empirical false positive rate of any bin at `level`.
    pub fn max_empirical_fpr(&self, level: usize) -> f64 {
        self.level_stats[level]
            .empirical_fpr
            .iter()
            .copied()
            .fold(0.0, f64::max)
    }

    /// Generate a report of fill and false positive rates per level and bin
    pub fn summary_report(&self) -> String {
        let mut report = String::new();

        report.push_str("\nIndex Level Analysis\n");
        report.push_str("====================\n\n");
        report.push_str(&format!(
            "Leveling: {}\n",
            if self.samplewise { "samplewise" } else { "global" }
        ));
        report.push_str(&format!("Bins: {}\n", self.bin_names.len()));
        report.push_str(&format!("Hash functions: {}\n", self.hash_count));
        report.push_str(&format!("Compressed: {}\n\n", self.compressed));

        report.push_str("Level-by-Level Analysis:\n");
        for level in &self.level_stats {
            report.push_str(&format!(
                "Level {} ({}, {} bits per bin):\n",
                level.level, level.label, level.bin_size
            ));
            report.push_str(&format!("  - Recorded fpr: {:.4}\n", level.fpr));
            report.push_str(&format!(
                "  - Worst empirical fpr: {:.4}\n",
                self.max_empirical_fpr(level.level)
            ));
            report.push_str(&format!("  - Memory: {} bytes\n", level.memory_bytes));
            for (bin, name) in self.bin_names.iter().enumerate() {
                report.push_str(&format!(
                    "    {}: {} bits set, fill {:.4}, fpr {:.4}\n",
                    name, level.set_bits[bin], level.fill[bin], level.empirical_fpr[bin]
                ));
            }
        }

        report.push_str("\nBin Fill Across Levels:\n");
        for (name, fill) in self.bin_names.iter().zip(&self.bin_fill) {
            report.push_str(&format!(
                "- {}: min {:.4}, mean {:.4}, max {:.4}\n",
                name, fill.min, fill.mean, fill.max
            ));
        }

        report.push_str("\nFalse Positive Analysis:\n");
        let overfull: Vec<&LevelStats> = self
            .level_stats
            .iter()
            .filter(|level| self.max_empirical_fpr(level.level) > level.fpr)
            .collect();
        if overfull.is_empty() {
            report.push_str("- Every level is within its recorded false positive rate\n");
        } else {
            for level in overfull {
                report.push_str(&format!(
                    "- {} exceeds its recorded rate; consider larger bins\n",
                    level.label
                ));
            }
        }

        report
    }
}
