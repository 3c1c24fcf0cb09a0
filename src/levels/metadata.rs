// levels/metadata.rs

use std::{fs::File, io::BufWriter, io::Write, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::SchemeKind;
use crate::error::{IbfError, Result};
use crate::ibf::MAX_HASH_COUNT;
use crate::minimiser::MinimiserConfig;

/// Bumped whenever the layout of [`LevelMetadata`] changes.
pub const METADATA_VERSION: u32 = 1;

/// Everything needed to reopen an index: the shape shared by all level
/// filters, the per-level sizing, the bin names and the leveling scheme.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LevelMetadata {
    pub format_version: u32,
    pub bin_count: usize,
    pub hash_count: usize,
    /// False positive rate of each level.
    pub fpr: Vec<f64>,
    /// Bits per bin of each level.
    pub bin_sizes: Vec<u64>,
    pub compressed: bool,
    /// Bin name to bin index, in bin order.
    pub bin_names: IndexMap<String, usize>,
    pub scheme: SchemeKind,
    pub minimiser: MinimiserConfig,
}

impl LevelMetadata {
    pub fn level_count(&self) -> usize {
        self.scheme.level_count()
    }

    pub fn validate(&self) -> Result<()> {
        if self.format_version != METADATA_VERSION {
            return Err(IbfError::Corrupt(format!(
                "unsupported metadata version {} (expected {})",
                self.format_version, METADATA_VERSION
            )));
        }
        let levels = self.level_count();
        if levels == 0 {
            return Err(IbfError::Corrupt("index has no levels".to_string()));
        }
        if self.hash_count == 0 || self.hash_count > MAX_HASH_COUNT {
            return Err(IbfError::InvalidHashCount(self.hash_count));
        }
        if self.fpr.len() != levels {
            return Err(IbfError::FprLengthMismatch {
                expected: levels,
                found: self.fpr.len(),
            });
        }
        if self.bin_sizes.len() != levels {
            return Err(IbfError::Corrupt(format!(
                "metadata records {} bin sizes for {} levels",
                self.bin_sizes.len(),
                levels
            )));
        }
        if let Some(level) = self.bin_sizes.iter().position(|&size| size == 0) {
            return Err(IbfError::NonPositiveBinSize { level });
        }
        if self.bin_names.len() != self.bin_count {
            return Err(IbfError::Corrupt(format!(
                "metadata names {} bins, expected {}",
                self.bin_names.len(),
                self.bin_count
            )));
        }
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut file, &self)?;
        file.flush()?;
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let metadata: Self = bincode::deserialize(&mmap[..])?;
        metadata.validate()?;
        Ok(metadata)
    }
}
