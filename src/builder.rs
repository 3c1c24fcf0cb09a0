// builder.rs
//
// Builds one interleaved Bloom filter per expression level from the
// minimiser counts of each bin, and writes them out as a level store.

use std::path::Path;
use std::time::Instant;

use indexmap::IndexMap;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::block::BlockConfig;
use crate::counts::CountFile;
use crate::error::{IbfError, Result};
use crate::ibf::{
    bin_size_for_fpr, fpr_for_bin_size, InterleavedBloomFilter, LevelFilter, MAX_HASH_COUNT,
};
use crate::levels::{
    bucket_of, samplewise_thresholds, Calibration, LevelMetadata, LevelSpec, SchemeKind,
    METADATA_VERSION,
};
use crate::minimiser::{MinimiserConfig, MinimiserSource};
use crate::stats::CountSummary;
use crate::store::LevelStore;

/// The minimiser occurrence counts of one bin.
#[derive(Clone, Debug, Default)]
pub struct BinCounts {
    pub name: String,
    pub counts: FxHashMap<u64, u32>,
}

impl BinCounts {
    pub fn new(name: impl Into<String>, counts: FxHashMap<u64, u32>) -> Self {
        Self {
            name: name.into(),
            counts,
        }
    }

    /// Count a multiset of minimiser hashes.
    pub fn from_minimisers(name: impl Into<String>, minimisers: impl IntoIterator<Item = u64>) -> Self {
        let mut counts = FxHashMap::default();
        for hash in minimisers {
            *counts.entry(hash).or_insert(0u32) += 1;
        }
        Self::new(name, counts)
    }

    /// Count the minimisers of every sequence of a bin.
    pub fn from_sequences<'a>(
        name: impl Into<String>,
        sequences: impl IntoIterator<Item = &'a [u8]>,
        source: &dyn MinimiserSource,
    ) -> Self {
        Self::from_minimisers(
            name,
            sequences
                .into_iter()
                .flat_map(|sequence| source.minimisers(sequence)),
        )
    }

    pub fn summary(&self) -> CountSummary {
        CountSummary::from_counts(self.counts.values().copied())
    }
}

/// How the bits per bin of each level are chosen. A single value applies to
/// every level.
#[derive(Clone, Debug, PartialEq)]
pub enum BinSizing {
    /// Size each level for a target false positive rate.
    FalsePositiveRate(Vec<f64>),
    /// Fixed bits per bin.
    Bits(Vec<u64>),
}

impl BinSizing {
    fn len(&self) -> usize {
        match self {
            BinSizing::FalsePositiveRate(fpr) => fpr.len(),
            BinSizing::Bits(bits) => bits.len(),
        }
    }

    fn validate(&self, levels: usize) -> Result<()> {
        let found = self.len();
        if found != 1 && found != levels {
            return Err(IbfError::FprLengthMismatch {
                expected: levels,
                found,
            });
        }
        match self {
            BinSizing::FalsePositiveRate(fpr) => {
                if let Some(&bad) = fpr.iter().find(|&&f| !(f > 0.0 && f < 1.0)) {
                    return Err(IbfError::InvalidFpr(bad));
                }
            }
            BinSizing::Bits(bits) => {
                if let Some(level) = bits.iter().position(|&b| b == 0) {
                    return Err(IbfError::NonPositiveBinSize { level });
                }
            }
        }
        Ok(())
    }

    /// Bin size and recorded false positive rate of `level`, whose fullest
    /// bin holds `elements` hashes.
    fn size_level(&self, level: usize, elements: u64, hash_count: usize) -> Result<(u64, f64)> {
        match self {
            BinSizing::FalsePositiveRate(fpr) => {
                let fpr = broadcast(fpr, level);
                Ok((bin_size_for_fpr(elements, hash_count, fpr)?, fpr))
            }
            BinSizing::Bits(bits) => {
                let bin_size = broadcast(bits, level);
                Ok((bin_size, fpr_for_bin_size(elements, hash_count, bin_size)))
            }
        }
    }
}

fn broadcast<T: Copy>(values: &[T], level: usize) -> T {
    if values.len() == 1 {
        values[0]
    } else {
        values[level]
    }
}

/// Configuration of an index build.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    pub levels: LevelSpec,
    pub sizing: BinSizing,
    pub hash_count: usize,
    /// Store the level filters in the compressed, read-only layout.
    pub compressed: bool,
    /// Minimisers seen at most this often are dropped; one value for all
    /// bins or one per bin.
    pub cutoffs: Vec<u32>,
    /// Only index these minimisers, when set.
    pub include: Option<FxHashSet<u64>>,
    pub block: BlockConfig,
}

impl BuildConfig {
    pub fn new(levels: LevelSpec) -> Self {
        Self {
            levels,
            sizing: BinSizing::FalsePositiveRate(vec![0.05]),
            hash_count: 1,
            compressed: false,
            cutoffs: Vec::new(),
            include: None,
            block: BlockConfig::default(),
        }
    }

    pub fn with_fpr(mut self, fpr: Vec<f64>) -> Self {
        self.sizing = BinSizing::FalsePositiveRate(fpr);
        self
    }

    pub fn with_bin_sizes(mut self, bits: Vec<u64>) -> Self {
        self.sizing = BinSizing::Bits(bits);
        self
    }

    pub fn with_hash_count(mut self, hash_count: usize) -> Self {
        self.hash_count = hash_count;
        self
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn with_cutoffs(mut self, cutoffs: Vec<u32>) -> Self {
        self.cutoffs = cutoffs;
        self
    }

    pub fn with_include(mut self, include: impl IntoIterator<Item = u64>) -> Self {
        self.include = Some(include.into_iter().collect());
        self
    }

    pub fn with_block_config(mut self, block: BlockConfig) -> Self {
        self.block = block;
        self
    }

    /// Check the configuration for `bin_count` bins and resolve the scheme.
    pub fn validate(&self, bin_count: usize) -> Result<SchemeKind> {
        let scheme = self.levels.resolve()?;
        if self.hash_count == 0 || self.hash_count > MAX_HASH_COUNT {
            return Err(IbfError::InvalidHashCount(self.hash_count));
        }
        self.sizing.validate(scheme.level_count())?;
        if !matches!(self.cutoffs.len(), 0 | 1) && self.cutoffs.len() != bin_count {
            return Err(IbfError::InvalidConfig(format!(
                "expected 1 or {} cutoffs, found {}",
                bin_count,
                self.cutoffs.len()
            )));
        }
        Ok(scheme)
    }

    fn cutoff(&self, bin: usize) -> u32 {
        match self.cutoffs.len() {
            0 => 0,
            1 => self.cutoffs[0],
            _ => self.cutoffs[bin],
        }
    }
}

/// The hashes one bin contributes to each level, plus its thresholds when
/// leveled samplewise.
struct BinLevels {
    per_level: Vec<Vec<u64>>,
    thresholds: Vec<u32>,
}

pub struct IndexBuilder {
    config: BuildConfig,
    minimiser: MinimiserConfig,
}

impl IndexBuilder {
    pub fn new(config: BuildConfig, minimiser: MinimiserConfig) -> Self {
        Self { config, minimiser }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Build from count files written by [`CountFile::write`], bin `i` being
    /// `paths[i]`. Every file must have been counted with this builder's
    /// minimiser parameters.
    pub fn build_from_files<P: AsRef<Path> + Sync>(
        &self,
        paths: &[P],
        prefix: impl AsRef<Path>,
    ) -> Result<LevelStore> {
        let files = paths
            .par_iter()
            .map(|path| CountFile::open(path.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let mut bins = Vec::with_capacity(files.len());
        for (file, path) in files.into_iter().zip(paths) {
            if file.minimiser != self.minimiser {
                return Err(IbfError::InvalidConfig(format!(
                    "{} was counted with {:?}, but the index uses {:?}",
                    path.as_ref().display(),
                    file.minimiser,
                    self.minimiser
                )));
            }
            bins.push(file.counts);
        }
        info!("Read counts of {} bins", bins.len());
        self.build(&bins, prefix)
    }

    /// Build every level filter from `bins` and write the index under
    /// `prefix`. Bin `i` of the filters is `bins[i]`.
    pub fn build(&self, bins: &[BinCounts], prefix: impl AsRef<Path>) -> Result<LevelStore> {
        let start = Instant::now();
        if bins.is_empty() {
            return Err(IbfError::InvalidConfig(
                "at least one bin is required to build an index".to_string(),
            ));
        }
        let scheme = self.config.validate(bins.len())?;
        self.minimiser.validate()?;

        let mut bin_names = IndexMap::with_capacity(bins.len());
        for (i, bin) in bins.iter().enumerate() {
            if bin_names.insert(bin.name.clone(), i).is_some() {
                return Err(IbfError::InvalidConfig(format!(
                    "bin name {} is used more than once",
                    bin.name
                )));
            }
        }

        let levels = scheme.level_count();
        let assigned = bins
            .par_iter()
            .enumerate()
            .map(|(i, bin)| self.assign_levels(i, bin, &scheme))
            .collect::<Result<Vec<_>>>()?;

        let mut bin_sizes = Vec::with_capacity(levels);
        let mut fpr = Vec::with_capacity(levels);
        for level in 0..levels {
            let elements = assigned
                .iter()
                .map(|bin| bin.per_level[level].len() as u64)
                .max()
                .unwrap_or(0);
            let (bin_size, level_fpr) =
                self.config.sizing.size_level(level, elements, self.config.hash_count)?;
            info!(
                "{}: {} bits per bin for up to {} minimisers, fpr {:.4}",
                scheme.level_label(level),
                bin_size,
                elements,
                level_fpr
            );
            bin_sizes.push(bin_size);
            fpr.push(level_fpr);
        }

        let metadata = LevelMetadata {
            format_version: METADATA_VERSION,
            bin_count: bins.len(),
            hash_count: self.config.hash_count,
            fpr,
            bin_sizes,
            compressed: self.config.compressed,
            bin_names,
            scheme,
            minimiser: self.minimiser,
        };
        let mut store = LevelStore::create(prefix, metadata)?.with_block_config(self.config.block);

        if store.scheme().is_samplewise() {
            let per_bin: Vec<Vec<u32>> = assigned.iter().map(|bin| bin.thresholds.clone()).collect();
            store.write_calibration(Calibration::from_bin_thresholds(&per_bin))?;
        }

        (0..levels).into_par_iter().try_for_each(|level| {
            let metadata = store.metadata();
            let mut ibf = InterleavedBloomFilter::new(
                metadata.bin_count,
                metadata.bin_sizes[level],
                metadata.hash_count,
            )?;
            for (bin, bin_levels) in assigned.iter().enumerate() {
                for &hash in &bin_levels.per_level[level] {
                    ibf.insert(hash, bin)?;
                }
            }
            let filter = if self.config.compressed {
                LevelFilter::from(ibf.compress())
            } else {
                LevelFilter::from(ibf)
            };
            debug!(
                "Built {} ({} bytes in memory)",
                metadata.scheme.level_label(level),
                filter.memory_bytes()
            );
            store.write_level(level, &filter)
        })?;

        store.finalize()?;
        info!("Built {} levels over {} bins in {:?}", levels, bins.len(), start.elapsed());
        Ok(store)
    }

    /// Split one bin's minimisers across the levels.
    fn assign_levels(&self, bin: usize, counts: &BinCounts, scheme: &SchemeKind) -> Result<BinLevels> {
        let cutoff = self.config.cutoff(bin);
        let mut kept: Vec<(u64, u32)> = Vec::with_capacity(counts.counts.len());
        for (&hash, &count) in &counts.counts {
            if count == 0 {
                return Err(IbfError::Corrupt(format!(
                    "bin {} records a zero count for minimiser {}",
                    counts.name, hash
                )));
            }
            if count <= cutoff {
                continue;
            }
            if let Some(include) = &self.config.include {
                if !include.contains(&hash) {
                    continue;
                }
            }
            kept.push((hash, count));
        }
        let summary = counts.summary();
        debug!(
            "Bin {}: kept {} of {} minimisers above cutoff {} (counts min {}, median {}, max {})",
            counts.name,
            kept.len(),
            counts.counts.len(),
            cutoff,
            summary.min,
            summary.median,
            summary.max
        );

        let levels = scheme.level_count();
        let mut per_level = vec![Vec::new(); levels];
        let thresholds = match scheme {
            SchemeKind::Global { thresholds } => {
                for &(hash, count) in &kept {
                    let reached = thresholds.partition_point(|&t| t <= count);
                    for level in per_level.iter_mut().take(reached) {
                        level.push(hash);
                    }
                }
                Vec::new()
            }
            SchemeKind::Samplewise { levels } => {
                let mut sorted: Vec<u32> = kept.iter().map(|&(_, count)| count).collect();
                sorted.sort_unstable();
                let thresholds = samplewise_thresholds(&sorted, *levels);
                for &(hash, count) in &kept {
                    per_level[bucket_of(count, &thresholds)].push(hash);
                }
                thresholds
            }
        };
        Ok(BinLevels {
            per_level,
            thresholds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibf::Membership;
    use crate::test_utils::test_utils::TestDir;

    fn make_test_bins() -> Vec<BinCounts> {
        let liver: FxHashMap<u64, u32> = [(10, 1), (11, 2), (12, 4), (13, 9)].into_iter().collect();
        let brain: FxHashMap<u64, u32> = [(10, 5), (20, 1), (21, 3)].into_iter().collect();
        vec![BinCounts::new("liver", liver), BinCounts::new("brain", brain)]
    }

    fn build_global(prefix: &Path, config: BuildConfig) -> LevelStore {
        IndexBuilder::new(config, MinimiserConfig::default())
            .build(&make_test_bins(), prefix)
            .expect("Failed to build index")
    }

    #[test]
    fn test_build_from_count_files() {
        let test_dir = TestDir::new("builder_files").expect("Failed to create test dir");
        let minimiser = MinimiserConfig::default();
        let paths: Vec<_> = make_test_bins()
            .into_iter()
            .map(|bin| {
                let path = test_dir.path().join(format!("{}.counts.gz", bin.name));
                CountFile::new(bin, minimiser).write(&path).unwrap();
                path
            })
            .collect();

        let config = BuildConfig::new(LevelSpec::Global(vec![1, 2, 4])).with_bin_sizes(vec![1 << 16]);
        let from_files = IndexBuilder::new(config.clone(), minimiser)
            .build_from_files(&paths, test_dir.path().join("F_"))
            .unwrap();
        let in_memory = build_global(&test_dir.path().join("M_"), config.clone());
        assert_eq!(from_files.bin_names(), in_memory.bin_names());
        for level in 0..3 {
            assert_eq!(
                from_files.load_level(level).unwrap(),
                in_memory.load_level(level).unwrap()
            );
        }

        // Counts taken with other minimiser parameters are refused.
        let other = IndexBuilder::new(config.clone(), MinimiserConfig::new(15, 25));
        assert!(matches!(
            other.build_from_files(&paths, test_dir.path().join("O_")),
            Err(IbfError::InvalidConfig(_))
        ));

        // A malformed count file names itself and the line.
        std::fs::write(&paths[1], "#ibfexpr-counts v1\n#bin\tbrain\t20\t60\t1\t-\n10\tfive\n").unwrap();
        match IndexBuilder::new(config, minimiser).build_from_files(&paths, test_dir.path().join("B_")) {
            Err(IbfError::CountFile { path, line, .. }) => {
                assert_eq!(path, paths[1]);
                assert_eq!(line, 3);
            }
            other => panic!("expected a count file error, got {:?}", other.map(|_| ())),
        }
        assert!(!test_dir.path().join("B_IBF_Data").exists());
    }

    #[test]
    fn test_global_levels_are_cumulative() {
        let test_dir = TestDir::new("builder_global").expect("Failed to create test dir");
        let config = BuildConfig::new(LevelSpec::Global(vec![4, 1, 2])).with_bin_sizes(vec![1 << 16]);
        let store = build_global(&test_dir.path().join("G_"), config);

        let level_1 = store.load_level(0).unwrap();
        let level_4 = store.load_level(2).unwrap();
        // Every minimiser reaches threshold 1.
        for hash in [10, 11, 12, 13] {
            assert!(level_1.bulk_contains(hash)[0]);
        }
        assert!(level_4.bulk_contains(12)[0]);
        assert!(level_4.bulk_contains(13)[0]);
        assert!(level_4.bulk_contains(10)[1]);
        assert!(!level_4.bulk_contains(20)[1]);
        assert!(test_dir.path().join("G_IBF_4").is_file());
    }

    #[test]
    fn test_cutoffs_and_include() {
        let test_dir = TestDir::new("builder_cutoffs").expect("Failed to create test dir");
        let config = BuildConfig::new(LevelSpec::Global(vec![1]))
            .with_bin_sizes(vec![1 << 16])
            .with_cutoffs(vec![1, 0])
            .with_include([10, 11, 20]);
        let store = build_global(&test_dir.path().join("C_"), config);
        let filter = store.load_level(0).unwrap();
        // liver: 10 has count 1, at the cutoff
        assert!(!filter.bulk_contains(10)[0]);
        assert!(filter.bulk_contains(11)[0]);
        // 12 is outside the include set
        assert!(!filter.bulk_contains(12)[0]);
        assert!(filter.bulk_contains(20)[1]);
        assert!(!filter.bulk_contains(21)[1]);
    }

    #[test]
    fn test_samplewise_buckets_and_calibration() {
        let test_dir = TestDir::new("builder_samplewise").expect("Failed to create test dir");
        let counts: FxHashMap<u64, u32> = (1..=10u64).map(|h| (h, h as u32)).collect();
        let bins = vec![BinCounts::new("only", counts)];
        let config = BuildConfig::new(LevelSpec::Samplewise { levels: 3 })
            .with_bin_sizes(vec![1 << 16])
            .compressed(true);
        let store = IndexBuilder::new(config, MinimiserConfig::default())
            .build(&bins, test_dir.path().join("S_"))
            .unwrap();

        // counts 1..=10: medians 6, then 9 of [7..=10], then 10 of [10]
        let calibration = store.calibration().unwrap();
        assert_eq!(calibration.row(0), &[6]);
        assert_eq!(calibration.row(1), &[9]);
        assert_eq!(calibration.row(2), &[10]);

        let filters: Vec<_> = (0..3).map(|l| store.load_level(l).unwrap()).collect();
        assert!(filters.iter().all(|f| f.is_compressed()));
        let in_level = |hash: u64| -> Vec<usize> {
            (0..3).filter(|&l| filters[l].bulk_contains(hash)[0]).collect()
        };
        assert_eq!(in_level(2), vec![0]);
        assert_eq!(in_level(9), vec![1]);
        assert_eq!(in_level(10), vec![2]);

        let reopened = LevelStore::open(test_dir.path().join("S_")).unwrap();
        assert_eq!(reopened.threshold(1, 0), 9);
    }

    #[test]
    fn test_fpr_sizing_recorded() {
        let test_dir = TestDir::new("builder_fpr").expect("Failed to create test dir");
        let config = BuildConfig::new(LevelSpec::Global(vec![1, 2])).with_fpr(vec![0.01, 0.2]);
        let store = build_global(&test_dir.path().join("F_"), config);
        assert_eq!(store.fpr(0), 0.01);
        assert_eq!(store.fpr(1), 0.2);
        let sizes = &store.metadata().bin_sizes;
        assert!(sizes[0] > sizes[1]);
    }

    #[test]
    fn test_invalid_configs_rejected_before_io() {
        let test_dir = TestDir::new("builder_invalid").expect("Failed to create test dir");
        let prefix = test_dir.path().join("I_");
        let bins = make_test_bins();
        let build = |config: BuildConfig| {
            IndexBuilder::new(config, MinimiserConfig::default()).build(&bins, &prefix)
        };

        assert!(matches!(
            build(BuildConfig::new(LevelSpec::Global(vec![1, 1]))),
            Err(IbfError::DuplicateThreshold(1))
        ));
        assert!(matches!(
            build(BuildConfig::new(LevelSpec::Global(vec![1, 2, 3])).with_fpr(vec![0.1, 0.2])),
            Err(IbfError::FprLengthMismatch {
                expected: 3,
                found: 2
            })
        ));
        assert!(matches!(
            build(BuildConfig::new(LevelSpec::Global(vec![1])).with_bin_sizes(vec![0])),
            Err(IbfError::NonPositiveBinSize { level: 0 })
        ));
        assert!(matches!(
            build(BuildConfig::new(LevelSpec::Global(vec![1])).with_fpr(vec![1.5])),
            Err(IbfError::InvalidFpr(_))
        ));
        assert!(matches!(
            build(BuildConfig::new(LevelSpec::Global(vec![1])).with_cutoffs(vec![1, 2, 3])),
            Err(IbfError::InvalidConfig(_))
        ));
        assert!(!test_dir.path().join("I_IBF_Data").exists());
    }

    #[test]
    fn test_zero_count_is_malformed() {
        let test_dir = TestDir::new("builder_zero").expect("Failed to create test dir");
        let counts: FxHashMap<u64, u32> = [(1, 0)].into_iter().collect();
        let result = IndexBuilder::new(
            BuildConfig::new(LevelSpec::Global(vec![1])),
            MinimiserConfig::default(),
        )
        .build(&[BinCounts::new("bad", counts)], test_dir.path().join("Z_"));
        assert!(matches!(result, Err(IbfError::Corrupt(_))));
    }

    #[test]
    fn test_from_minimisers_counts() {
        let bin = BinCounts::from_minimisers("a", [5, 5, 7, 5]);
        assert_eq!(bin.counts[&5], 3);
        assert_eq!(bin.counts[&7], 1);
        let summary = bin.summary();
        assert_eq!((summary.min, summary.max), (1, 3));
    }
}
