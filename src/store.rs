use std::{
    ffi::OsString,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::{
    block::{write_block, BlockConfig, BlockHeader, BlockLayout, BlockReader, BlockWriter},
    error::{IbfError, Result},
    ibf::LevelFilter,
    levels::{Calibration, LevelMetadata, SchemeKind},
};

/// An index on disk: one metadata file, one filter file per level and, for
/// samplewise indexes, a calibration file. All share a path prefix, which is
/// concatenated verbatim, so `out/` and `out/Test_` are both valid prefixes.
#[derive(Debug)]
pub struct LevelStore {
    prefix: OsString,
    metadata: LevelMetadata,
    calibration: Option<Calibration>,
    block_config: BlockConfig,
}

impl LevelStore {
    const METADATA_FILENAME: &'static str = "IBF_Data";
    const CALIBRATION_FILENAME: &'static str = "IBF_Levels.levels";

    fn prefixed(&self, name: &str) -> PathBuf {
        prefixed(&self.prefix, name)
    }

    /// Start a new index under `prefix`. Nothing is written until a level,
    /// the calibration or [`LevelStore::finalize`] is.
    pub fn create(prefix: impl AsRef<Path>, metadata: LevelMetadata) -> Result<Self> {
        metadata.validate()?;
        let prefix = prefix.as_ref().as_os_str().to_os_string();
        if let Some(parent) = Path::new(&prefix).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(IbfError::InvalidConfig(format!(
                    "output directory {} does not exist",
                    parent.display()
                )));
            }
        }
        Ok(Self {
            prefix,
            metadata,
            calibration: None,
            block_config: BlockConfig::default(),
        })
    }

    pub fn with_block_config(mut self, config: BlockConfig) -> Self {
        self.block_config = config;
        self
    }

    /// Path of the filter file of `level`.
    pub fn level_path(&self, level: usize) -> PathBuf {
        self.prefixed(&self.metadata.scheme.level_file_name(level))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.prefixed(Self::METADATA_FILENAME)
    }

    pub fn calibration_path(&self) -> PathBuf {
        self.prefixed(Self::CALIBRATION_FILENAME)
    }

    pub fn write_level(&self, level: usize, filter: &LevelFilter) -> Result<()> {
        let path = self.level_path(level);
        self.write_level_inner(level, filter)
            .map_err(|e| e.at_level(level, &path))
    }

    /// Check a level's block header against the metadata.
    fn check_level_header(&self, level: usize, header: &BlockHeader) -> Result<()> {
        let bin_size = *self.metadata.bin_sizes.get(level).ok_or_else(|| {
            IbfError::InvalidConfig(format!(
                "level {} is beyond the {} configured levels",
                level,
                self.level_count()
            ))
        })?;
        if header.bin_count as usize != self.metadata.bin_count {
            return Err(IbfError::BinCountMismatch {
                level,
                expected: self.metadata.bin_count,
                found: header.bin_count as usize,
            });
        }
        let layout = if self.metadata.compressed {
            BlockLayout::Compressed
        } else {
            BlockLayout::Uncompressed
        };
        if header.layout != layout {
            return Err(IbfError::Corrupt(format!(
                "{:?} filter in a {:?} index",
                header.layout, layout
            )));
        }
        if header.hash_count as usize != self.metadata.hash_count
            || header.bin_size != bin_size
        {
            return Err(IbfError::Corrupt(format!(
                "filter of {} bits and {} hashes, metadata records {} bits and {} hashes",
                header.bin_size, header.hash_count, bin_size, self.metadata.hash_count
            )));
        }
        Ok(())
    }

    /// Read and check the header of one level file.
    fn read_level_header(&self, level: usize) -> Result<BlockHeader> {
        let path = self.level_path(level);
        File::open(&path)
            .map_err(IbfError::from)
            .and_then(|file| BlockReader::new(BufReader::new(file)).read_block_header())
            .and_then(|header| {
                self.check_level_header(level, &header)?;
                Ok(header)
            })
            .map_err(|e| e.at_level(level, &path))
    }

    fn write_level_inner(&self, level: usize, filter: &LevelFilter) -> Result<()> {
        if level >= self.level_count() {
            return Err(IbfError::InvalidConfig(format!(
                "level {} is beyond the {} configured levels",
                level,
                self.level_count()
            )));
        }
        let block = BlockWriter::new(self.block_config).encode(filter)?;
        self.check_level_header(level, &block.header)?;
        let mut file = BufWriter::new(File::create(self.level_path(level))?);
        write_block(&mut file, &block)?;
        file.flush()?;
        debug!(
            "Wrote {} ({} bytes compressed)",
            self.metadata.scheme.level_label(level),
            block.header.compressed_size
        );
        Ok(())
    }

    pub fn write_calibration(&mut self, calibration: Calibration) -> Result<()> {
        let mut calibration = calibration;
        calibration.check_shape(self.level_count(), self.metadata.bin_count)?;
        calibration.write(&self.calibration_path())?;
        self.calibration = Some(calibration);
        Ok(())
    }

    /// Write the metadata, completing the index.
    pub fn finalize(&self) -> Result<()> {
        if self.metadata.scheme.is_samplewise() && self.calibration.is_none() {
            return Err(IbfError::InvalidConfig(
                "a samplewise index needs its calibration written before finalizing".to_string(),
            ));
        }
        self.metadata.write(&self.metadata_path())?;
        info!(
            "Finalized index {} with {} levels over {} bins",
            Path::new(&self.prefix).display(),
            self.level_count(),
            self.metadata.bin_count
        );
        Ok(())
    }

    /// Open an existing index and check, before any query work, that the
    /// calibration matches and every level file header agrees with the
    /// metadata.
    pub fn open(prefix: impl AsRef<Path>) -> Result<Self> {
        let start = Instant::now();
        let prefix = prefix.as_ref().as_os_str().to_os_string();
        let metadata_path = prefixed(&prefix, Self::METADATA_FILENAME);
        let metadata = LevelMetadata::open(&metadata_path).map_err(|e| match e {
            IbfError::IOError(io) => IbfError::IOError(std::io::Error::new(
                io.kind(),
                format!("{}: {}", metadata_path.display(), io),
            )),
            other => other,
        })?;

        let mut store = Self {
            prefix,
            metadata,
            calibration: None,
            block_config: BlockConfig::default(),
        };

        if store.metadata.scheme.is_samplewise() {
            let mut calibration = Calibration::open(&store.calibration_path())?;
            calibration.check_shape(store.level_count(), store.metadata.bin_count)?;
            store.calibration = Some(calibration);
        }

        for level in 0..store.level_count() {
            store.read_level_header(level)?;
        }

        info!(
            "Opened index with {} levels over {} bins in {:?}",
            store.level_count(),
            store.metadata.bin_count,
            start.elapsed()
        );
        Ok(store)
    }

    /// Read and decode the filter of one level.
    pub fn load_level(&self, level: usize) -> Result<LevelFilter> {
        let path = self.level_path(level);
        File::open(&path)
            .map_err(IbfError::from)
            .and_then(|file| {
                let mut reader = BlockReader::new(BufReader::new(file));
                let header = reader.read_block_header()?;
                self.check_level_header(level, &header)?;
                let block = reader.read_payload(header)?;
                reader.decode(&block)
            })
            .map_err(|e| e.at_level(level, &path))
    }

    pub fn metadata(&self) -> &LevelMetadata {
        &self.metadata
    }

    pub fn scheme(&self) -> &SchemeKind {
        &self.metadata.scheme
    }

    pub fn level_count(&self) -> usize {
        self.metadata.level_count()
    }

    pub fn bin_count(&self) -> usize {
        self.metadata.bin_count
    }

    pub fn fpr(&self, level: usize) -> f64 {
        self.metadata.fpr[level]
    }

    /// Expression value bin `bin` reaches at `level`.
    pub fn threshold(&self, level: usize, bin: usize) -> u32 {
        match (&self.metadata.scheme, &self.calibration) {
            (SchemeKind::Global { thresholds }, _) => thresholds[level],
            (SchemeKind::Samplewise { .. }, Some(calibration)) => calibration.value(level, bin),
            (SchemeKind::Samplewise { .. }, None) => 0,
        }
    }

    pub fn bin_names(&self) -> &IndexMap<String, usize> {
        &self.metadata.bin_names
    }

    pub fn bin_index(&self, name: &str) -> Option<usize> {
        self.metadata.bin_names.get(name).copied()
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }
}

fn prefixed(prefix: &OsString, name: &str) -> PathBuf {
    let mut path = prefix.clone();
    path.push(name);
    PathBuf::from(path)
}
