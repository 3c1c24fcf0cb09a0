// error.rs

use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IbfError>;

#[derive(Error, Debug)]
pub enum IbfError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Expression thresholds must be distinct, {0} appears more than once")]
    DuplicateThreshold(u32),

    #[error("Bin size for level {level} must be positive")]
    NonPositiveBinSize { level: usize },

    #[error("Expected 1 or {expected} values per level, found {found}")]
    FprLengthMismatch { expected: usize, found: usize },

    #[error("Number of hash functions must be between 1 and 5, found {0}")]
    InvalidHashCount(usize),

    #[error("False positive rate must lie in (0, 1), found {0}")]
    InvalidFpr(f64),

    #[error("Bin {bin} is out of range for a filter with {bin_count} bins")]
    BinOutOfRange { bin: usize, bin_count: usize },

    #[error("Compressed filters are read-only and cannot be inserted into")]
    ImmutableFilter,

    #[error("Level {level} file {}: {source}", path.display())]
    LevelFile {
        level: usize,
        path: PathBuf,
        #[source]
        source: Box<IbfError>,
    },

    #[error("Calibration file has {found} levels, but {expected} are configured")]
    CalibrationRows { expected: usize, found: usize },

    #[error("Calibration level {level} has {found} values, expected one per bin ({expected})")]
    CalibrationColumns {
        level: usize,
        expected: usize,
        found: usize,
    },

    #[error("Level {level} filter has {found} bins, but the metadata records {expected}")]
    BinCountMismatch {
        level: usize,
        expected: usize,
        found: usize,
    },

    #[error("Count file {} line {line}: {message}", path.display())]
    CountFile {
        path: PathBuf,
        line: u64,
        message: String,
    },

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Parse integer error: {0}")]
    ParseIntError(#[from] ParseIntError),

    #[error("Bincode error: {0}")]
    BincodeError(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("{0}")]
    StringError(String),
}

impl IbfError {
    /// Attach the level index and path of the file being read.
    pub fn at_level(self, level: usize, path: impl Into<PathBuf>) -> Self {
        IbfError::LevelFile {
            level,
            path: path.into(),
            source: Box::new(self),
        }
    }
}

// Add a convenience implementation for &str errors
impl From<&str> for IbfError {
    fn from(error: &str) -> Self {
        IbfError::StringError(error.to_string())
    }
}

impl From<String> for IbfError {
    fn from(error: String) -> Self {
        IbfError::StringError(error)
    }
}

impl From<Box<bincode::ErrorKind>> for IbfError {
    fn from(error: Box<bincode::ErrorKind>) -> Self {
        IbfError::BincodeError(error.to_string())
    }
}
