pub mod block;
pub mod builder;
pub mod counts;
pub mod error;
pub mod estimate;
pub mod ibf;
pub mod io;
pub mod levels;
pub mod logging;
pub mod minimiser;
pub mod stats;
pub mod store;

pub use builder::{BinCounts, BinSizing, BuildConfig, IndexBuilder};
pub use counts::{count_transcripts, CountFile};
pub use error::{IbfError, Result};
pub use estimate::{
    corrected, resolve_level, EstimateConfig, Estimator, ExpressionTable, LevelingScheme,
    Normalization, QueryTranscript, TranscriptState,
};
pub use ibf::{
    bin_size_for_fpr, fpr_for_bin_size, CompressedBloomFilter, InterleavedBloomFilter,
    LevelFilter, Membership,
};
pub use io::{InputStream, OutputStream, OutputWriter};
pub use levels::{Calibration, LevelMetadata, LevelSpec, SchemeKind};
pub use logging::init_logging;
pub use minimiser::{MinimiserConfig, MinimiserSource, WindowMinimiser};
pub use stats::{CountSummary, IndexStats};
pub use store::LevelStore;

#[cfg(test)]
pub(crate) mod test_utils;
