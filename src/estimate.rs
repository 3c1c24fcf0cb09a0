/// estimate.rs
///
/// # Expression estimation
///
/// A transcript's expression in a bin is found by walking the levels from the
/// highest threshold down. At each level every minimiser of the transcript is
/// tested against the level filter, giving a hit count per bin. Hit counts are
/// corrected for the false positives the level's filter is expected to give:
///
///   corrected(c, M, fpr) = max(0, (c - M * fpr) / (1 - fpr))
///
/// where `M` is the number of minimisers of the transcript. A bin resolves at
/// the first level where the corrected hits of the levels above (`seen`) and
/// of this level (`seen2`) together cover half the transcript. The highest
/// level resolves to its own threshold. Lower levels interpolate between
/// their threshold `e_j` and the one above, `e_{j+1}`:
///
///   max(e_j, e_{j+1} - |M/2 - seen| / max(seen2, 1) * (e_{j+1} - e_j))
///
/// A resolved bin is never revisited. Bins that never resolve stay at zero.
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{IbfError, Result};
use crate::ibf::Membership;
use crate::io::OutputStream;
use crate::levels::{Calibration, SchemeKind};
use crate::minimiser::{MinimiserSource, WindowMinimiser};
use crate::store::LevelStore;

/// Hits corrected for the false positives expected among `minimisers` probes.
#[inline]
pub fn corrected(count: f64, minimisers: f64, fpr: f64) -> f64 {
    ((count - minimisers * fpr) / (1.0 - fpr)).max(0.0)
}

/// Where the expression value of each level comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum LevelingScheme {
    /// One threshold per level, ascending, shared by every bin.
    Global(Vec<u32>),
    /// Per-bin values from the calibration matrix.
    PerBin(Calibration),
}

impl LevelingScheme {
    pub fn from_store(store: &LevelStore) -> Result<Self> {
        match store.scheme() {
            SchemeKind::Global { thresholds } => Ok(LevelingScheme::Global(thresholds.clone())),
            SchemeKind::Samplewise { .. } => store
                .calibration()
                .cloned()
                .map(LevelingScheme::PerBin)
                .ok_or_else(|| {
                    IbfError::InvalidConfig("samplewise index has no calibration".to_string())
                }),
        }
    }

    pub fn level_count(&self) -> usize {
        match self {
            LevelingScheme::Global(thresholds) => thresholds.len(),
            LevelingScheme::PerBin(calibration) => calibration.level_count(),
        }
    }

    /// Expression value of `bin` at `level`.
    #[inline]
    pub fn value(&self, level: usize, bin: usize) -> f64 {
        match self {
            LevelingScheme::Global(thresholds) => thresholds[level] as f64,
            LevelingScheme::PerBin(calibration) => calibration.value(level, bin) as f64,
        }
    }

    /// The level-0 value of `bin`; only per-bin schemes have one.
    #[inline]
    pub fn baseline(&self, bin: usize) -> Option<u32> {
        match self {
            LevelingScheme::Global(_) => None,
            LevelingScheme::PerBin(calibration) => Some(calibration.baseline(bin)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Normalization {
    #[default]
    None,
    /// Divide each estimate by its bin's level-0 calibration value.
    ByBaseline,
}

#[derive(Clone, Debug)]
pub struct EstimateConfig {
    pub threads: usize,
    pub normalization: Normalization,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            normalization: Normalization::None,
        }
    }
}

impl EstimateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(IbfError::InvalidConfig(
                "at least one thread is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// A query transcript.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryTranscript {
    pub id: String,
    pub sequence: Vec<u8>,
}

impl QueryTranscript {
    pub fn new(id: impl Into<String>, sequence: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            sequence: sequence.into(),
        }
    }
}

/// Per-transcript progress through the level sweep.
#[derive(Clone, Debug)]
pub struct TranscriptState {
    minimisers: Vec<u64>,
    /// Hits of the current level, reused between levels.
    counts: Vec<u32>,
    /// Hits accumulated over the levels visited without resolving.
    prev_counts: Vec<u32>,
    estimates: Vec<f64>,
    resolved: Vec<bool>,
}

impl TranscriptState {
    pub fn new(minimisers: Vec<u64>, bin_count: usize) -> Self {
        Self {
            minimisers,
            counts: vec![0; bin_count],
            prev_counts: vec![0; bin_count],
            estimates: vec![0.0; bin_count],
            resolved: vec![false; bin_count],
        }
    }

    pub fn minimiser_count(&self) -> usize {
        self.minimisers.len()
    }

    pub fn estimates(&self) -> &[f64] {
        &self.estimates
    }

    pub fn is_resolved(&self, bin: usize) -> bool {
        self.resolved[bin]
    }

    fn all_resolved(&self) -> bool {
        self.resolved.iter().all(|&r| r)
    }

    fn into_estimates(self) -> Vec<f64> {
        self.estimates
    }
}

/// Run one level of the sweep for one transcript. The top level is the last
/// one of `scheme`.
pub fn resolve_level<F: Membership + ?Sized>(
    state: &mut TranscriptState,
    filter: &F,
    level: usize,
    scheme: &LevelingScheme,
    fpr: f64,
    normalization: Normalization,
) {
    if state.minimisers.is_empty() || state.all_resolved() {
        return;
    }
    let top = level + 1 == scheme.level_count();

    state.counts.fill(0);
    for &hash in &state.minimisers {
        filter.count_into(hash, &mut state.counts);
    }

    let m = state.minimisers.len() as f64;
    let half = m / 2.0;
    for bin in 0..state.counts.len() {
        if state.resolved[bin] {
            continue;
        }
        let count = state.counts[bin];
        let seen = corrected(state.prev_counts[bin] as f64, m, fpr);
        let seen2 = corrected(count as f64, m, fpr);

        if seen + seen2 < half {
            state.prev_counts[bin] += count;
            continue;
        }

        let current = scheme.value(level, bin);
        let mut estimate = if top {
            current
        } else {
            let above = scheme.value(level + 1, bin);
            current.max(above - (half - seen).abs() / seen2.max(1.0) * (above - current))
        };
        if normalization == Normalization::ByBaseline {
            if let Some(baseline) = scheme.baseline(bin).filter(|&b| b > 0) {
                estimate /= baseline as f64;
            }
        }
        state.estimates[bin] = estimate;
        state.resolved[bin] = true;
        state.prev_counts[bin] = 0;
    }
}

/// Estimates of every transcript in every bin.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionTable {
    pub ids: Vec<String>,
    pub bin_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl ExpressionTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, transcript: usize, bin: usize) -> f64 {
        self.rows[transcript][bin]
    }

    /// The estimate of the transcript named `id` in the bin named `bin`.
    pub fn lookup(&self, id: &str, bin: &str) -> Option<f64> {
        let row = self.ids.iter().position(|i| i == id)?;
        let column = self.bin_names.iter().position(|b| b == bin)?;
        Some(self.rows[row][column])
    }

    /// One line per transcript: its id, then every estimate rounded to the
    /// nearest integer (halves away from zero), each followed by a tab.
    pub fn write_tsv<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        for (id, row) in self.ids.iter().zip(&self.rows) {
            write!(writer, "{}\t", id)?;
            for value in row {
                write!(writer, "{}\t", value.round() as i64)?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    pub fn to_tsv(&self) -> String {
        let mut buffer = Vec::new();
        // Writing to a Vec cannot fail.
        let _ = self.write_tsv(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Sweeps the levels of a store to estimate transcript expression.
pub struct Estimator<'a> {
    store: &'a LevelStore,
    scheme: LevelingScheme,
    config: EstimateConfig,
    pool: rayon::ThreadPool,
}

impl<'a> Estimator<'a> {
    pub fn new(store: &'a LevelStore, config: EstimateConfig) -> Result<Self> {
        config.validate()?;
        let scheme = LevelingScheme::from_store(store)?;
        if scheme.level_count() != store.level_count() {
            return Err(IbfError::CalibrationRows {
                expected: store.level_count(),
                found: scheme.level_count(),
            });
        }
        if let Some(&fpr) = store.metadata().fpr.iter().find(|&&f| !(0.0..1.0).contains(&f)) {
            return Err(IbfError::InvalidFpr(fpr));
        }
        if config.normalization == Normalization::ByBaseline
            && matches!(scheme, LevelingScheme::Global(_))
        {
            warn!("Normalization needs a samplewise index, estimates stay unnormalized");
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| IbfError::InvalidConfig(format!("failed to build thread pool: {}", e)))?;
        Ok(Self {
            store,
            scheme,
            config,
            pool,
        })
    }

    pub fn scheme(&self) -> &LevelingScheme {
        &self.scheme
    }

    /// The minimiser source matching the one the index was built with.
    pub fn minimiser_source(&self) -> Result<WindowMinimiser> {
        WindowMinimiser::new(self.store.metadata().minimiser)
    }

    pub fn estimate(
        &self,
        transcripts: &[QueryTranscript],
        source: &dyn MinimiserSource,
    ) -> Result<ExpressionTable> {
        let start = Instant::now();
        let bin_count = self.store.bin_count();

        let mut states: Vec<TranscriptState> = self.pool.install(|| {
            transcripts
                .par_iter()
                .map(|t| TranscriptState::new(source.minimisers(&t.sequence), bin_count))
                .collect()
        });
        let empty = states.iter().filter(|s| s.minimiser_count() == 0).count();
        if empty > 0 {
            debug!("{} transcripts have no minimisers and stay at zero", empty);
        }

        for level in (0..self.store.level_count()).rev() {
            let level_start = Instant::now();
            let filter = self.store.load_level(level)?;
            let fpr = self.store.fpr(level);
            self.pool.install(|| {
                states.par_iter_mut().for_each(|state| {
                    resolve_level(
                        state,
                        &filter,
                        level,
                        &self.scheme,
                        fpr,
                        self.config.normalization,
                    )
                })
            });
            info!(
                "Swept {} over {} transcripts in {:?}",
                self.store.scheme().level_label(level),
                transcripts.len(),
                level_start.elapsed()
            );
        }

        let table = ExpressionTable {
            ids: transcripts.iter().map(|t| t.id.clone()).collect(),
            bin_names: self.store.bin_names().keys().cloned().collect(),
            rows: states.into_iter().map(TranscriptState::into_estimates).collect(),
        };
        info!(
            "Estimated {} transcripts over {} bins in {:?}",
            table.len(),
            bin_count,
            start.elapsed()
        );
        Ok(table)
    }

    /// Estimate, then write the table to `path` (stdout when `None`). Nothing
    /// is written unless every level was swept.
    pub fn estimate_to_path(
        &self,
        transcripts: &[QueryTranscript],
        source: &dyn MinimiserSource,
        path: Option<&Path>,
    ) -> Result<ExpressionTable> {
        let table = self.estimate(transcripts, source)?;
        let mut writer = OutputStream::new(path).writer()?;
        table.write_tsv(&mut writer)?;
        writer.finish()?;
        Ok(table)
    }
}
