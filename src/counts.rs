// counts.rs
//
// Minimiser count files hold the occurrence counts of one bin, so an
// experiment is counted once and reused for any number of indexes:
//
//   #ibfexpr-counts v1
//   #bin<TAB>liver<TAB>20<TAB>60<TAB>10322608290437520094<TAB>-
//   12<TAB>4
//   981<TAB>1
//
// The second line names the bin and the minimiser parameters it was counted
// with: k, window, seed and gapped shape (`-` when ungapped). Every further
// line is a hash and its count, sorted by hash. Files may be gzipped.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use csv::ReaderBuilder;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::builder::BinCounts;
use crate::error::{IbfError, Result};
use crate::estimate::{ExpressionTable, QueryTranscript};
use crate::io::{InputStream, OutputStream};
use crate::minimiser::{MinimiserConfig, MinimiserSource, WindowMinimiser};
use crate::stats::CountSummary;

pub const COUNTS_MAGIC: &str = "#ibfexpr-counts v1";
const BIN_PREFIX: &str = "#bin\t";
// The two header lines precede the first count record.
const HEADER_LINES: u64 = 2;

/// The counts of one bin together with the minimiser parameters they were
/// taken with.
#[derive(Clone, Debug)]
pub struct CountFile {
    pub counts: BinCounts,
    pub minimiser: MinimiserConfig,
}

impl CountFile {
    pub fn new(counts: BinCounts, minimiser: MinimiserConfig) -> Self {
        Self { counts, minimiser }
    }

    /// Count the minimisers of every sequence of one experiment.
    pub fn count_sequences<'a>(
        name: impl Into<String>,
        sequences: impl IntoIterator<Item = &'a [u8]>,
        source: &WindowMinimiser,
    ) -> Self {
        Self {
            counts: BinCounts::from_sequences(name, sequences, source),
            minimiser: *source.config(),
        }
    }

    /// Write the count file, gzipped when `path` ends in `.gz`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let name = &self.counts.name;
        if name.is_empty() || name.contains(['\t', '\n', '\r']) {
            return Err(IbfError::InvalidConfig(format!(
                "bin name {:?} cannot be stored in a count file",
                name
            )));
        }
        let mut hashes: Vec<(&u64, &u32)> = self.counts.counts.iter().collect();
        hashes.sort_unstable();

        let mut writer = OutputStream::new(Some(path)).writer()?;
        let config = &self.minimiser;
        writeln!(writer, "{}", COUNTS_MAGIC)?;
        writeln!(
            writer,
            "{}{}\t{}\t{}\t{}\t{}",
            BIN_PREFIX,
            name,
            config.k,
            config.window,
            config.seed,
            config.mask.map_or_else(|| "-".to_string(), |m| m.to_string())
        )?;
        for (hash, count) in hashes {
            writeln!(writer, "{}\t{}", hash, count)?;
        }
        writer.finish()?;
        debug!("Wrote {} counts of {} to {}", self.counts.counts.len(), name, path.display());
        Ok(())
    }

    /// Read a count file, rejecting malformed lines with their line number.
    pub fn open(path: &Path) -> Result<Self> {
        let malformed = |line: u64, message: String| IbfError::CountFile {
            path: PathBuf::from(path),
            line,
            message,
        };

        let mut reader = InputStream::new(path).reader()?;
        let mut magic = String::new();
        reader.read_line(&mut magic)?;
        if magic.trim_end() != COUNTS_MAGIC {
            return Err(malformed(1, format!("expected {}", COUNTS_MAGIC)));
        }
        let mut bin_line = String::new();
        reader.read_line(&mut bin_line)?;
        let (name, minimiser) = parse_bin_line(bin_line.trim_end_matches(['\n', '\r']))
            .map_err(|message| malformed(2, message))?;

        let mut records = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut counts = FxHashMap::default();
        for record in records.records() {
            let record = record.map_err(|e| {
                let line = e.position().map_or(0, |p| p.line()) + HEADER_LINES;
                malformed(line, e.to_string())
            })?;
            let line = record.position().map_or(0, |p| p.line()) + HEADER_LINES;
            if record.len() != 2 {
                return Err(malformed(
                    line,
                    format!("expected a hash and a count, found {} fields", record.len()),
                ));
            }
            let hash: u64 = record[0]
                .parse()
                .map_err(|e| malformed(line, format!("bad hash {:?}: {}", &record[0], e)))?;
            let count: u32 = record[1]
                .parse()
                .map_err(|e| malformed(line, format!("bad count {:?}: {}", &record[1], e)))?;
            if count == 0 {
                return Err(malformed(line, format!("hash {} has a zero count", hash)));
            }
            if counts.insert(hash, count).is_some() {
                return Err(malformed(line, format!("hash {} is listed twice", hash)));
            }
        }

        Ok(Self {
            counts: BinCounts::new(name, counts),
            minimiser,
        })
    }
}

/// Parse `#bin<TAB>name<TAB>k<TAB>window<TAB>seed<TAB>mask`.
fn parse_bin_line(line: &str) -> std::result::Result<(String, MinimiserConfig), String> {
    let rest = line
        .strip_prefix(BIN_PREFIX)
        .ok_or_else(|| "expected the #bin line".to_string())?;
    let fields: Vec<&str> = rest.split('\t').collect();
    let [name, k, window, seed, mask] = fields.as_slice() else {
        return Err(format!(
            "expected a name and 4 minimiser parameters, found {} fields",
            fields.len()
        ));
    };
    if name.is_empty() {
        return Err("empty bin name".to_string());
    }
    let number = |field: &str, what: &str| {
        field
            .parse::<u64>()
            .map_err(|e| format!("bad {} {:?}: {}", what, field, e))
    };
    let minimiser = MinimiserConfig {
        k: number(*k, "k-mer size")? as usize,
        window: number(*window, "window size")? as usize,
        seed: number(*seed, "seed")?,
        mask: match *mask {
            "-" => None,
            m => Some(number(m, "shape")?),
        },
    };
    minimiser.validate().map_err(|e| e.to_string())?;
    Ok((name.to_string(), minimiser))
}

/// Exact per-transcript counts: for every transcript and bin, the median
/// occurrence count of the transcript's minimisers in that bin, absent
/// minimisers counting 0. Transcripts without minimisers stay at 0.
pub fn count_transcripts(
    transcripts: &[QueryTranscript],
    bins: &[BinCounts],
    source: &dyn MinimiserSource,
) -> ExpressionTable {
    let start = Instant::now();
    let rows: Vec<Vec<f64>> = transcripts
        .par_iter()
        .map(|transcript| {
            let minimisers = source.minimisers(&transcript.sequence);
            bins.iter()
                .map(|bin| {
                    let summary = CountSummary::from_counts(
                        minimisers
                            .iter()
                            .map(|hash| bin.counts.get(hash).copied().unwrap_or(0)),
                    );
                    summary.median as f64
                })
                .collect::<Vec<f64>>()
        })
        .collect();
    info!(
        "Counted {} transcripts over {} bins in {:?}",
        transcripts.len(),
        bins.len(),
        start.elapsed()
    );
    ExpressionTable {
        ids: transcripts.iter().map(|t| t.id.clone()).collect(),
        bin_names: bins.iter().map(|b| b.name.clone()).collect(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_utils::TestDir;

    fn make_test_count_file() -> CountFile {
        let counts: FxHashMap<u64, u32> = [(981, 1), (12, 4), (u64::MAX, 7)].into_iter().collect();
        CountFile::new(
            BinCounts::new("liver", counts),
            MinimiserConfig::new(15, 25).with_mask(0b111_0111),
        )
    }

    #[test]
    fn test_count_file_round_trip() {
        let test_dir = TestDir::new("counts_round_trip").expect("Failed to create test dir");
        let file = make_test_count_file();
        for name in ["liver.counts", "liver.counts.gz"] {
            let path = test_dir.path().join(name);
            file.write(&path).expect("Failed to write counts");
            let reopened = CountFile::open(&path).expect("Failed to open counts");
            assert_eq!(reopened.counts.name, "liver");
            assert_eq!(reopened.counts.counts, file.counts.counts);
            assert_eq!(reopened.minimiser, file.minimiser);
        }

        let text = std::fs::read_to_string(test_dir.path().join("liver.counts")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], COUNTS_MAGIC);
        assert!(lines[1].starts_with("#bin\tliver\t15\t25\t"));
        assert!(lines[1].ends_with("\t119"));
        assert_eq!(&lines[2..], ["12\t4", "981\t1", "18446744073709551615\t7"]);
    }

    fn assert_malformed(test_dir: &TestDir, body: &str, expected_line: u64) {
        let path = test_dir.path().join("bad.counts");
        std::fs::write(&path, body).unwrap();
        match CountFile::open(&path) {
            Err(IbfError::CountFile { path: p, line, .. }) => {
                assert_eq!(p, path);
                assert_eq!(line, expected_line, "for {:?}", body);
            }
            other => panic!("expected a count file error for {:?}, got {:?}", body, other),
        }
    }

    #[test]
    fn test_malformed_count_files() {
        let test_dir = TestDir::new("counts_malformed").expect("Failed to create test dir");
        let header = "#ibfexpr-counts v1\n#bin\tliver\t15\t25\t0\t-\n";
        assert_malformed(&test_dir, "12\t4\n", 1);
        assert_malformed(&test_dir, "#ibfexpr-counts v1\n#bin\tliver\t15\n", 2);
        assert_malformed(&test_dir, "#ibfexpr-counts v1\n#bin\tliver\t40\t50\t0\t-\n", 2);
        assert_malformed(&test_dir, &format!("{}12\t4\nx\t1\n", header), 4);
        assert_malformed(&test_dir, &format!("{}12\t4\t9\n", header), 3);
        assert_malformed(&test_dir, &format!("{}12\t0\n", header), 3);
        assert_malformed(&test_dir, &format!("{}12\t-1\n", header), 3);
        assert_malformed(&test_dir, &format!("{}12\t4\n13\t1\n12\t2\n", header), 5);
    }

    #[test]
    fn test_unwritable_bin_name() {
        let test_dir = TestDir::new("counts_name").expect("Failed to create test dir");
        let file = CountFile::new(BinCounts::new("a\tb", FxHashMap::default()), MinimiserConfig::default());
        assert!(matches!(
            file.write(&test_dir.path().join("x.counts")),
            Err(IbfError::InvalidConfig(_))
        ));
    }

    struct ByteMinimisers;

    impl MinimiserSource for ByteMinimisers {
        fn minimisers(&self, sequence: &[u8]) -> Vec<u64> {
            sequence.iter().map(|&b| b as u64).collect()
        }
    }

    #[test]
    fn test_count_transcripts_takes_upper_median() {
        let bins = vec![
            BinCounts::new("liver", [(1, 2), (2, 8), (3, 5)].into_iter().collect()),
            BinCounts::new("brain", [(1, 6)].into_iter().collect()),
        ];
        let transcripts = vec![
            QueryTranscript::new("t1", vec![1u8, 2, 3]),
            QueryTranscript::new("t2", vec![1u8, 4]),
            QueryTranscript::new("none", ""),
        ];
        let table = count_transcripts(&transcripts, &bins, &ByteMinimisers);
        assert_eq!(table.bin_names, ["liver", "brain"]);
        assert_eq!(table.rows[0], vec![5.0, 0.0]);
        // counts [2, 0] and [6, 0]: the upper of two is taken
        assert_eq!(table.rows[1], vec![2.0, 6.0]);
        assert_eq!(table.rows[2], vec![0.0, 0.0]);
        assert_eq!(table.to_tsv(), "t1\t5\t0\t\nt2\t2\t6\t\nnone\t0\t0\t\n");
    }
}
