// levels/calibration.rs
//
// The calibration matrix of samplewise indexes: the expression value every bin
// reaches at every level, `values[level][bin]`. Level 0 holds each bin's
// baseline.
//
// Written in a versioned text format:
//
//   #ibfexpr-levels v1
//   #levels=3 bins=2
//   1<TAB>2
//   4<TAB>6
//   9<TAB>20
//
// Files without the version line are read as the legacy layout: values
// separated by spaces, one level per line, where a `/` also ends a level
// record (the last record is often closed by `/` instead of a newline).

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{IbfError, Result};
use crate::io::InputStream;

pub const CALIBRATION_MAGIC: &str = "#ibfexpr-levels v1";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Calibration {
    values: Vec<Vec<u32>>,
}

impl Calibration {
    /// Build from rows indexed `[level][bin]`.
    pub fn new(values: Vec<Vec<u32>>) -> Self {
        Self { values }
    }

    /// Build from per-bin threshold lists, indexed `[bin][level]`.
    pub fn from_bin_thresholds(per_bin: &[Vec<u32>]) -> Self {
        let levels = per_bin.first().map_or(0, |t| t.len());
        let values = (0..levels)
            .map(|level| per_bin.iter().map(|t| t[level]).collect())
            .collect();
        Self { values }
    }

    pub fn level_count(&self) -> usize {
        self.values.len()
    }

    pub fn bin_count(&self) -> usize {
        self.values.first().map_or(0, |row| row.len())
    }

    /// Expression value of `bin` at `level`.
    #[inline]
    pub fn value(&self, level: usize, bin: usize) -> u32 {
        self.values[level][bin]
    }

    /// The level-0 value of `bin`, used to normalize estimates.
    #[inline]
    pub fn baseline(&self, bin: usize) -> u32 {
        self.values[0][bin]
    }

    pub fn row(&self, level: usize) -> &[u32] {
        &self.values[level]
    }

    /// Ensure the matrix covers `levels` levels of `bins` bins. Surplus
    /// levels are dropped.
    pub fn check_shape(&mut self, levels: usize, bins: usize) -> Result<()> {
        if self.values.len() < levels {
            return Err(IbfError::CalibrationRows {
                expected: levels,
                found: self.values.len(),
            });
        }
        if self.values.len() > levels {
            warn!(
                "Calibration holds {} levels, using the first {}",
                self.values.len(),
                levels
            );
            self.values.truncate(levels);
        }
        for (level, row) in self.values.iter().enumerate() {
            if row.len() != bins {
                return Err(IbfError::CalibrationColumns {
                    level,
                    expected: bins,
                    found: row.len(),
                });
            }
        }
        Ok(())
    }

    /// Render in the versioned text format.
    pub fn to_text(&self) -> String {
        let mut text = format!(
            "{}\n#levels={} bins={}\n",
            CALIBRATION_MAGIC,
            self.level_count(),
            self.bin_count()
        );
        for row in &self.values {
            let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            text.push_str(&line.join("\t"));
            text.push('\n');
        }
        text
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(self.to_text().as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read a calibration file, possibly gzipped, in either format.
    pub fn open(path: &Path) -> Result<Self> {
        let mut text = String::new();
        InputStream::new(path).reader()?.read_to_string(&mut text)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.starts_with(CALIBRATION_MAGIC) {
            Self::parse_versioned(text)
        } else {
            debug!("Calibration has no version line, reading legacy layout");
            Self::parse_legacy(text)
        }
    }

    fn parse_versioned(text: &str) -> Result<Self> {
        let declared = text
            .lines()
            .find_map(|line| line.strip_prefix("#levels="))
            .map(parse_shape_line)
            .transpose()?;

        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .comment(Some(b'#'))
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut values = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row = record
                .iter()
                .map(|field| field.trim().parse::<u32>())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            values.push(row);
        }

        let calibration = Self { values };
        if let Some((levels, bins)) = declared {
            if calibration.level_count() != levels {
                return Err(IbfError::CalibrationRows {
                    expected: levels,
                    found: calibration.level_count(),
                });
            }
            if let Some((level, row)) = calibration
                .values
                .iter()
                .enumerate()
                .find(|(_, row)| row.len() != bins)
            {
                return Err(IbfError::CalibrationColumns {
                    level,
                    expected: bins,
                    found: row.len(),
                });
            }
        }
        Ok(calibration)
    }

    fn parse_legacy(text: &str) -> Result<Self> {
        let mut values = Vec::new();
        for record in text.split(|c: char| c == '\n' || c == '/') {
            let row = record
                .split_whitespace()
                .map(|field| field.parse::<u32>())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if !row.is_empty() {
                values.push(row);
            }
        }
        Ok(Self { values })
    }
}

/// Parse the `3 bins=2` remainder of a `#levels=3 bins=2` line.
fn parse_shape_line(rest: &str) -> Result<(usize, usize)> {
    let (levels, bins) = rest
        .split_once(" bins=")
        .ok_or_else(|| IbfError::Corrupt(format!("bad calibration shape line: {}", rest)))?;
    Ok((levels.trim().parse()?, bins.trim().parse()?))
}
