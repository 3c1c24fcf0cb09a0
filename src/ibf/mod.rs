/// ibf/mod.rs
///
/// # Interleaved Bloom Filters
///
/// An interleaved Bloom filter (IBF) stores one Bloom filter per *bin* (a sample
/// or group of samples) in a single bit array. Every bin's filter has the same
/// length, `bin_size` bits, and uses the same `hash_count` hash functions, so a
/// k-mer hash maps to the same `hash_count` positions in every bin.
///
/// The interleaving stores the bits of all bins for one position next to each
/// other. Position `row` occupies `words_per_row = ceil(bin_count / 64)` words,
/// and bit `b` of that row belongs to bin `b`:
///
///   flat bit index = row * words_per_row * 64 + bin
///
/// A membership query then reads `hash_count` rows and ANDs them together. The
/// bits left set are the bins whose filter contains every position of the
/// hash, which answers the query for all bins at once.
///
/// Two layouts exist. [`InterleavedBloomFilter`] is the mutable, uncompressed
/// layout used while building. [`CompressedBloomFilter`] is an immutable copy
/// that only stores non-zero words and finds them with a rank directory; it
/// answers every query exactly as the filter it was built from.

mod compressed;

pub use compressed::{CompressedBloomFilter, RankDirectory, SparseWords};

use serde::{Deserialize, Serialize};

use crate::error::{IbfError, Result};

/// The largest supported number of hash functions.
pub const MAX_HASH_COUNT: usize = 5;

/// Odd multipliers, one per hash function.
const HASH_SEEDS: [u64; MAX_HASH_COUNT] = [
    13572355802537770549,
    13515982909373297953,
    9895832891002402697,
    4823957429573129489,
    7541587456783741821,
];

const FINAL_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// The shape of an interleaved Bloom filter, shared by both layouts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterGeometry {
    pub bin_count: usize,
    /// Length of each bin's Bloom filter in bits.
    pub bin_size: u64,
    pub hash_count: usize,
    pub words_per_row: usize,
}

impl FilterGeometry {
    pub fn new(bin_count: usize, bin_size: u64, hash_count: usize) -> Result<Self> {
        if bin_count == 0 {
            return Err(IbfError::InvalidConfig(
                "an interleaved Bloom filter needs at least one bin".to_string(),
            ));
        }
        if bin_size == 0 {
            return Err(IbfError::NonPositiveBinSize { level: 0 });
        }
        if hash_count == 0 || hash_count > MAX_HASH_COUNT {
            return Err(IbfError::InvalidHashCount(hash_count));
        }
        Ok(Self {
            bin_count,
            bin_size,
            hash_count,
            words_per_row: bin_count.div_ceil(64),
        })
    }

    /// Total number of 64-bit words in the bit array.
    pub fn total_words(&self) -> usize {
        self.bin_size as usize * self.words_per_row
    }

    /// Map a hash onto a row in `0..bin_size` for hash function `i`.
    #[inline]
    fn row(&self, hash: u64, i: usize) -> usize {
        let mut h = hash.wrapping_mul(HASH_SEEDS[i]);
        h ^= h >> 29;
        h = h.wrapping_mul(FINAL_MIX);
        // Multiply-shift maps h uniformly onto [0, bin_size) without a modulo.
        ((h as u128 * self.bin_size as u128) >> 64) as usize
    }

    /// The first word of each row the hash maps to.
    #[inline]
    fn row_offsets(&self, hash: u64) -> [usize; MAX_HASH_COUNT] {
        let mut offsets = [0usize; MAX_HASH_COUNT];
        for (i, offset) in offsets.iter_mut().take(self.hash_count).enumerate() {
            *offset = self.row(hash, i) * self.words_per_row;
        }
        offsets
    }

    fn check_bin(&self, bin: usize) -> Result<()> {
        if bin >= self.bin_count {
            return Err(IbfError::BinOutOfRange {
                bin,
                bin_count: self.bin_count,
            });
        }
        Ok(())
    }
}

/// Read access to the bins of an interleaved Bloom filter.
///
/// Implementors only provide their geometry and word access; the batched
/// membership queries are shared.
pub trait Membership {
    fn geometry(&self) -> &FilterGeometry;

    /// The 64-bit word at `index` of the interleaved bit array.
    fn word_at(&self, index: usize) -> u64;

    fn bin_count(&self) -> usize {
        self.geometry().bin_count
    }

    fn bin_size(&self) -> u64 {
        self.geometry().bin_size
    }

    fn hash_count(&self) -> usize {
        self.geometry().hash_count
    }

    /// Add one to `counts[bin]` for every bin that contains `hash`.
    ///
    /// `counts` must hold at least `bin_count` entries.
    #[inline]
    fn count_into(&self, hash: u64, counts: &mut [u32]) {
        let geometry = self.geometry();
        let offsets = geometry.row_offsets(hash);
        for w in 0..geometry.words_per_row {
            let mut hits = u64::MAX;
            for offset in offsets.iter().take(geometry.hash_count) {
                hits &= self.word_at(offset + w);
                if hits == 0 {
                    break;
                }
            }
            while hits != 0 {
                let bit = hits.trailing_zeros() as usize;
                counts[w * 64 + bit] += 1;
                hits &= hits - 1;
            }
        }
    }

    /// Test `hash` against every bin at once.
    fn bulk_contains(&self, hash: u64) -> Vec<bool> {
        let mut counts = vec![0u32; self.bin_count()];
        self.count_into(hash, &mut counts);
        counts.into_iter().map(|c| c > 0).collect()
    }

    /// Expected false positive rate of one bin once it holds `elements` hashes.
    fn expected_fpr(&self, elements: u64) -> f64 {
        fpr_for_bin_size(elements, self.hash_count(), self.bin_size())
    }

    /// Number of set bits in each bin's filter.
    fn occupancy(&self) -> Vec<u64> {
        let geometry = self.geometry();
        let mut set_bits = vec![0u64; geometry.bin_count];
        for row in 0..geometry.bin_size as usize {
            for w in 0..geometry.words_per_row {
                let mut word = self.word_at(row * geometry.words_per_row + w);
                while word != 0 {
                    let bit = word.trailing_zeros() as usize;
                    set_bits[w * 64 + bit] += 1;
                    word &= word - 1;
                }
            }
        }
        set_bits
    }
}

/// The mutable, uncompressed interleaved Bloom filter.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterleavedBloomFilter {
    geometry: FilterGeometry,
    data: Vec<u64>,
}

impl InterleavedBloomFilter {
    /// Create an empty filter with `bin_count` bins of `bin_size` bits.
    pub fn new(bin_count: usize, bin_size: u64, hash_count: usize) -> Result<Self> {
        let geometry = FilterGeometry::new(bin_count, bin_size, hash_count)?;
        Ok(Self {
            data: vec![0u64; geometry.total_words()],
            geometry,
        })
    }

    /// Set the `hash_count` bits of `hash` in the filter of `bin`.
    #[inline]
    pub fn insert(&mut self, hash: u64, bin: usize) -> Result<()> {
        self.geometry.check_bin(bin)?;
        let word = bin / 64;
        let mask = 1u64 << (bin % 64);
        let offsets = self.geometry.row_offsets(hash);
        for offset in offsets.iter().take(self.geometry.hash_count) {
            self.data[offset + word] |= mask;
        }
        Ok(())
    }

    /// Freeze into the rank-compressed, read-only layout.
    pub fn compress(&self) -> CompressedBloomFilter {
        CompressedBloomFilter::from_words(self.geometry, &self.data)
    }

    /// Check that the bit array matches the geometry, e.g. after deserialization.
    pub fn validate(&self) -> Result<()> {
        let check = FilterGeometry::new(
            self.geometry.bin_count,
            self.geometry.bin_size,
            self.geometry.hash_count,
        )?;
        if check != self.geometry || self.data.len() != self.geometry.total_words() {
            return Err(IbfError::Corrupt(format!(
                "filter holds {} words, expected {}",
                self.data.len(),
                self.geometry.total_words()
            )));
        }
        Ok(())
    }

    pub fn memory_bytes(&self) -> usize {
        self.data.len() * 8
    }
}

impl Membership for InterleavedBloomFilter {
    fn geometry(&self) -> &FilterGeometry {
        &self.geometry
    }

    #[inline]
    fn word_at(&self, index: usize) -> u64 {
        self.data[index]
    }
}

/// A filter as reloaded from a level file, in either layout.
#[derive(Clone, Debug, PartialEq)]
pub enum LevelFilter {
    Uncompressed(InterleavedBloomFilter),
    Compressed(CompressedBloomFilter),
}

impl LevelFilter {
    pub fn is_compressed(&self) -> bool {
        matches!(self, LevelFilter::Compressed(_))
    }

    /// Insert into an uncompressed filter; compressed filters are read-only.
    pub fn insert(&mut self, hash: u64, bin: usize) -> Result<()> {
        match self {
            LevelFilter::Uncompressed(ibf) => ibf.insert(hash, bin),
            LevelFilter::Compressed(_) => Err(IbfError::ImmutableFilter),
        }
    }

    pub fn memory_bytes(&self) -> usize {
        match self {
            LevelFilter::Uncompressed(ibf) => ibf.memory_bytes(),
            LevelFilter::Compressed(cibf) => cibf.memory_bytes(),
        }
    }
}

impl From<InterleavedBloomFilter> for LevelFilter {
    fn from(ibf: InterleavedBloomFilter) -> Self {
        LevelFilter::Uncompressed(ibf)
    }
}

impl From<CompressedBloomFilter> for LevelFilter {
    fn from(cibf: CompressedBloomFilter) -> Self {
        LevelFilter::Compressed(cibf)
    }
}

impl Membership for LevelFilter {
    fn geometry(&self) -> &FilterGeometry {
        match self {
            LevelFilter::Uncompressed(ibf) => ibf.geometry(),
            LevelFilter::Compressed(cibf) => cibf.geometry(),
        }
    }

    #[inline]
    fn word_at(&self, index: usize) -> u64 {
        match self {
            LevelFilter::Uncompressed(ibf) => ibf.word_at(index),
            LevelFilter::Compressed(cibf) => cibf.word_at(index),
        }
    }
}

/// Bits per bin needed to hold `elements` hashes at false positive rate `fpr`.
///
/// m = -(h * n) / ln(1 - fpr^(1/h))
pub fn bin_size_for_fpr(elements: u64, hash_count: usize, fpr: f64) -> Result<u64> {
    if !(fpr > 0.0 && fpr < 1.0) {
        return Err(IbfError::InvalidFpr(fpr));
    }
    if hash_count == 0 || hash_count > MAX_HASH_COUNT {
        return Err(IbfError::InvalidHashCount(hash_count));
    }
    let h = hash_count as f64;
    let n = elements.max(1) as f64;
    let bits = (-(h * n) / (1.0 - fpr.powf(1.0 / h)).ln()).ceil();
    Ok((bits as u64).max(1))
}

/// Expected false positive rate of a bin of `bin_size` bits holding `elements` hashes.
///
/// fpr = (1 - e^(-h * n / m))^h
pub fn fpr_for_bin_size(elements: u64, hash_count: usize, bin_size: u64) -> f64 {
    if bin_size == 0 {
        return 1.0;
    }
    let h = hash_count as f64;
    let exponent = -(h * elements as f64) / bin_size as f64;
    (1.0 - exponent.exp()).powf(h)
}
