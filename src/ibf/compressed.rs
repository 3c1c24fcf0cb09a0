// ibf/compressed.rs
//
// Rank-compressed storage for read-only interleaved Bloom filters.
//
// Most words of a sparsely loaded filter are zero. [`SparseWords`] keeps only
// the non-zero words, densely packed, plus a presence bitmap with one bit per
// original word. A word is found by ranking its presence bit:
//
// `word(w) = values[rank(w)]` if presence bit `w` is set, otherwise `0`.
//
// # Rank directory
//
// - **L1**: absolute rank every 128 presence words (8192 bits), `u64`.
// - **L2**: rank relative to the enclosing superblock every 8 words, `u16`.
//
// `rank(w)` = `l1[w / 8192] + l2[w / 512]` plus the popcount of at most 8
// presence words.

use serde::{Deserialize, Serialize};

use super::{FilterGeometry, Membership};
use crate::error::{IbfError, Result};

/// Presence words per L1 superblock.
const L1_WORDS: usize = 128;

/// Presence words per L2 block.
const L2_WORDS: usize = 8;

/// Two-level cumulative popcount over a bitmap.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankDirectory {
    l1: Vec<u64>,
    l2: Vec<u16>,
    total: u64,
}

impl RankDirectory {
    /// Build the directory for `words`.
    pub fn build(words: &[u64]) -> Self {
        let mut l1 = Vec::with_capacity(words.len().div_ceil(L1_WORDS));
        let mut l2 = Vec::with_capacity(words.len().div_ceil(L2_WORDS));
        let mut absolute: u64 = 0;

        for superblock in words.chunks(L1_WORDS) {
            l1.push(absolute);
            let mut relative: u16 = 0;
            for block in superblock.chunks(L2_WORDS) {
                l2.push(relative);
                for &word in block {
                    let ones = word.count_ones();
                    relative += ones as u16;
                    absolute += u64::from(ones);
                }
            }
        }

        Self {
            l1,
            l2,
            total: absolute,
        }
    }

    /// Number of set bits in `words` before bit position `bit`.
    ///
    /// `words` must be the bitmap the directory was built from.
    #[inline]
    pub fn rank(&self, words: &[u64], bit: usize) -> u64 {
        let word_idx = bit / 64;
        if word_idx >= words.len() {
            return self.total;
        }
        let block_start = word_idx - word_idx % L2_WORDS;
        let mut rank = self.l1[word_idx / L1_WORDS] + u64::from(self.l2[word_idx / L2_WORDS]);
        for &word in &words[block_start..word_idx] {
            rank += u64::from(word.count_ones());
        }
        let partial = words[word_idx] & ((1u64 << (bit % 64)) - 1);
        rank + u64::from(partial.count_ones())
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// The non-zero words of a bit array, addressable by their original index.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SparseWords {
    len: usize,
    presence: Vec<u64>,
    rank: RankDirectory,
    values: Vec<u64>,
}

impl SparseWords {
    pub fn from_words(words: &[u64]) -> Self {
        let mut presence = vec![0u64; words.len().div_ceil(64)];
        let mut values = Vec::new();
        for (i, &word) in words.iter().enumerate() {
            if word != 0 {
                presence[i / 64] |= 1u64 << (i % 64);
                values.push(word);
            }
        }
        let rank = RankDirectory::build(&presence);
        Self {
            len: words.len(),
            presence,
            rank,
            values,
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> u64 {
        if index >= self.len {
            return 0;
        }
        if self.presence[index / 64] & (1u64 << (index % 64)) == 0 {
            return 0;
        }
        self.values[self.rank.rank(&self.presence, index) as usize]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of non-zero words stored.
    pub fn stored(&self) -> usize {
        self.values.len()
    }

    pub fn memory_bytes(&self) -> usize {
        (self.presence.len() + self.values.len() + self.rank.l1.len()) * 8 + self.rank.l2.len() * 2
    }

    fn validate(&self) -> Result<()> {
        if self.presence.len() != self.len.div_ceil(64) {
            return Err(IbfError::Corrupt(
                "presence bitmap does not match word count".to_string(),
            ));
        }
        if self.rank != RankDirectory::build(&self.presence) {
            return Err(IbfError::Corrupt("rank directory is inconsistent".to_string()));
        }
        if self.rank.total() != self.values.len() as u64 {
            return Err(IbfError::Corrupt(format!(
                "{} words marked present but {} stored",
                self.rank.total(),
                self.values.len()
            )));
        }
        Ok(())
    }
}

/// Immutable interleaved Bloom filter over rank-compressed storage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompressedBloomFilter {
    geometry: FilterGeometry,
    words: SparseWords,
}

impl CompressedBloomFilter {
    pub(crate) fn from_words(geometry: FilterGeometry, data: &[u64]) -> Self {
        Self {
            geometry,
            words: SparseWords::from_words(data),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.words.len() != self.geometry.total_words() {
            return Err(IbfError::Corrupt(format!(
                "compressed filter covers {} words, expected {}",
                self.words.len(),
                self.geometry.total_words()
            )));
        }
        self.words.validate()
    }

    pub fn memory_bytes(&self) -> usize {
        self.words.memory_bytes()
    }
}

impl Membership for CompressedBloomFilter {
    fn geometry(&self) -> &FilterGeometry {
        &self.geometry
    }

    #[inline]
    fn word_at(&self, index: usize) -> u64 {
        self.words.get(index)
    }
}
