// minimiser.rs
//
// Minimiser extraction.
//
// Index construction and queries both see a sequence only through its
// minimisers: the smallest k-mer hash in each window of consecutive k-mers.
// [`MinimiserSource`] is the seam; [`WindowMinimiser`] is the reference
// implementation, a monotonic-deque sliding minimum over canonical 2-bit
// encoded k-mers.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{IbfError, Result};

/// Produces the minimiser hashes of a sequence.
pub trait MinimiserSource: Sync {
    fn minimisers(&self, sequence: &[u8]) -> Vec<u64>;
}

/// Parameters of minimiser extraction, stored with an index so queries use
/// the same ones.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinimiserConfig {
    /// k-mer length, at most 32.
    pub k: usize,
    /// Window length in bases; each window holds `window - k + 1` k-mers.
    pub window: usize,
    /// Optional gapped shape over the k positions; a set bit keeps the
    /// position, bit 0 being the last base of the k-mer.
    pub mask: Option<u64>,
    /// XORed into every k-mer hash.
    pub seed: u64,
}

impl Default for MinimiserConfig {
    fn default() -> Self {
        Self {
            k: 20,
            window: 60,
            mask: None,
            seed: 0x8F3F_73B5_CF1C_9ADE,
        }
    }
}

impl MinimiserConfig {
    pub fn new(k: usize, window: usize) -> Self {
        Self {
            k,
            window,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_mask(mut self, mask: u64) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.k > 32 {
            return Err(IbfError::InvalidConfig(format!(
                "k-mer size must be between 1 and 32, found {}",
                self.k
            )));
        }
        if self.window < self.k {
            return Err(IbfError::InvalidConfig(format!(
                "window size {} is smaller than k-mer size {}",
                self.window, self.k
            )));
        }
        if let Some(mask) = self.mask {
            if mask == 0 || (self.k < 64 && mask >> self.k != 0) {
                return Err(IbfError::InvalidConfig(format!(
                    "shape {:#b} does not fit a k-mer of size {}",
                    mask, self.k
                )));
            }
        }
        Ok(())
    }
}

#[inline]
fn base_to_bits(base: u8) -> Option<u64> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

/// Sliding-window minimisers of canonical k-mers.
#[derive(Clone, Debug)]
pub struct WindowMinimiser {
    config: MinimiserConfig,
    kmer_mask: u64,
    shape_mask: u64,
}

impl WindowMinimiser {
    pub fn new(config: MinimiserConfig) -> Result<Self> {
        config.validate()?;
        let kmer_mask = if config.k == 32 {
            u64::MAX
        } else {
            (1u64 << (2 * config.k)) - 1
        };
        let shape_mask = match config.mask {
            None => kmer_mask,
            Some(mask) => (0..config.k)
                .filter(|i| mask >> i & 1 == 1)
                .fold(0u64, |acc, i| acc | (3u64 << (2 * i))),
        };
        Ok(Self {
            config,
            kmer_mask,
            shape_mask,
        })
    }

    pub fn config(&self) -> &MinimiserConfig {
        &self.config
    }
}

impl MinimiserSource for WindowMinimiser {
    fn minimisers(&self, sequence: &[u8]) -> Vec<u64> {
        let k = self.config.k;
        let kmers_per_window = self.config.window - k + 1;
        let rc_shift = 2 * (k as u64 - 1);

        let mut result = Vec::new();
        let mut deque: VecDeque<(usize, u64)> = VecDeque::with_capacity(kmers_per_window);
        let mut forward = 0u64;
        let mut reverse = 0u64;
        let mut valid = 0usize;
        // k-mers seen since the last ambiguous base
        let mut kmer_index = 0usize;
        let mut last_emitted: Option<usize> = None;

        for &base in sequence {
            let Some(bits) = base_to_bits(base) else {
                valid = 0;
                kmer_index = 0;
                deque.clear();
                last_emitted = None;
                continue;
            };

            forward = ((forward << 2) | bits) & self.kmer_mask;
            reverse = (reverse >> 2) | ((3 - bits) << rc_shift);
            valid += 1;
            if valid < k {
                continue;
            }

            let hash = (forward & self.shape_mask).min(reverse & self.shape_mask) ^ self.config.seed;
            let pos = kmer_index;
            kmer_index += 1;

            while let Some(&(p, _)) = deque.front() {
                if p + kmers_per_window <= pos {
                    deque.pop_front();
                } else {
                    break;
                }
            }
            while let Some(&(_, v)) = deque.back() {
                if v > hash {
                    deque.pop_back();
                } else {
                    break;
                }
            }
            deque.push_back((pos, hash));

            if pos + 1 >= kmers_per_window {
                if let Some(&(min_pos, min_hash)) = deque.front() {
                    if last_emitted != Some(min_pos) {
                        result.push(min_hash);
                        last_emitted = Some(min_pos);
                    }
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(k: usize, window: usize) -> WindowMinimiser {
        WindowMinimiser::new(MinimiserConfig::new(k, window).with_seed(0)).unwrap()
    }

    #[test]
    fn test_window_equal_to_k_yields_every_kmer() {
        let minimisers = source(4, 4).minimisers(b"ACGTTGCA");
        assert_eq!(minimisers.len(), 5);
    }

    #[test]
    fn test_reverse_complement_is_equivalent() {
        let m = source(5, 8);
        let forward = b"ACGGTACCATGCAGTTAGCA";
        let reverse: Vec<u8> = forward
            .iter()
            .rev()
            .map(|b| match b {
                b'A' => b'T',
                b'C' => b'G',
                b'G' => b'C',
                _ => b'A',
            })
            .collect();
        let mut a = m.minimisers(forward);
        let mut b = m.minimisers(&reverse);
        a.sort_unstable();
        a.dedup();
        b.sort_unstable();
        b.dedup();
        assert_eq!(a, b);
    }

    #[test]
    fn test_short_and_ambiguous_sequences() {
        let m = source(4, 6);
        assert!(m.minimisers(b"ACGTA").is_empty());
        // The N splits the sequence into two runs too short for a window.
        assert!(m.minimisers(b"ACGTANACGTA").is_empty());
        assert_eq!(m.minimisers(b"acgtac"), m.minimisers(b"ACGTAC"));
    }

    #[test]
    fn test_deterministic_and_seeded() {
        let seq = b"TTGACCGATCGGATCGATCGGCTAGCTAGGCTA";
        let a = source(6, 10);
        assert_eq!(a.minimisers(seq), a.minimisers(seq));
        let seeded =
            WindowMinimiser::new(MinimiserConfig::new(6, 10).with_seed(0xABCDEF)).unwrap();
        assert_ne!(a.minimisers(seq), seeded.minimisers(seq));
    }

    #[test]
    fn test_gapped_shape() {
        let gapped = WindowMinimiser::new(MinimiserConfig::new(4, 4).with_seed(0).with_mask(0b1011))
            .unwrap();
        // The masked position differs, so both k-mers hash alike.
        assert_eq!(gapped.minimisers(b"ACAA"), gapped.minimisers(b"AGAA"));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(WindowMinimiser::new(MinimiserConfig::new(0, 4)).is_err());
        assert!(WindowMinimiser::new(MinimiserConfig::new(33, 40)).is_err());
        assert!(WindowMinimiser::new(MinimiserConfig::new(8, 4)).is_err());
        assert!(WindowMinimiser::new(MinimiserConfig::new(4, 4).with_mask(0b10000)).is_err());
    }
}
