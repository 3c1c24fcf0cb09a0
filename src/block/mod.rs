/// block/mod.rs
use std::io::{self, Write};

use crate::error::{IbfError, Result};

/// Magic bytes opening every filter block.
pub const BLOCK_MAGIC: [u8; 4] = *b"IBFB";

/// Version of the filter block layout.
pub const BLOCK_VERSION: u16 = 1;

/// Size of the fixed little-endian header in bytes.
pub const HEADER_SIZE: usize = 4 + 2 + 1 + 1 + 4 + 8 + 8 + 8;

/// Storage layout of the serialized filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockLayout {
    Uncompressed = 0,
    Compressed = 1,
}

impl BlockLayout {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(BlockLayout::Uncompressed),
            1 => Some(BlockLayout::Compressed),
            _ => None,
        }
    }
}

/// The fixed header of a filter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub layout: BlockLayout,
    /// Number of hash functions
    pub hash_count: u8,
    /// Number of bins interleaved in the filter
    pub bin_count: u32,
    /// Bits per bin
    pub bin_size: u64,
    /// Size of the bincode payload before compression
    pub uncompressed_size: u64,
    /// Size of compressed data in bytes
    pub compressed_size: u64,
}

impl BlockHeader {
    /// Largest bincode payload a filter of this geometry can serialize to.
    /// The compressed layout stores at most every word plus its rank
    /// directory and presence bitmap, which stays below twice the words.
    pub fn max_payload_size(&self) -> Option<u64> {
        let words_per_row = (self.bin_count as u64).div_ceil(64);
        words_per_row
            .checked_mul(self.bin_size)?
            .checked_mul(16)?
            .checked_add(1024)
    }

    /// Reject sizes no filter of the recorded geometry could produce.
    pub fn check_sizes(&self) -> Result<()> {
        let max_payload = self.max_payload_size().ok_or_else(|| {
            IbfError::Corrupt(format!(
                "filter geometry of {} bins by {} bits overflows",
                self.bin_count, self.bin_size
            ))
        })?;
        if self.uncompressed_size > max_payload {
            return Err(IbfError::Corrupt(format!(
                "header records a {} byte payload, at most {} fit the geometry",
                self.uncompressed_size, max_payload
            )));
        }
        // zstd never expands its input by more than a small frame overhead
        let max_compressed = self
            .uncompressed_size
            .saturating_add(self.uncompressed_size >> 7)
            .saturating_add(1024);
        if self.compressed_size > max_compressed {
            return Err(IbfError::Corrupt(format!(
                "header records {} compressed bytes for a {} byte payload",
                self.compressed_size, self.uncompressed_size
            )));
        }
        Ok(())
    }
}

/// A serialized, zstd-compressed level filter, complete with metadata.
#[derive(Debug)]
pub struct FilterBlock {
    pub header: BlockHeader,
    /// The compressed data bytes
    pub data: Vec<u8>,
}

/// Configuration for block encoding
#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    /// zstd compression level
    pub level: i32,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self { level: 3 }
    }
}

/// Write a block to the given writer
pub(crate) fn write_block<W: Write>(writer: &mut W, block: &FilterBlock) -> io::Result<()> {
    // Write header fields in little-endian format
    let header = &block.header;
    writer.write_all(&BLOCK_MAGIC)?;
    writer.write_all(&BLOCK_VERSION.to_le_bytes())?;
    writer.write_all(&[header.layout as u8, header.hash_count])?;
    writer.write_all(&header.bin_count.to_le_bytes())?;
    writer.write_all(&header.bin_size.to_le_bytes())?;
    writer.write_all(&header.uncompressed_size.to_le_bytes())?;
    writer.write_all(&header.compressed_size.to_le_bytes())?;

    // Write compressed data
    writer.write_all(&block.data)?;

    Ok(())
}

pub mod reader;
pub mod writer;

pub use reader::BlockReader;
pub use writer::BlockWriter;
