/// block/writer.rs
use super::{BlockConfig, BlockHeader, BlockLayout, FilterBlock};
use crate::ibf::{LevelFilter, Membership};
use std::io;

/// Encoder turning level filters into compressed blocks.
#[derive(Debug, Default)]
pub struct BlockWriter {
    config: BlockConfig,
}

impl BlockWriter {
    /// Create a new [`BlockWriter`].
    pub fn new(config: BlockConfig) -> Self {
        Self { config }
    }

    /// Serialize the filter to binary and compress it.
    pub fn encode(&self, filter: &LevelFilter) -> io::Result<FilterBlock> {
        let (layout, payload) = match filter {
            LevelFilter::Uncompressed(ibf) => (BlockLayout::Uncompressed, bincode::serialize(ibf)),
            LevelFilter::Compressed(cibf) => (BlockLayout::Compressed, bincode::serialize(cibf)),
        };
        let payload = payload.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        // Compress into a new Vec
        let mut compressed_data = Vec::new();
        zstd::stream::copy_encode(payload.as_slice(), &mut compressed_data, self.config.level)?;

        Ok(FilterBlock {
            header: BlockHeader {
                layout,
                hash_count: filter.hash_count() as u8,
                bin_count: filter.bin_count() as u32,
                bin_size: filter.bin_size(),
                uncompressed_size: payload.len() as u64,
                compressed_size: compressed_data.len() as u64,
            },
            data: compressed_data,
        })
    }
}
