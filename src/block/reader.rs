/// block/reader.rs
use super::{BlockHeader, BlockLayout, FilterBlock, BLOCK_MAGIC, BLOCK_VERSION};
use crate::error::{IbfError, Result};
use crate::ibf::{CompressedBloomFilter, InterleavedBloomFilter, LevelFilter, Membership};
use std::io::Read;

pub struct BlockReader<R: Read> {
    /// The underlying reader
    reader: R,
}

impl<R: Read> BlockReader<R> {
    /// Create a new BlockReader
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read only the fixed header, leaving the reader at the payload.
    pub fn read_block_header(&mut self) -> Result<BlockHeader> {
        let mut magic = [0u8; 4];
        self.reader.read_exact(&mut magic)?;
        if magic != BLOCK_MAGIC {
            return Err(IbfError::Corrupt("not a filter block (bad magic)".to_string()));
        }

        let mut u16_buf = [0u8; 2];
        self.reader.read_exact(&mut u16_buf)?;
        let version = u16::from_le_bytes(u16_buf);
        if version != BLOCK_VERSION {
            return Err(IbfError::Corrupt(format!(
                "unsupported filter block version {}",
                version
            )));
        }

        // Read layout and hash count
        self.reader.read_exact(&mut u16_buf)?;
        let layout = BlockLayout::from_byte(u16_buf[0])
            .ok_or_else(|| IbfError::Corrupt(format!("unknown layout byte {}", u16_buf[0])))?;
        let hash_count = u16_buf[1];

        let mut u32_buf = [0u8; 4];
        self.reader.read_exact(&mut u32_buf)?;
        let bin_count = u32::from_le_bytes(u32_buf);

        let mut u64_buf = [0u8; 8];
        self.reader.read_exact(&mut u64_buf)?;
        let bin_size = u64::from_le_bytes(u64_buf);

        self.reader.read_exact(&mut u64_buf)?;
        let uncompressed_size = u64::from_le_bytes(u64_buf);

        self.reader.read_exact(&mut u64_buf)?;
        let compressed_size = u64::from_le_bytes(u64_buf);

        let header = BlockHeader {
            layout,
            hash_count,
            bin_count,
            bin_size,
            uncompressed_size,
            compressed_size,
        };
        header.check_sizes()?;
        Ok(header)
    }

    /// Read the compressed payload following `header`.
    pub fn read_payload(&mut self, header: BlockHeader) -> Result<FilterBlock> {
        // Grows with the bytes actually present, never with the header's claim
        let mut data = Vec::new();
        (&mut self.reader)
            .take(header.compressed_size)
            .read_to_end(&mut data)?;
        if (data.len() as u64) < header.compressed_size {
            return Err(IbfError::Corrupt(format!(
                "payload ends after {} of {} bytes",
                data.len(),
                header.compressed_size
            )));
        }
        Ok(FilterBlock { header, data })
    }

    /// Read a block header and its compressed payload from the current position.
    pub fn read_header(&mut self) -> Result<FilterBlock> {
        let header = self.read_block_header()?;
        self.read_payload(header)
    }

    /// Decompress and deserialize the filter stored in a block, checking it
    /// against the header.
    pub fn decode(&self, block: &FilterBlock) -> Result<LevelFilter> {
        let header = &block.header;
        let expected = usize::try_from(header.uncompressed_size).map_err(|_| {
            IbfError::Corrupt(format!("{} byte payload", header.uncompressed_size))
        })?;
        let mut decompressed = Vec::new();
        decompressed.try_reserve_exact(expected).map_err(|e| {
            IbfError::Corrupt(format!("cannot hold a {} byte payload: {}", expected, e))
        })?;
        // One extra byte exposes payloads longer than recorded
        zstd::stream::read::Decoder::new(block.data.as_slice())?
            .take(header.uncompressed_size + 1)
            .read_to_end(&mut decompressed)?;
        if decompressed.len() != expected {
            return Err(IbfError::Corrupt(format!(
                "payload decompressed to {} bytes, header records {}",
                decompressed.len(),
                header.uncompressed_size
            )));
        }

        let filter = match header.layout {
            BlockLayout::Uncompressed => {
                let ibf: InterleavedBloomFilter = bincode::deserialize(&decompressed)?;
                ibf.validate()?;
                LevelFilter::Uncompressed(ibf)
            }
            BlockLayout::Compressed => {
                let cibf: CompressedBloomFilter = bincode::deserialize(&decompressed)?;
                cibf.validate()?;
                LevelFilter::Compressed(cibf)
            }
        };

        if filter.bin_count() != header.bin_count as usize
            || filter.bin_size() != header.bin_size
            || filter.hash_count() != header.hash_count as usize
        {
            return Err(IbfError::Corrupt(
                "filter geometry does not match its block header".to_string(),
            ));
        }
        Ok(filter)
    }

    /// Read the next block and return its filter.
    pub fn read_filter(&mut self) -> Result<LevelFilter> {
        let block = self.read_header()?;
        self.decode(&block)
    }
}

#[cfg(test)]
mod tests {
    use crate::block::{write_block, BlockConfig, BlockWriter, HEADER_SIZE};

    use super::*;
    use std::io::Cursor;

    fn make_test_filter() -> InterleavedBloomFilter {
        let mut ibf = InterleavedBloomFilter::new(3, 2048, 2).unwrap();
        for hash in 0..50u64 {
            ibf.insert(hash * 7919, (hash % 3) as usize).unwrap();
        }
        ibf
    }

    fn encode_to_bytes(filter: &LevelFilter) -> Vec<u8> {
        let block = BlockWriter::new(BlockConfig::default())
            .encode(filter)
            .unwrap();
        let mut buffer = Vec::new();
        write_block(&mut buffer, &block).unwrap();
        buffer
    }

    #[test]
    fn test_block_round_trip() {
        let ibf = make_test_filter();
        for filter in [
            LevelFilter::from(ibf.clone()),
            LevelFilter::from(ibf.compress()),
        ] {
            let buffer = encode_to_bytes(&filter);
            let mut reader = BlockReader::new(Cursor::new(buffer));
            let restored = reader.read_filter().unwrap();
            assert_eq!(restored, filter);
            for hash in 0..50u64 {
                assert_eq!(
                    restored.bulk_contains(hash * 7919),
                    ibf.bulk_contains(hash * 7919)
                );
            }
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut buffer = encode_to_bytes(&LevelFilter::from(make_test_filter()));
        buffer[0] = b'X';
        let mut reader = BlockReader::new(Cursor::new(buffer));
        assert!(matches!(reader.read_header(), Err(IbfError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_block() {
        let mut buffer = encode_to_bytes(&LevelFilter::from(make_test_filter()));
        buffer.truncate(HEADER_SIZE + 3);
        let mut reader = BlockReader::new(Cursor::new(buffer));
        assert!(matches!(reader.read_filter(), Err(IbfError::Corrupt(_))));

        // Cut inside the header itself.
        let mut buffer = encode_to_bytes(&LevelFilter::from(make_test_filter()));
        buffer.truncate(HEADER_SIZE - 4);
        let mut reader = BlockReader::new(Cursor::new(buffer));
        assert!(matches!(reader.read_filter(), Err(IbfError::IOError(_))));
    }

    #[test]
    fn test_oversized_header_sizes() {
        // compressed_size is the last header field, uncompressed_size before it
        for range in [28..36, 20..28] {
            let mut buffer = encode_to_bytes(&LevelFilter::from(make_test_filter()));
            buffer[range].copy_from_slice(&u64::MAX.to_le_bytes());
            let mut reader = BlockReader::new(Cursor::new(buffer));
            assert!(matches!(reader.read_filter(), Err(IbfError::Corrupt(_))));
        }

        // A huge geometry passes the size checks but not the payload read.
        let mut buffer = encode_to_bytes(&LevelFilter::from(make_test_filter()));
        buffer[12..20].copy_from_slice(&(1u64 << 40).to_le_bytes());
        buffer[28..36].copy_from_slice(&(1u64 << 30).to_le_bytes());
        buffer[20..28].copy_from_slice(&(1u64 << 30).to_le_bytes());
        let mut reader = BlockReader::new(Cursor::new(buffer));
        assert!(matches!(reader.read_filter(), Err(IbfError::Corrupt(_))));
    }

    #[test]
    fn test_payload_longer_than_recorded() {
        let mut buffer = encode_to_bytes(&LevelFilter::from(make_test_filter()));
        let recorded = u64::from_le_bytes(buffer[20..28].try_into().unwrap());
        buffer[20..28].copy_from_slice(&(recorded - 8).to_le_bytes());
        let mut reader = BlockReader::new(Cursor::new(buffer));
        assert!(matches!(reader.read_filter(), Err(IbfError::Corrupt(_))));
    }

    #[test]
    fn test_header_mismatch() {
        let mut buffer = encode_to_bytes(&LevelFilter::from(make_test_filter()));
        // bin_count follows magic, version, layout and hash count
        buffer[8..12].copy_from_slice(&4u32.to_le_bytes());
        let mut reader = BlockReader::new(Cursor::new(buffer));
        assert!(matches!(reader.read_filter(), Err(IbfError::Corrupt(_))));
    }
}
