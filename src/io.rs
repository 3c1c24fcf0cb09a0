// io.rs

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Stdout, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

pub struct InputStream {
    filepath: PathBuf,
}

impl InputStream {
    pub fn new(filepath: &Path) -> Self {
        Self {
            filepath: filepath.into(),
        }
    }

    fn is_gzipped(file: &mut File) -> Result<bool> {
        let mut header = [0u8; 2];
        // Files shorter than the magic cannot be gzipped
        let read = file.read(&mut header)?;
        // Reset the file pointer
        file.rewind()?;
        Ok(read == 2 && header == GZIP_MAGIC)
    }

    pub fn reader(&self) -> Result<BufReader<Box<dyn Read>>> {
        let mut file = File::open(&self.filepath)?;
        let reader: Box<dyn Read> = if Self::is_gzipped(&mut file)? {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(BufReader::with_capacity(DEFAULT_BUFFER_SIZE, reader))
    }
}

/// Destination of a table: stdout, a file, or a gzipped file when the path
/// ends in `.gz`.
pub struct OutputStream {
    filepath: Option<PathBuf>,
}

impl OutputStream {
    pub fn new(filepath: Option<impl AsRef<Path>>) -> Self {
        Self {
            filepath: filepath.map(|p| p.as_ref().to_path_buf()),
        }
    }

    fn should_compress(&self) -> bool {
        self.filepath
            .as_ref()
            .is_some_and(|p| p.extension().is_some_and(|ext| ext == "gz"))
    }

    pub fn writer(&self) -> io::Result<OutputWriter> {
        match &self.filepath {
            Some(path) => {
                let file = File::create(path)?;
                Ok(if self.should_compress() {
                    OutputWriter::Gzip(BufWriter::with_capacity(
                        DEFAULT_BUFFER_SIZE,
                        GzEncoder::new(file, Compression::default()),
                    ))
                } else {
                    OutputWriter::File(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, file))
                })
            }
            None => Ok(OutputWriter::Stdout(BufWriter::with_capacity(
                DEFAULT_BUFFER_SIZE,
                io::stdout(),
            ))),
        }
    }
}

/// Writer returned by [`OutputStream::writer`]. Call [`OutputWriter::finish`]
/// once done; dropping it instead loses errors raised while flushing or
/// writing the gzip trailer.
pub enum OutputWriter {
    File(BufWriter<File>),
    Gzip(BufWriter<GzEncoder<File>>),
    Stdout(BufWriter<Stdout>),
}

impl OutputWriter {
    /// Flush all buffered output and complete the gzip stream.
    pub fn finish(self) -> io::Result<()> {
        match self {
            OutputWriter::File(mut writer) => writer.flush(),
            OutputWriter::Gzip(writer) => {
                let encoder = writer.into_inner().map_err(|e| e.into_error())?;
                let mut file = encoder.finish()?;
                file.flush()
            }
            OutputWriter::Stdout(mut writer) => writer.flush(),
        }
    }
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputWriter::File(writer) => writer.write(buf),
            OutputWriter::Gzip(writer) => writer.write(buf),
            OutputWriter::Stdout(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputWriter::File(writer) => writer.flush(),
            OutputWriter::Gzip(writer) => writer.flush(),
            OutputWriter::Stdout(writer) => writer.flush(),
        }
    }
}
