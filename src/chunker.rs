//! Line-preserving file splitter.
//!
//! The input is read line by line and written into chunk files of at most
//! `chunk_size_mb` MiB of uncompressed text each. A line is never split: a
//! chunk is closed as soon as the next line would not fit. Chunks are created
//! lazily, so an empty input yields no chunk at all.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// One chunk file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 0-based position; also the remote chunk slot.
    pub sequence_index: usize,
    pub local_path: PathBuf,
    /// Uncompressed payload size.
    pub byte_size: u64,
    pub compressed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write chunk {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
}

enum ChunkWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl ChunkWriter {
    fn create(path: &Path, compress: bool) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(if compress {
            ChunkWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            ChunkWriter::Plain(file)
        })
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            ChunkWriter::Plain(w) => w.write_all(buf),
            ChunkWriter::Gzip(w) => w.write_all(buf),
        }
    }

    fn finish(self) -> io::Result<()> {
        let mut inner = match self {
            ChunkWriter::Plain(w) => w,
            ChunkWriter::Gzip(w) => w.finish()?,
        };
        inner.flush()
    }
}

struct OpenChunk {
    descriptor: ChunkDescriptor,
    writer: ChunkWriter,
}

/// Splits files into chunk files.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_bytes: u64,
    compress: bool,
    output_dir: Option<PathBuf>,
}

impl Chunker {
    pub fn new(chunk_size_mb: u64, compress: bool) -> Self {
        Self {
            max_bytes: chunk_size_mb.saturating_mul(BYTES_PER_MB),
            compress,
            output_dir: None,
        }
    }

    /// Override the limit with an exact byte count.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Write chunks into `dir` instead of next to the input file.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Path of chunk `index` for `input`: `{stem}_chunk_{NNN}{ext}[.gz]`,
    /// numbered from 001.
    pub fn chunk_path(&self, input: &Path, index: usize) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = input
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let gz = if self.compress { ".gz" } else { "" };
        let dir = match &self.output_dir {
            Some(d) => d.clone(),
            None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        let number = index + 1;
        dir.join(format!("{stem}_chunk_{number:03}{ext}{gz}"))
    }

    fn open_chunk(&self, input: &Path, index: usize) -> Result<OpenChunk, ChunkError> {
        let path = self.chunk_path(input, index);
        let writer = ChunkWriter::create(&path, self.compress).map_err(|source| ChunkError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(OpenChunk {
            descriptor: ChunkDescriptor {
                sequence_index: index,
                local_path: path,
                byte_size: 0,
                compressed: self.compress,
            },
            writer,
        })
    }

    fn close_chunk(chunk: OpenChunk, out: &mut Vec<ChunkDescriptor>) -> Result<(), ChunkError> {
        let OpenChunk { descriptor, writer } = chunk;
        writer.finish().map_err(|source| ChunkError::Write {
            path: descriptor.local_path.clone(),
            source,
        })?;
        tracing::info!(path = %descriptor.local_path.display(), bytes = descriptor.byte_size, "chunk written");
        out.push(descriptor);
        Ok(())
    }

    /// Split `input` into chunk files and return their descriptors in order.
    pub fn split(&self, input: &Path) -> Result<Vec<ChunkDescriptor>, ChunkError> {
        if self.max_bytes == 0 {
            return Err(ChunkError::ZeroChunkSize);
        }
        let read_err = |source| ChunkError::Read {
            path: input.to_path_buf(),
            source,
        };
        let mut reader = BufReader::new(File::open(input).map_err(read_err)?);

        let mut chunks = Vec::new();
        let mut current: Option<OpenChunk> = None;
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).map_err(read_err)? == 0 {
                break;
            }
            let line_size = line.len() as u64;

            // Roll over when the line does not fit; an oversized line still
            // goes into an empty chunk of its own.
            let mut open = match current.take() {
                Some(open) if open.descriptor.byte_size + line_size > self.max_bytes => {
                    Self::close_chunk(open, &mut chunks)?;
                    self.open_chunk(input, chunks.len())?
                }
                Some(open) => open,
                None => self.open_chunk(input, chunks.len())?,
            };
            if line_size > self.max_bytes {
                tracing::warn!(bytes = line_size, limit = self.max_bytes, "single line exceeds chunk size");
            }

            open.writer
                .write_all(line.as_bytes())
                .map_err(|source| ChunkError::Write {
                    path: open.descriptor.local_path.clone(),
                    source,
                })?;
            open.descriptor.byte_size += line_size;
            current = Some(open);
        }

        if let Some(last) = current.take() {
            Self::close_chunk(last, &mut chunks)?;
        }
        Ok(chunks)
    }
}

/// Split `file_path` next to itself into `chunk_size_mb` MiB chunks.
pub fn split(file_path: &Path, chunk_size_mb: u64, compress: bool) -> Result<Vec<ChunkDescriptor>, ChunkError> {
    Chunker::new(chunk_size_mb, compress).split(file_path)
}
