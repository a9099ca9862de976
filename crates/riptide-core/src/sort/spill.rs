//! Spilled sorted runs.
//!
//! A spilled run is a sequence of `[key_len][key][value_len][value]` records
//! written in sorted order. Writes go through an in-memory buffer and are
//! flushed in configured chunk sizes; readers stream records back through a
//! buffered reader. Run files are removed when the run is dropped.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::Codec;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A finished spilled run on disk. The file is deleted on drop.
#[derive(Debug)]
pub(crate) struct SpillRun {
    path: PathBuf,
}

impl SpillRun {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpillRun {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Writes one sorted run, flushing in `chunk_size` chunks.
pub(crate) struct SpillWriter {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
    chunk_size: usize,
    codec: Codec,
}

impl SpillWriter {
    pub(crate) fn create(
        dir: &Path,
        buffer_size: usize,
        chunk_size: usize,
        codec: Codec,
    ) -> io::Result<Self> {
        let n = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("riptide-spill-{}-{n}.run", std::process::id()));
        let file = File::create(&path)?;
        Ok(Self {
            file,
            path,
            buf: Vec::with_capacity(buffer_size.max(chunk_size)),
            chunk_size: chunk_size.max(1),
            codec,
        })
    }

    pub(crate) fn write_record(&mut self, key: &[u8], value: &[u8]) -> io::Result<()> {
        let mut word = [0u8; 4];
        #[allow(clippy::cast_possible_truncation)]
        self.codec.write_u32(&mut word, key.len() as u32);
        self.buf.extend_from_slice(&word);
        self.buf.extend_from_slice(key);
        #[allow(clippy::cast_possible_truncation)]
        self.codec.write_u32(&mut word, value.len() as u32);
        self.buf.extend_from_slice(&word);
        self.buf.extend_from_slice(value);

        if self.buf.len() >= self.chunk_size {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> io::Result<()> {
        self.file.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    pub(crate) fn finish(mut self) -> io::Result<SpillRun> {
        self.flush_chunk()?;
        self.file.flush()?;
        Ok(SpillRun { path: self.path })
    }
}

/// Streams records back out of a spilled run.
pub(crate) struct SpillRunReader {
    reader: BufReader<File>,
    codec: Codec,
    key: Vec<u8>,
    value: Vec<u8>,
    exhausted: bool,
}

impl SpillRunReader {
    /// Opens a run and positions the reader on its first record.
    pub(crate) fn open(run: &SpillRun, buffer_size: usize, codec: Codec) -> io::Result<Self> {
        let file = File::open(run.path())?;
        let mut reader = Self {
            reader: BufReader::with_capacity(buffer_size.max(4096), file),
            codec,
            key: Vec::new(),
            value: Vec::new(),
            exhausted: false,
        };
        reader.advance()?;
        Ok(reader)
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn value(&self) -> &[u8] {
        &self.value
    }

    /// Reads the next record; returns `false` at end of run.
    pub(crate) fn advance(&mut self) -> io::Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        let mut word = [0u8; 4];
        match self.reader.read_exact(&mut word) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.exhausted = true;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        let key_len = self.codec.read_u32(&word) as usize;
        self.key.resize(key_len, 0);
        self.reader.read_exact(&mut self.key)?;

        self.reader.read_exact(&mut word)?;
        let value_len = self.codec.read_u32(&word) as usize;
        self.value.resize(value_len, 0);
        self.reader.read_exact(&mut self.value)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip_and_cleanup() {
        let codec = Codec::new(false);
        let dir = std::env::temp_dir();
        let mut writer = SpillWriter::create(&dir, 128, 32, codec).unwrap();
        for i in 0..100u32 {
            writer
                .write_record(format!("k{i:03}").as_bytes(), &i.to_le_bytes())
                .unwrap();
        }
        let run = writer.finish().unwrap();
        let path = run.path().to_path_buf();
        assert!(path.exists());

        let mut reader = SpillRunReader::open(&run, 64, codec).unwrap();
        let mut count = 0u32;
        while !reader.is_exhausted() {
            assert_eq!(reader.key(), format!("k{count:03}").as_bytes());
            assert_eq!(reader.value(), count.to_le_bytes());
            count += 1;
            reader.advance().unwrap();
        }
        assert_eq!(count, 100);

        drop(reader);
        drop(run);
        assert!(!path.exists(), "run file must be removed on drop");
    }

    #[test]
    fn empty_run_reads_as_exhausted() {
        let codec = Codec::new(true);
        let writer = SpillWriter::create(&std::env::temp_dir(), 64, 16, codec).unwrap();
        let run = writer.finish().unwrap();
        let reader = SpillRunReader::open(&run, 64, codec).unwrap();
        assert!(reader.is_exhausted());
    }
}
