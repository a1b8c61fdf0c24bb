use std::fs::{self, File};
use std::path::{Path, PathBuf};

use csv::Writer;
use log::{debug, error};

use crate::dataset::DatasetKind;
use crate::error::StageError;
use crate::row::Row;

/// Glob matched by aggregation when collecting extraction output.
pub const CHUNK_FILE_PATTERN: &str = "data-*.csv";

/// `data-<worker>-<seq>.csv`. Zero-padded so name order equals write order
/// within one worker.
pub fn chunk_file_name(worker: usize, seq: usize) -> String {
    format!("data-{:03}-{:06}.csv", worker, seq)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub files_written: usize,
    pub rows_written: u64,
}

/// Chunked CSV sink owned by a single worker. A new file is opened lazily on
/// the first row after a rotation, so no header-only files are produced.
pub struct ChunkWriter {
    out_dir: PathBuf,
    kind: DatasetKind,
    worker: usize,
    chunk_size: usize,
    seq: usize,
    rows_in_chunk: usize,
    current: Option<(PathBuf, Writer<File>)>,
    stats: ChunkStats,
}

impl ChunkWriter {
    pub fn new(out_dir: impl AsRef<Path>, kind: DatasetKind, worker: usize, chunk_size: usize) -> Self {
        Self {
            out_dir: out_dir.as_ref().to_path_buf(),
            kind,
            worker,
            chunk_size: chunk_size.max(1),
            seq: 0,
            rows_in_chunk: 0,
            current: None,
            stats: ChunkStats::default(),
        }
    }

    fn open_next(&mut self) -> Result<(), StageError> {
        fs::create_dir_all(&self.out_dir).map_err(|e| StageError::io(&self.out_dir, e))?;
        let path = self.out_dir.join(chunk_file_name(self.worker, self.seq));
        let file = File::create(&path).map_err(|e| StageError::io(&path, e))?;
        let mut writer = Writer::from_writer(file);
        writer
            .write_record(self.kind.header())
            .map_err(|e| StageError::csv(&path, e))?;
        debug!("Worker {} opened chunk {}", self.worker, path.display());
        self.seq += 1;
        self.rows_in_chunk = 0;
        self.stats.files_written += 1;
        self.current = Some((path, writer));
        Ok(())
    }

    fn close_current(&mut self) -> Result<(), StageError> {
        if let Some((path, mut writer)) = self.current.take() {
            writer.flush().map_err(|e| StageError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn write(&mut self, row: &Row) -> Result<(), StageError> {
        if self.rows_in_chunk >= self.chunk_size {
            self.close_current()?;
        }
        if self.current.is_none() {
            self.open_next()?;
        }
        if let Some((path, writer)) = self.current.as_mut() {
            writer
                .write_record(row.to_record())
                .map_err(|e| StageError::csv(path.as_path(), e))?;
        }
        self.rows_in_chunk += 1;
        self.stats.rows_written += 1;
        Ok(())
    }

    /// Flushes the open chunk and returns the totals.
    pub fn finish(mut self) -> Result<ChunkStats, StageError> {
        self.close_current()?;
        Ok(self.stats)
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close_current() {
            error!("Worker {} failed to flush its last chunk: {}", self.worker, e);
        }
    }
}
