//! Extraction stage: archives → normalized, chunked CSV files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use glob::glob;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::archive::{ArchiveReader, ReaderStats, ARCHIVE_EXTENSIONS};
use crate::chunk::{ChunkStats, ChunkWriter};
use crate::codes::CodeTree;
use crate::context::{format_elapsed, StageContext};
use crate::dataset::DatasetKind;
use crate::error::{RecordError, StageError};

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
    pub kind: DatasetKind,
    pub num_workers: usize,
    /// Maximum data rows per chunk file.
    pub chunk_size: usize,
    /// Activity-code filters; empty disables filtering.
    pub activity_codes: Vec<String>,
    /// Empty `out_dir` before writing.
    pub clear: bool,
    pub show_progress: bool,
}

/// Counters of one archive, sent from a worker to the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries_read: u64,
    pub entries_failed: u64,
    pub records_failed: u64,
    pub rows_written: u64,
    pub rows_filtered: u64,
}

impl ArchiveStats {
    fn from_reader(reader: ReaderStats, rows_written: u64) -> Self {
        Self {
            entries_read: reader.entries_read,
            entries_failed: reader.entries_failed,
            records_failed: reader.records_failed,
            rows_written,
            rows_filtered: reader.rows_filtered,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionSummary {
    pub dataset: Option<DatasetKind>,
    pub archives_found: usize,
    pub archives_processed: usize,
    pub archives_failed: usize,
    pub failed_archives: Vec<PathBuf>,
    pub entries_read: u64,
    pub entries_failed: u64,
    pub records_failed: u64,
    pub rows_written: u64,
    pub rows_filtered: u64,
    pub chunk_files: usize,
    pub elapsed_secs: f64,
}

impl ExtractionSummary {
    fn add_archive(&mut self, stats: &ArchiveStats) {
        self.archives_processed += 1;
        self.entries_read += stats.entries_read;
        self.entries_failed += stats.entries_failed;
        self.records_failed += stats.records_failed;
        self.rows_written += stats.rows_written;
        self.rows_filtered += stats.rows_filtered;
    }

    pub fn log(&self) {
        info!("-------------------- EXTRACTION SUMMARY --------------------");
        if let Some(kind) = self.dataset {
            info!("Dataset: {}", kind);
        }
        info!("Archives found: {}", self.archives_found);
        info!("Archives processed: {}", self.archives_processed);
        if self.archives_failed > 0 {
            warn!("Archives failed: {}", self.archives_failed);
            for path in self.failed_archives.iter().take(10) {
                warn!("  - {}", path.display());
            }
            if self.failed_archives.len() > 10 {
                warn!("  ... (and {} more)", self.failed_archives.len() - 10);
            }
        }
        info!("Entries read: {} ({} failed)", self.entries_read, self.entries_failed);
        info!("Records failed: {}", self.records_failed);
        info!("Rows written: {}", self.rows_written);
        info!("Rows dropped by activity code filter: {}", self.rows_filtered);
        info!("Chunk files written: {}", self.chunk_files);
        info!("------------------------------------------------------------");
    }
}

enum WorkerMessage {
    ArchiveDone {
        path: PathBuf,
        stats: ArchiveStats,
    },
    ArchiveFailed {
        path: PathBuf,
        reason: String,
    },
    /// Writing failed; the worker stops taking archives.
    WriteFailed {
        worker: usize,
        error: StageError,
    },
    Finished {
        worker: usize,
        chunks: ChunkStats,
    },
}

/// Read-only state shared by all workers.
struct WorkerJob<'a> {
    kind: DatasetKind,
    out_dir: &'a Path,
    chunk_size: usize,
    filter: Option<Arc<CodeTree>>,
}

enum ArchiveOutcome {
    Done(ArchiveStats),
    Unreadable(StageError),
    WriteFailed(StageError),
}

fn process_archive(path: &Path, job: &WorkerJob<'_>, sink: &mut ChunkWriter) -> ArchiveOutcome {
    let mut reader = match ArchiveReader::open(path, job.kind, job.filter.clone()) {
        Ok(reader) => reader,
        Err(e) => return ArchiveOutcome::Unreadable(e),
    };
    let mut rows_written = 0;
    for item in reader.by_ref() {
        match item {
            Ok(row) => {
                if let Err(e) = sink.write(&row) {
                    return ArchiveOutcome::WriteFailed(e);
                }
                rows_written += 1;
            }
            // Counted by the reader.
            Err(RecordError::Schema(_)) | Err(RecordError::Parse(_)) => {}
        }
    }
    ArchiveOutcome::Done(ArchiveStats::from_reader(reader.stats(), rows_written))
}

fn run_worker(worker: usize, tasks: Receiver<PathBuf>, results: Sender<WorkerMessage>, job: &WorkerJob<'_>) {
    debug!("Worker {} started", worker);
    let mut sink = ChunkWriter::new(job.out_dir, job.kind, worker, job.chunk_size);
    for path in tasks.iter() {
        let message = match process_archive(&path, job, &mut sink) {
            ArchiveOutcome::Done(stats) => WorkerMessage::ArchiveDone { path, stats },
            ArchiveOutcome::Unreadable(e) => WorkerMessage::ArchiveFailed {
                path,
                reason: e.to_string(),
            },
            ArchiveOutcome::WriteFailed(error) => {
                let _ = results.send(WorkerMessage::WriteFailed { worker, error });
                return;
            }
        };
        if results.send(message).is_err() {
            return;
        }
    }
    let message = match sink.finish() {
        Ok(chunks) => WorkerMessage::Finished { worker, chunks },
        Err(error) => WorkerMessage::WriteFailed { worker, error },
    };
    let _ = results.send(message);
    debug!("Worker {} finished", worker);
}

/// Every archive under `dir`, recursively, sorted by path.
pub fn find_archives(dir: &Path) -> Result<Vec<PathBuf>, StageError> {
    let mut paths = Vec::new();
    for extension in ARCHIVE_EXTENSIONS {
        let pattern = dir.join(format!("**/*.{}", extension));
        let pattern_str = pattern.to_string_lossy();
        debug!("Searching for archives matching {}", pattern_str);
        let entries = glob(&pattern_str).map_err(|e| StageError::Configuration(e.to_string()))?;
        paths.extend(entries.filter_map(Result::ok).filter(|p| p.is_file()));
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Removes everything inside `dir`, keeping the directory itself.
pub fn clear_dir(dir: &Path) -> Result<(), StageError> {
    if !dir.exists() {
        return Ok(());
    }
    let entries = fs::read_dir(dir).map_err(|e| StageError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| StageError::io(dir, e))?.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| StageError::io(&path, e))?;
    }
    info!("Cleared {}", dir.display());
    Ok(())
}

fn validate(options: &ExtractOptions) -> Result<(), StageError> {
    if options.num_workers == 0 {
        return Err(StageError::Configuration("worker count must be positive".into()));
    }
    if options.chunk_size == 0 {
        return Err(StageError::Configuration("chunk size must be positive".into()));
    }
    if !options.in_dir.is_dir() {
        return Err(StageError::io(
            &options.in_dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "source directory not found"),
        ));
    }
    Ok(())
}

/// The activity-code filter of a run. A non-empty code list in which no code
/// is usable is rejected rather than treated as "no filter".
fn build_filter(options: &ExtractOptions) -> Result<Option<Arc<CodeTree>>, StageError> {
    if options.activity_codes.is_empty() {
        return Ok(None);
    }
    if !options.kind.is_filterable() {
        info!("Activity code filter does not apply to {}; ignoring", options.kind);
        return Ok(None);
    }
    let tree = CodeTree::new(&options.activity_codes);
    if tree.is_empty() {
        return Err(StageError::Configuration(format!(
            "no valid activity code among {:?}",
            options.activity_codes
        )));
    }
    info!("Filtering by {} activity code(s): {:?}", tree.len(), options.activity_codes);
    Ok(Some(Arc::new(tree)))
}

pub fn run_extraction(options: &ExtractOptions) -> Result<ExtractionSummary, StageError> {
    validate(options)?;
    let filter = build_filter(options)?;

    let archives = find_archives(&options.in_dir)?;
    if options.clear {
        clear_dir(&options.out_dir)?;
    }
    fs::create_dir_all(&options.out_dir).map_err(|e| StageError::io(&options.out_dir, e))?;

    let mut summary = ExtractionSummary {
        dataset: Some(options.kind),
        archives_found: archives.len(),
        ..ExtractionSummary::default()
    };
    info!(
        "Found {} archives of {} in {}",
        archives.len(),
        options.kind,
        options.in_dir.display()
    );
    if archives.is_empty() {
        warn!("No archives found in {}", options.in_dir.display());
        return Ok(summary);
    }

    let ctx = StageContext::acquire(
        format!("extract {}", options.kind),
        archives.len() as u64,
        options.show_progress,
    );

    let num_workers = options.num_workers.min(archives.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .thread_name(|i| format!("extract-{}", i))
        .build()
        .map_err(|e| StageError::Pool(e.to_string()))?;
    info!("Using {} extraction worker(s)", num_workers);

    let job = WorkerJob {
        kind: options.kind,
        out_dir: &options.out_dir,
        chunk_size: options.chunk_size,
        filter,
    };

    let mut write_error: Option<StageError> = None;
    {
        let mut handle = |message: WorkerMessage| match message {
            WorkerMessage::ArchiveDone { path, stats } => {
                let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                debug!("{}: {:?}", path.display(), stats);
                ctx.progress().set_message(format!("OK: {} ({} rows)", name, stats.rows_written));
                ctx.progress().inc(1);
                summary.add_archive(&stats);
            }
            WorkerMessage::ArchiveFailed { path, reason } => {
                error!("Error processing archive {}: {}", path.display(), reason);
                ctx.progress().inc(1);
                summary.archives_failed += 1;
                summary.failed_archives.push(path);
            }
            WorkerMessage::WriteFailed { worker, error } => {
                error!("Worker {} could not write output: {}", worker, error);
                write_error.get_or_insert(error);
            }
            WorkerMessage::Finished { worker, chunks } => {
                debug!("Worker {} wrote {} chunk file(s)", worker, chunks.files_written);
                summary.chunk_files += chunks.files_written;
            }
        };

        let (task_tx, task_rx) = bounded::<PathBuf>(num_workers * 2);
        let (result_tx, result_rx) = unbounded::<WorkerMessage>();
        let job = &job;

        pool.in_place_scope(|scope| {
            for worker in 0..num_workers {
                let tasks = task_rx.clone();
                let results = result_tx.clone();
                scope.spawn(move |_| run_worker(worker, tasks, results, job));
            }
            drop(task_rx);
            drop(result_tx);

            // Results are drained while feeding the queue.
            let mut pending = archives.iter();
            let mut next = pending.next();
            while let Some(path) = next {
                select! {
                    send(task_tx, path.clone()) -> sent => {
                        if sent.is_err() {
                            warn!("All workers stopped; {} archive(s) were not dispatched", pending.len() + 1);
                            next = None;
                        } else {
                            next = pending.next();
                        }
                    }
                    recv(result_rx) -> message => {
                        if let Ok(message) = message {
                            handle(message);
                        }
                    }
                }
            }
            drop(task_tx);
            for message in result_rx.iter() {
                handle(message);
            }
        });
    }

    summary.elapsed_secs = ctx.elapsed().as_secs_f64();
    if let Some(error) = write_error {
        return Err(error);
    }
    let elapsed = ctx.elapsed();
    ctx.finish(format!(
        "{} archives OK, {} errors, {} rows in {}",
        summary.archives_processed,
        summary.archives_failed,
        summary.rows_written,
        format_elapsed(elapsed)
    ));
    Ok(summary)
}
