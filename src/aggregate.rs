//! Aggregation stage: chunk files of one dataset → one deduplicated CSV.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use csv::{Reader, StringRecord, Writer};
use glob::glob;
use log::{debug, info, warn};
use serde::Serialize;

use crate::chunk::CHUNK_FILE_PATTERN;
use crate::context::{format_elapsed, StageContext};
use crate::dataset::DatasetKind;
use crate::error::StageError;
use crate::row::Row;

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub in_dir: PathBuf,
    pub out_file: PathBuf,
    pub kind: DatasetKind,
    /// Previously aggregated registry whose identifiers restrict the output.
    pub companion: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationSummary {
    pub files_read: usize,
    pub files_skipped: usize,
    pub rows_read: u64,
    pub rows_failed: u64,
    pub rows_replaced: u64,
    pub unique_ids: usize,
    pub rows_dropped_by_companion: usize,
    pub rows_written: usize,
}

impl AggregationSummary {
    pub fn log(&self) {
        info!("-------------------- AGGREGATION SUMMARY -------------------");
        info!("Chunk files read: {} ({} skipped)", self.files_read, self.files_skipped);
        info!("Rows read: {} ({} failed)", self.rows_read, self.rows_failed);
        info!("Rows replaced by a newer snapshot: {}", self.rows_replaced);
        info!("Unique identifiers: {}", self.unique_ids);
        if self.rows_dropped_by_companion > 0 {
            info!("Rows dropped by companion filter: {}", self.rows_dropped_by_companion);
        }
        info!("Rows written: {}", self.rows_written);
        info!("------------------------------------------------------------");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Inserted,
    Replaced,
    Kept,
}

/// Identifier → latest row. A stored row is replaced only by a row with a
/// strictly later snapshot date, so on ties the first-seen row stays.
#[derive(Debug, Default)]
pub struct Deduplicator {
    rows: BTreeMap<String, Row>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, row: Row) -> Offer {
        match self.rows.entry(row.tin().to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(row);
                Offer::Inserted
            }
            Entry::Occupied(mut slot) => {
                if row.snapshot_date() > slot.get().snapshot_date() {
                    slot.insert(row);
                    Offer::Replaced
                } else {
                    Offer::Kept
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keeps only identifiers in `allowed`; returns how many were dropped.
    pub fn retain_ids(&mut self, allowed: &HashSet<String>) -> usize {
        let before = self.rows.len();
        self.rows.retain(|tin, _| allowed.contains(tin));
        before - self.rows.len()
    }

    /// Rows in identifier order.
    pub fn into_rows(self) -> impl Iterator<Item = Row> {
        self.rows.into_values()
    }
}

/// Identifier set of a previously aggregated file. Any failure here is a
/// configuration error: the caller must point at a valid aggregate.
pub fn load_identifiers(path: &Path) -> Result<HashSet<String>, StageError> {
    let config_error = |reason: String| {
        StageError::Configuration(format!("companion file {}: {}", path.display(), reason))
    };
    if !path.is_file() {
        return Err(config_error("not found".to_string()));
    }
    let mut reader = Reader::from_path(path).map_err(|e| config_error(e.to_string()))?;
    let headers = reader.headers().map_err(|e| config_error(e.to_string()))?;
    let column = headers
        .iter()
        .position(|h| h == "tin")
        .ok_or_else(|| config_error("no 'tin' column".to_string()))?;

    let mut ids = HashSet::new();
    for record in reader.records() {
        let record = record.map_err(|e| config_error(e.to_string()))?;
        if let Some(tin) = record.get(column).filter(|t| !t.is_empty()) {
            ids.insert(tin.to_string());
        }
    }
    info!("Loaded {} identifiers from {}", ids.len(), path.display());
    Ok(ids)
}

/// Chunk files of `dir`, sorted by name so runs are reproducible.
pub fn find_chunk_files(dir: &Path) -> Result<Vec<PathBuf>, StageError> {
    let pattern = dir.join(CHUNK_FILE_PATTERN);
    let pattern_str = pattern.to_string_lossy();
    let mut paths: Vec<PathBuf> = glob(&pattern_str)
        .map_err(|e| StageError::Configuration(e.to_string()))?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

/// Parsed content of one chunk file.
#[derive(Debug, Default)]
struct ChunkRows {
    rows: Vec<Row>,
    read: u64,
    failed: u64,
}

/// Reads one chunk file completely. `Err` when the file cannot be used at
/// all (unreadable, a header of another schema, or a broken CSV stream), in
/// which case none of its rows are kept.
fn read_chunk_file(path: &Path, kind: DatasetKind) -> Result<ChunkRows, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    read_chunk(file, &path.display().to_string(), kind)
}

fn read_chunk<R: Read>(source: R, name: &str, kind: DatasetKind) -> Result<ChunkRows, String> {
    let mut reader = Reader::from_reader(source);
    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let expected = StringRecord::from(kind.header().to_vec());
    if headers != expected {
        return Err(format!("header does not match the {} schema", kind));
    }

    let mut chunk = ChunkRows::default();
    let mut record = StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                chunk.read += 1;
                match Row::from_record(kind, &record) {
                    Ok(row) => chunk.rows.push(row),
                    Err(e) => {
                        chunk.failed += 1;
                        debug!("{} row {}: {}", name, chunk.read, e);
                    }
                }
            }
            Err(e) => {
                if !matches!(e.kind(), csv::ErrorKind::UnequalLengths { .. } | csv::ErrorKind::Utf8 { .. }) {
                    return Err(e.to_string());
                }
                chunk.failed += 1;
                debug!("{}: unreadable row: {}", name, e);
            }
        }
    }
    Ok(chunk)
}

pub fn write_rows<I>(path: &Path, kind: DatasetKind, rows: I) -> Result<usize, StageError>
where
    I: IntoIterator<Item = Row>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| StageError::io(path, e))?;
    let mut writer = Writer::from_writer(file);
    writer
        .write_record(kind.header())
        .map_err(|e| StageError::csv(path, e))?;
    let mut written = 0;
    for row in rows {
        writer
            .write_record(row.to_record())
            .map_err(|e| StageError::csv(path, e))?;
        written += 1;
    }
    writer.flush().map_err(|e| StageError::io(path, e))?;
    Ok(written)
}

pub fn run_aggregation(options: &AggregateOptions) -> Result<AggregationSummary, StageError> {
    let started = Instant::now();
    if options.companion.is_some() && options.kind == DatasetKind::Smb {
        return Err(StageError::Configuration(
            "a companion filter applies only to revexp and empl".into(),
        ));
    }
    let allowed = options
        .companion
        .as_deref()
        .map(load_identifiers)
        .transpose()?;
    if !options.in_dir.is_dir() {
        return Err(StageError::io(
            &options.in_dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "source directory not found"),
        ));
    }

    let files = find_chunk_files(&options.in_dir)?;
    info!(
        "Aggregating {} chunk file(s) of {} from {}",
        files.len(),
        options.kind,
        options.in_dir.display()
    );
    if files.is_empty() {
        warn!("No chunk files in {}; writing an empty aggregate", options.in_dir.display());
    }

    let ctx = StageContext::acquire(format!("aggregate {}", options.kind), files.len() as u64, false);
    let mut summary = AggregationSummary::default();
    let mut dedup = Deduplicator::new();
    for path in &files {
        match read_chunk_file(path, options.kind) {
            Ok(chunk) => {
                summary.files_read += 1;
                summary.rows_read += chunk.read;
                summary.rows_failed += chunk.failed;
                for row in chunk.rows {
                    if dedup.offer(row) == Offer::Replaced {
                        summary.rows_replaced += 1;
                    }
                }
            }
            Err(reason) => {
                warn!("Skipping chunk file {}: {}", path.display(), reason);
                summary.files_skipped += 1;
            }
        }
        ctx.progress().inc(1);
    }
    summary.unique_ids = dedup.len();

    if let Some(allowed) = &allowed {
        summary.rows_dropped_by_companion = dedup.retain_ids(allowed);
    }

    summary.rows_written = write_rows(&options.out_file, options.kind, dedup.into_rows())?;
    ctx.finish(format!(
        "{} rows written to {} in {}",
        summary.rows_written,
        options.out_file.display(),
        format_elapsed(started.elapsed())
    ));
    Ok(summary)
}
