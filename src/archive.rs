//! Reading source archives: container formats, text decoding and the XML
//! walk that turns `Документ` elements into raw records.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use encoding_rs::Encoding;
use flate2::read::MultiGzDecoder;
use log::{debug, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use zip::ZipArchive;

use crate::codes::CodeTree;
use crate::dataset::DatasetKind;
use crate::error::{ParseError, RecordError, StageError};
use crate::parser::{RawRecord, RecordParser};
use crate::row::Row;

/// Element wrapping one record in every dataset.
pub const RECORD_ELEMENT: &str = "Документ";

/// Container extensions recognised by the directory scan.
pub const ARCHIVE_EXTENSIONS: [&str; 2] = ["zip", "gz"];

/// Running counters of one reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub entries_read: u64,
    pub entries_failed: u64,
    pub records_failed: u64,
    pub rows_filtered: u64,
}

enum Container {
    Zip {
        archive: ZipArchive<BufReader<File>>,
        entries: Vec<usize>,
    },
    Gzip {
        entry: String,
        decoder: Option<MultiGzDecoder<BufReader<File>>>,
    },
}

impl Container {
    fn open(path: &Path) -> Result<Self, StageError> {
        let file = File::open(path).map_err(|e| StageError::io(path, e))?;
        let reader = BufReader::new(file);
        let is_gzip = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("gz"))
            .unwrap_or(false);

        if is_gzip {
            let entry = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            return Ok(Container::Gzip {
                entry,
                decoder: Some(MultiGzDecoder::new(reader)),
            });
        }

        let mut archive = ZipArchive::new(reader).map_err(|e| StageError::Archive {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut entries = Vec::new();
        for index in 0..archive.len() {
            match archive.by_index_raw(index) {
                Ok(entry) if entry.is_file() && entry.name().to_lowercase().ends_with(".xml") => {
                    entries.push(index)
                }
                Ok(entry) => debug!("Skipping non-XML entry '{}' in {}", entry.name(), path.display()),
                // Kept so that reading it fails and is counted.
                Err(e) => {
                    warn!("Unreadable entry #{} in {}: {}", index, path.display(), e);
                    entries.push(index);
                }
            }
        }
        Ok(Container::Zip { archive, entries })
    }

    fn entry_count(&self) -> usize {
        match self {
            Container::Zip { entries, .. } => entries.len(),
            Container::Gzip { .. } => 1,
        }
    }

    /// Name and decompressed bytes of the `position`-th records entry.
    fn read_entry(&mut self, position: usize) -> Result<(String, Vec<u8>), ParseError> {
        match self {
            Container::Zip { archive, entries } => {
                let index = entries[position];
                let mut file = archive.by_index(index).map_err(|e| ParseError::Read {
                    entry: format!("#{}", index),
                    source: e.into(),
                })?;
                let name = file.name().to_string();
                let mut bytes = Vec::with_capacity(file.size() as usize);
                file.read_to_end(&mut bytes).map_err(|source| ParseError::Read {
                    entry: name.clone(),
                    source,
                })?;
                Ok((name, bytes))
            }
            Container::Gzip { entry, decoder } => {
                let mut bytes = Vec::new();
                if let Some(mut decoder) = decoder.take() {
                    decoder.read_to_end(&mut bytes).map_err(|source| ParseError::Read {
                        entry: entry.clone(),
                        source,
                    })?;
                }
                Ok((entry.clone(), bytes))
            }
        }
    }
}

/// Encoding named in the XML declaration, e.g. `encoding="windows-1251"`.
fn declared_encoding(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(256)];
    let head = String::from_utf8_lossy(head);
    let declaration = &head[..head.find("?>")?];
    if !declaration.trim_start().starts_with("<?xml") {
        return None;
    }
    let rest = &declaration[declaration.find("encoding")? + "encoding".len()..];
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let label = &rest[1..];
    let label = &label[..label.find(quote)?];
    Encoding::for_label(label.trim().as_bytes())
}

/// Decodes an entry: byte-order mark first, then the XML declaration, then
/// the dataset's fallback encoding.
pub fn decode_entry(entry: &str, bytes: &[u8], fallback: &'static Encoding) -> Result<String, ParseError> {
    let encoding = Encoding::for_bom(bytes)
        .map(|(encoding, _)| encoding)
        .or_else(|| declared_encoding(bytes))
        .unwrap_or(fallback);
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(ParseError::Encoding {
            entry: entry.to_string(),
            encoding: used.name(),
        });
    }
    Ok(text.into_owned())
}

fn collect_attributes(
    element: &BytesStart<'_>,
    prefix: &str,
    record: &mut RawRecord,
) -> Result<(), quick_xml::Error> {
    for attr in element.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref());
        let value = attr.unescape_value()?;
        record.push(format!("{}@{}", prefix, key), value.into_owned());
    }
    Ok(())
}

fn xml_error(entry: &str, reader: &Reader<&[u8]>, message: impl ToString) -> ParseError {
    ParseError::Xml {
        entry: entry.to_string(),
        position: reader.buffer_position() as u64,
        message: message.to_string(),
    }
}

/// Every `Документ` record of a decoded entry. All-or-nothing: malformed
/// XML anywhere in the entry fails the whole entry.
pub fn parse_records(entry: &str, xml: &str) -> Result<Vec<RawRecord>, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut current: Option<RawRecord> = None;
    // Element names below the current `Документ`.
    let mut path: Vec<String> = Vec::new();
    let mut depth: usize = 0;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| xml_error(entry, &reader, e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if !is_empty {
                    depth += 1;
                }

                if let Some(record) = current.as_mut() {
                    path.push(name);
                    let prefix = path.join("/");
                    collect_attributes(e, &prefix, record)
                        .map_err(|err| xml_error(entry, &reader, err))?;
                    if is_empty {
                        path.pop();
                    }
                } else if name == RECORD_ELEMENT {
                    let mut record = RawRecord::new();
                    collect_attributes(e, "", &mut record)
                        .map_err(|err| xml_error(entry, &reader, err))?;
                    if is_empty {
                        records.push(record);
                    } else {
                        current = Some(record);
                    }
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if current.is_some() {
                    if path.pop().is_none() {
                        if let Some(record) = current.take() {
                            records.push(record);
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth > 0 || current.is_some() {
        return Err(xml_error(entry, &reader, "unexpected end of document"));
    }
    Ok(records)
}

/// Lazy, consume-once sequence of normalized rows from one archive.
///
/// Entries are decoded one at a time as the consumer pulls rows. Rows
/// rejected by the activity-code filter are counted and never yielded.
pub struct ArchiveReader {
    path: PathBuf,
    kind: DatasetKind,
    parser: RecordParser,
    filter: Option<Arc<CodeTree>>,
    container: Container,
    next_entry: usize,
    pending: VecDeque<Result<Row, RecordError>>,
    stats: ReaderStats,
}

impl ArchiveReader {
    pub fn open(
        path: impl AsRef<Path>,
        kind: DatasetKind,
        filter: Option<Arc<CodeTree>>,
    ) -> Result<Self, StageError> {
        let path = path.as_ref().to_path_buf();
        let container = Container::open(&path)?;
        debug!(
            "Opened {} ({} records entries)",
            path.display(),
            container.entry_count()
        );
        Ok(Self {
            path,
            kind,
            parser: RecordParser::new(kind),
            filter: filter.filter(|tree| kind.is_filterable() && !tree.is_empty()),
            container,
            next_entry: 0,
            pending: VecDeque::new(),
            stats: ReaderStats::default(),
        })
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    fn keep(&self, row: &Row) -> bool {
        match &self.filter {
            Some(tree) => tree.matches(row.activity_code().unwrap_or_default()),
            None => true,
        }
    }

    /// Loads the next entry into `pending`. False once every entry is consumed.
    fn load_next_entry(&mut self) -> bool {
        if self.next_entry >= self.container.entry_count() {
            return false;
        }
        let position = self.next_entry;
        self.next_entry += 1;
        self.stats.entries_read += 1;

        let records = self
            .container
            .read_entry(position)
            .and_then(|(name, bytes)| {
                let text = decode_entry(&name, &bytes, self.kind.expected_encoding())?;
                parse_records(&name, &text)
            });

        match records {
            Ok(records) => {
                for raw in &records {
                    match self.parser.parse(raw) {
                        Ok(row) if self.keep(&row) => self.pending.push_back(Ok(row)),
                        Ok(_) => self.stats.rows_filtered += 1,
                        Err(e) => {
                            self.stats.records_failed += 1;
                            debug!("Dropping record in {}: {}", self.path.display(), e);
                            self.pending.push_back(Err(e.into()));
                        }
                    }
                }
            }
            Err(e) => {
                self.stats.entries_failed += 1;
                warn!("Skipping entry of {}: {}", self.path.display(), e);
                self.pending.push_back(Err(e.into()));
            }
        }
        true
    }
}

impl Iterator for ArchiveReader {
    type Item = Result<Row, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if !self.load_next_entry() {
                return None;
            }
        }
    }
}
