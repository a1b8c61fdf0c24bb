use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A single record could not be normalized. The record is dropped and counted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("required field '{0}' is missing")]
    MissingField(&'static str),
    #[error("field '{field}' holds an unparsable date '{value}'")]
    InvalidDate { field: &'static str, value: String },
    #[error("field '{field}' holds an invalid value '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },
}

/// An archive entry could not be read. Every row of that entry is dropped.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("entry '{entry}': {source}")]
    Read {
        entry: String,
        #[source]
        source: io::Error,
    },
    #[error("entry '{entry}' is not valid {encoding} text")]
    Encoding { entry: String, encoding: &'static str },
    #[error("entry '{entry}': malformed XML at byte {position}: {message}")]
    Xml {
        entry: String,
        position: u64,
        message: String,
    },
}

/// Per-item failure yielded by an archive reader.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Failures that abort a whole stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error on {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("cannot open archive {}: {reason}", path.display())]
    Archive { path: PathBuf, reason: String },
    #[error("worker pool failure: {0}")]
    Pool(String),
}

impl StageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        StageError::Csv {
            path: path.into(),
            source,
        }
    }
}
