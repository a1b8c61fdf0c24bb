//! Extraction and aggregation of the FTS register of small and medium-sized
//! businesses and its revenue/expenditure and employee-count companions.

pub mod aggregate;
pub mod archive;
pub mod chunk;
pub mod codes;
pub mod config;
pub mod context;
pub mod dataset;
pub mod error;
pub mod extract;
pub mod parser;
pub mod row;

pub use aggregate::{run_aggregation, AggregateOptions, AggregationSummary};
pub use codes::CodeTree;
pub use config::Settings;
pub use dataset::{DatasetKind, StageName};
pub use error::{ParseError, RecordError, SchemaError, StageError};
pub use extract::{run_extraction, ExtractOptions, ExtractionSummary};
pub use row::Row;
