use std::fmt;
use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, WINDOWS_1251};
use serde::Serialize;

/// The three source datasets published by the tax service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// Registry of small and medium-sized businesses.
    Smb,
    /// Revenue and expenditure of organizations.
    Revexp,
    /// Average number of employees of organizations.
    Empl,
}

pub const SMB_HEADER: [&str; 23] = [
    "tin",
    "reg_number",
    "kind",
    "category",
    "org_name",
    "org_short_name",
    "last_name",
    "first_name",
    "patronymic",
    "region_code",
    "region_type",
    "region_name",
    "district_type",
    "district_name",
    "city_type",
    "city_name",
    "settlement_type",
    "settlement_name",
    "activity_group",
    "activity_code_main",
    "activity_codes_additional",
    "included_date",
    "snapshot_date",
];

pub const REVEXP_HEADER: [&str; 6] = [
    "tin",
    "org_name",
    "revenue",
    "expenditure",
    "data_date",
    "snapshot_date",
];

pub const EMPL_HEADER: [&str; 5] = ["tin", "org_name", "employees", "data_date", "snapshot_date"];

impl DatasetKind {
    pub const ALL: [DatasetKind; 3] = [DatasetKind::Smb, DatasetKind::Revexp, DatasetKind::Empl];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Smb => "smb",
            DatasetKind::Revexp => "revexp",
            DatasetKind::Empl => "empl",
        }
    }

    /// Column names of the normalized CSV schema.
    pub fn header(&self) -> &'static [&'static str] {
        match self {
            DatasetKind::Smb => &SMB_HEADER,
            DatasetKind::Revexp => &REVEXP_HEADER,
            DatasetKind::Empl => &EMPL_HEADER,
        }
    }

    /// Text encoding assumed for entries that declare none.
    pub fn expected_encoding(&self) -> &'static Encoding {
        WINDOWS_1251
    }

    /// Whether activity-code filtering applies to this dataset.
    pub fn is_filterable(&self) -> bool {
        matches!(self, DatasetKind::Smb)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages that own a directory under the data root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageName {
    Download,
    Extract,
    Aggregate,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Download => "download",
            StageName::Extract => "extract",
            StageName::Aggregate => "aggregate",
        }
    }
}

/// File name of an aggregated dataset inside `aggregate/<kind>/`.
pub const AGGREGATE_FILE_NAME: &str = "agg.csv";

/// `<root>/<stage>[/<kind>][/<file>]`, the layout shared with the download,
/// georeference and panel collaborators.
pub fn stage_path(root: &Path, stage: StageName, kind: Option<DatasetKind>, file: Option<&str>) -> PathBuf {
    let mut path = root.join(stage.as_str());
    if let Some(kind) = kind {
        path.push(kind.as_str());
    }
    if let Some(file) = file {
        path.push(file);
    }
    path
}
