//! Normalization of raw `Документ` records into typed rows.

use chrono::NaiveDate;

use crate::codes::section_of;
use crate::dataset::DatasetKind;
use crate::error::SchemaError;
use crate::row::{Address, EmplRow, RevexpRow, Row, SmbRow};

/// Date format of every date attribute in the source XML.
pub const SOURCE_DATE_FORMAT: &str = "%d.%m.%Y";

const SNAPSHOT_DATE: &str = "@ДатаСост";
const DOCUMENT_DATE: &str = "@ДатаДок";
const INCLUDED_DATE: &str = "@ДатаВклМСП";

const TIN: [&str; 4] = [
    "ОргВклМСП@ИННЮЛ",
    "ИПВклМСП@ИННФЛ",
    "СведНП@ИННЮЛ",
    "СведНП@ИННФЛ",
];
const REG_NUMBER: [&str; 2] = ["ОргВклМСП@ОГРН", "ИПВклМСП@ОГРНИП"];
const ORG_NAME: [&str; 2] = ["ОргВклМСП@НаимОрг", "СведНП@НаимОрг"];

/// One source record: `(element path @ attribute, value)` pairs in document
/// order. The element path is relative to `Документ`, so the record's own
/// attributes have keys like `@ДатаСост`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    fields: Vec<(String, String)>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First key among `keys` that is present, in priority order.
    fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Parses a decimal number written with any of the separators seen in the
/// source data: spaces, no-break spaces or apostrophes between thousands, and
/// either `,` or `.` as the decimal mark. `None` when the text is not a number.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\'' | '\u{2019}'))
        .collect();
    if compact.is_empty() {
        return None;
    }
    let commas = compact.matches(',').count();
    let dots = compact.matches('.').count();
    let normalized = match (commas, dots) {
        (0, 0) | (0, 1) => compact,
        (1, 0) => compact.replace(',', "."),
        (_, 0) => compact.replace(',', ""),
        (0, _) => compact.replace('.', ""),
        _ => {
            // Both present: the right-most one is the decimal mark.
            let last_comma = compact.rfind(',')?;
            let last_dot = compact.rfind('.')?;
            if last_comma > last_dot {
                if dots > 0 && commas > 1 {
                    return None;
                }
                compact.replace('.', "").replace(',', ".")
            } else {
                if commas > 0 && dots > 1 {
                    return None;
                }
                compact.replace(',', "")
            }
        }
    };
    let valid = normalized
        .trim_start_matches(['-', '+'])
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.');
    if !valid {
        return None;
    }
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_source_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), SOURCE_DATE_FORMAT).ok()
}

/// Turns raw records of one dataset kind into normalized rows.
#[derive(Debug, Clone, Copy)]
pub struct RecordParser {
    kind: DatasetKind,
}

impl RecordParser {
    pub fn new(kind: DatasetKind) -> Self {
        Self { kind }
    }

    pub fn parse(&self, raw: &RawRecord) -> Result<Row, SchemaError> {
        let tin = raw
            .first_of(&TIN)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SchemaError::MissingField("ИНН"))?
            .to_string();
        let snapshot_date = required_date(raw, SNAPSHOT_DATE)?;

        let row = match self.kind {
            DatasetKind::Smb => Row::Smb(smb_row(raw, tin, snapshot_date)),
            DatasetKind::Revexp => Row::Revexp(RevexpRow {
                tin,
                org_name: text(raw, &ORG_NAME),
                revenue: decimal(raw, "СведДохРасх@СумДоход"),
                expenditure: decimal(raw, "СведДохРасх@СумРасход"),
                data_date: optional_date(raw, DOCUMENT_DATE),
                snapshot_date,
            }),
            DatasetKind::Empl => Row::Empl(EmplRow {
                tin,
                org_name: text(raw, &ORG_NAME),
                employees: decimal(raw, "СведССЧР@КолРаб"),
                data_date: optional_date(raw, DOCUMENT_DATE),
                snapshot_date,
            }),
        };
        Ok(row)
    }
}

fn smb_row(raw: &RawRecord, tin: String, snapshot_date: NaiveDate) -> SmbRow {
    let activity_code_main = text(raw, &["СвОКВЭД/СвОКВЭДОсн@КодОКВЭД"]);
    let activity_group = activity_code_main.as_deref().and_then(section_of);
    SmbRow {
        tin,
        reg_number: text(raw, &REG_NUMBER),
        kind: small_int(raw, "@ВидСубМСП"),
        category: small_int(raw, "@КатСубМСП"),
        org_name: text(raw, &["ОргВклМСП@НаимОрг"]),
        org_short_name: text(raw, &["ОргВклМСП@НаимОргСокр"]),
        last_name: text(raw, &["ИПВклМСП/ФИОИП@Фамилия"]),
        first_name: text(raw, &["ИПВклМСП/ФИОИП@Имя"]),
        patronymic: text(raw, &["ИПВклМСП/ФИОИП@Отчество"]),
        address: Address {
            region_code: text(raw, &["СведМН@КодРегион"]),
            region_type: text(raw, &["СведМН/Регион@Тип"]),
            region_name: text(raw, &["СведМН/Регион@Наим"]),
            district_type: text(raw, &["СведМН/Район@Тип"]),
            district_name: text(raw, &["СведМН/Район@Наим"]),
            city_type: text(raw, &["СведМН/Город@Тип"]),
            city_name: text(raw, &["СведМН/Город@Наим"]),
            settlement_type: text(raw, &["СведМН/НаселПункт@Тип"]),
            settlement_name: text(raw, &["СведМН/НаселПункт@Наим"]),
        },
        activity_group,
        activity_code_main,
        activity_codes_additional: raw
            .get_all("СвОКВЭД/СвОКВЭДДоп@КодОКВЭД")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        included_date: optional_date(raw, INCLUDED_DATE),
        snapshot_date,
    }
}

fn text(raw: &RawRecord, keys: &[&str]) -> Option<String> {
    raw.first_of(keys).map(|s| s.trim().to_string())
}

fn decimal(raw: &RawRecord, key: &str) -> Option<f64> {
    raw.get(key).and_then(parse_decimal)
}

fn small_int(raw: &RawRecord, key: &str) -> Option<u8> {
    raw.get(key).and_then(|s| s.trim().parse().ok())
}

fn optional_date(raw: &RawRecord, key: &str) -> Option<NaiveDate> {
    raw.get(key).and_then(parse_source_date)
}

fn required_date(raw: &RawRecord, key: &'static str) -> Result<NaiveDate, SchemaError> {
    let value = raw.get(key).ok_or(SchemaError::MissingField(key))?;
    parse_source_date(value).ok_or_else(|| SchemaError::InvalidDate {
        field: key,
        value: value.to_string(),
    })
}
