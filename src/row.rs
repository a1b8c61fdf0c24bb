//! Normalized rows, one variant per dataset kind, and their CSV form.

use chrono::NaiveDate;
use csv::StringRecord;

use crate::dataset::DatasetKind;
use crate::error::SchemaError;

/// CSV token for an absent value. Distinct from an empty string.
pub const MISSING: &str = "NA";

/// Date format used in every CSV this crate writes.
pub const CSV_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Address {
    pub region_code: Option<String>,
    pub region_type: Option<String>,
    pub region_name: Option<String>,
    pub district_type: Option<String>,
    pub district_name: Option<String>,
    pub city_type: Option<String>,
    pub city_name: Option<String>,
    pub settlement_type: Option<String>,
    pub settlement_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmbRow {
    pub tin: String,
    pub reg_number: Option<String>,
    pub kind: Option<u8>,
    pub category: Option<u8>,
    pub org_name: Option<String>,
    pub org_short_name: Option<String>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub patronymic: Option<String>,
    pub address: Address,
    pub activity_group: Option<char>,
    pub activity_code_main: Option<String>,
    pub activity_codes_additional: Vec<String>,
    pub included_date: Option<NaiveDate>,
    pub snapshot_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevexpRow {
    pub tin: String,
    pub org_name: Option<String>,
    pub revenue: Option<f64>,
    pub expenditure: Option<f64>,
    pub data_date: Option<NaiveDate>,
    pub snapshot_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmplRow {
    pub tin: String,
    pub org_name: Option<String>,
    pub employees: Option<f64>,
    pub data_date: Option<NaiveDate>,
    pub snapshot_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Smb(SmbRow),
    Revexp(RevexpRow),
    Empl(EmplRow),
}

impl Row {
    pub fn kind(&self) -> DatasetKind {
        match self {
            Row::Smb(_) => DatasetKind::Smb,
            Row::Revexp(_) => DatasetKind::Revexp,
            Row::Empl(_) => DatasetKind::Empl,
        }
    }

    /// Primary identifier (taxpayer number).
    pub fn tin(&self) -> &str {
        match self {
            Row::Smb(r) => &r.tin,
            Row::Revexp(r) => &r.tin,
            Row::Empl(r) => &r.tin,
        }
    }

    pub fn snapshot_date(&self) -> NaiveDate {
        match self {
            Row::Smb(r) => r.snapshot_date,
            Row::Revexp(r) => r.snapshot_date,
            Row::Empl(r) => r.snapshot_date,
        }
    }

    /// Main activity code, present only on registry rows.
    pub fn activity_code(&self) -> Option<&str> {
        match self {
            Row::Smb(r) => r.activity_code_main.as_deref(),
            _ => None,
        }
    }

    pub fn to_record(&self) -> Vec<String> {
        match self {
            Row::Smb(r) => {
                let a = &r.address;
                vec![
                    r.tin.clone(),
                    text(&r.reg_number),
                    number(r.kind),
                    number(r.category),
                    text(&r.org_name),
                    text(&r.org_short_name),
                    text(&r.last_name),
                    text(&r.first_name),
                    text(&r.patronymic),
                    text(&a.region_code),
                    text(&a.region_type),
                    text(&a.region_name),
                    text(&a.district_type),
                    text(&a.district_name),
                    text(&a.city_type),
                    text(&a.city_name),
                    text(&a.settlement_type),
                    text(&a.settlement_name),
                    r.activity_group.map_or_else(|| MISSING.to_string(), String::from),
                    text(&r.activity_code_main),
                    if r.activity_codes_additional.is_empty() {
                        MISSING.to_string()
                    } else {
                        r.activity_codes_additional.join(";")
                    },
                    date(r.included_date),
                    r.snapshot_date.format(CSV_DATE_FORMAT).to_string(),
                ]
            }
            Row::Revexp(r) => vec![
                r.tin.clone(),
                text(&r.org_name),
                number(r.revenue),
                number(r.expenditure),
                date(r.data_date),
                r.snapshot_date.format(CSV_DATE_FORMAT).to_string(),
            ],
            Row::Empl(r) => vec![
                r.tin.clone(),
                text(&r.org_name),
                number(r.employees),
                date(r.data_date),
                r.snapshot_date.format(CSV_DATE_FORMAT).to_string(),
            ],
        }
    }

    /// Parses a record written by [`Row::to_record`] for the given kind.
    pub fn from_record(kind: DatasetKind, record: &StringRecord) -> Result<Row, SchemaError> {
        let header = kind.header();
        if record.len() != header.len() {
            return Err(SchemaError::ColumnCount {
                expected: header.len(),
                found: record.len(),
            });
        }
        let mut cols = Columns { record, header, pos: 0 };
        let row = match kind {
            DatasetKind::Smb => Row::Smb(SmbRow {
                tin: cols.required_text()?,
                reg_number: cols.text(),
                kind: cols.number()?,
                category: cols.number()?,
                org_name: cols.text(),
                org_short_name: cols.text(),
                last_name: cols.text(),
                first_name: cols.text(),
                patronymic: cols.text(),
                address: Address {
                    region_code: cols.text(),
                    region_type: cols.text(),
                    region_name: cols.text(),
                    district_type: cols.text(),
                    district_name: cols.text(),
                    city_type: cols.text(),
                    city_name: cols.text(),
                    settlement_type: cols.text(),
                    settlement_name: cols.text(),
                },
                activity_group: cols.letter()?,
                activity_code_main: cols.text(),
                activity_codes_additional: cols
                    .text()
                    .map(|s| s.split(';').map(str::to_string).collect())
                    .unwrap_or_default(),
                included_date: cols.date()?,
                snapshot_date: cols.required_date()?,
            }),
            DatasetKind::Revexp => Row::Revexp(RevexpRow {
                tin: cols.required_text()?,
                org_name: cols.text(),
                revenue: cols.number()?,
                expenditure: cols.number()?,
                data_date: cols.date()?,
                snapshot_date: cols.required_date()?,
            }),
            DatasetKind::Empl => Row::Empl(EmplRow {
                tin: cols.required_text()?,
                org_name: cols.text(),
                employees: cols.number()?,
                data_date: cols.date()?,
                snapshot_date: cols.required_date()?,
            }),
        };
        Ok(row)
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| MISSING.to_string())
}

fn number<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| MISSING.to_string(), |v| v.to_string())
}

fn date(value: Option<NaiveDate>) -> String {
    value.map_or_else(
        || MISSING.to_string(),
        |d| d.format(CSV_DATE_FORMAT).to_string(),
    )
}

/// Sequential reader over one record's columns.
struct Columns<'a> {
    record: &'a StringRecord,
    header: &'static [&'static str],
    pos: usize,
}

impl<'a> Columns<'a> {
    fn next_raw(&mut self) -> (&'static str, Option<&'a str>) {
        let field = self.header[self.pos];
        let value = self.record.get(self.pos).filter(|v| *v != MISSING);
        self.pos += 1;
        (field, value)
    }

    fn text(&mut self) -> Option<String> {
        self.next_raw().1.map(str::to_string)
    }

    fn required_text(&mut self) -> Result<String, SchemaError> {
        match self.next_raw() {
            (_, Some(v)) if !v.trim().is_empty() => Ok(v.to_string()),
            (field, _) => Err(SchemaError::MissingField(field)),
        }
    }

    fn number<T: std::str::FromStr>(&mut self) -> Result<Option<T>, SchemaError> {
        match self.next_raw() {
            (_, None) => Ok(None),
            (field, Some(v)) => v.parse().map(Some).map_err(|_| SchemaError::InvalidValue {
                field,
                value: v.to_string(),
            }),
        }
    }

    fn letter(&mut self) -> Result<Option<char>, SchemaError> {
        match self.next_raw() {
            (_, None) => Ok(None),
            (field, Some(v)) => {
                let mut chars = v.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(Some(c)),
                    _ => Err(SchemaError::InvalidValue {
                        field,
                        value: v.to_string(),
                    }),
                }
            }
        }
    }

    fn date(&mut self) -> Result<Option<NaiveDate>, SchemaError> {
        match self.next_raw() {
            (_, None) => Ok(None),
            (field, Some(v)) => NaiveDate::parse_from_str(v, CSV_DATE_FORMAT)
                .map(Some)
                .map_err(|_| SchemaError::InvalidDate {
                    field,
                    value: v.to_string(),
                }),
        }
    }

    fn required_date(&mut self) -> Result<NaiveDate, SchemaError> {
        let field = self.header[self.pos];
        self.date()?.ok_or(SchemaError::MissingField(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn round_trip(row: &Row) -> Row {
        let record = StringRecord::from(row.to_record());
        Row::from_record(row.kind(), &record).unwrap()
    }

    #[test]
    fn smb_row_round_trips_with_missing_values() {
        let row = Row::Smb(SmbRow {
            tin: "7707083893".into(),
            reg_number: Some("1027700132195".into()),
            kind: Some(1),
            category: None,
            org_name: Some("ПАО \"РОМАШКА\", филиал".into()),
            org_short_name: Some(String::new()),
            last_name: None,
            first_name: None,
            patronymic: None,
            address: Address {
                region_code: Some("77".into()),
                region_type: Some("Г".into()),
                region_name: Some("МОСКВА".into()),
                ..Address::default()
            },
            activity_group: Some('J'),
            activity_code_main: Some("62.01".into()),
            activity_codes_additional: vec!["62.02".into(), "63.11.1".into()],
            included_date: None,
            snapshot_date: day(2021, 1, 10),
        });
        assert_eq!(round_trip(&row), row);
    }

    #[test]
    fn revexp_and_empl_rows_round_trip() {
        let revexp = Row::Revexp(RevexpRow {
            tin: "500100732259".into(),
            org_name: None,
            revenue: Some(1234567.89),
            expenditure: None,
            data_date: Some(day(2019, 12, 31)),
            snapshot_date: day(2020, 1, 1),
        });
        assert_eq!(round_trip(&revexp), revexp);

        let empl = Row::Empl(EmplRow {
            tin: "500100732259".into(),
            org_name: Some("ООО НА".into()),
            employees: Some(12.0),
            data_date: None,
            snapshot_date: day(2020, 1, 1),
        });
        assert_eq!(empl.to_record()[2], "12");
        assert_eq!(round_trip(&empl), empl);
    }

    #[test]
    fn missing_sentinel_is_not_an_empty_string() {
        let row = Row::Empl(EmplRow {
            tin: "1".into(),
            org_name: Some(String::new()),
            employees: None,
            data_date: None,
            snapshot_date: day(2022, 1, 1),
        });
        let record = row.to_record();
        assert_eq!(record[1], "");
        assert_eq!(record[2], MISSING);
        assert_eq!(round_trip(&row), row);
    }

    #[test]
    fn rejects_wrong_column_count_and_missing_identifier() {
        let short = StringRecord::from(vec!["1", "x"]);
        assert_eq!(
            Row::from_record(DatasetKind::Empl, &short),
            Err(SchemaError::ColumnCount { expected: 5, found: 2 })
        );
        let no_tin = StringRecord::from(vec![MISSING, "x", "1", MISSING, "2022-01-01"]);
        assert_eq!(
            Row::from_record(DatasetKind::Empl, &no_tin),
            Err(SchemaError::MissingField("tin"))
        );
        let no_date = StringRecord::from(vec!["1", "x", "1", MISSING, MISSING]);
        assert_eq!(
            Row::from_record(DatasetKind::Empl, &no_date),
            Err(SchemaError::MissingField("snapshot_date"))
        );
    }
}
