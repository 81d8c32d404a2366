//! Row-level cleaning and validation: dates, money, percentages, row ids.
//!
//! A row transforms into a record, a silent skip, or a row error. Skips are
//! expected (spreadsheets carry notes, totals, and placeholder rows); only
//! range violations count as errors.

use chrono::{Duration, NaiveDate};
use thiserror::Error;
use uuid::Uuid;

use dds_core::SkipReason;

use crate::columns::ColumnMapping;
use crate::workbook::CellValue;

/// Sane bounds for monetary cells; anything outside is a row error.
pub const MONEY_MIN: f64 = -1_000_000.0;
pub const MONEY_MAX: f64 = 10_000_000.0;

/// Run-local inputs shared by every row of one sync invocation.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext {
    /// Midnight-normalized "today"; rows dated after this are placeholders.
    pub today: NaiveDate,
}

#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("{field} value {value} outside allowed range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// A transformed row plus the identity bookkeeping the processor needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRow<R> {
    pub record: R,
    pub id: Uuid,
    /// True when the sheet had no id and one was minted for this run; the
    /// caller must write it back or the next run re-creates the row.
    pub id_generated: bool,
}

/// Outcome of transforming one raw row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome<R> {
    Record(TransformedRow<R>),
    Skip(SkipReason),
}

/// A numeric cell is blank, a clean value, or garbage. Blank is a skip
/// condition for required amounts; garbage becomes `None`, never zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericCell {
    Blank,
    Value(f64),
    Unparseable,
}

impl NumericCell {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_blank(self) -> bool {
        matches!(self, Self::Blank)
    }
}

/// Positional access to one raw row through its tab's column mapping.
#[derive(Debug, Clone, Copy)]
pub struct RowReader<'a> {
    mapping: &'a ColumnMapping,
    row: &'a [CellValue],
}

impl<'a> RowReader<'a> {
    pub fn new(mapping: &'a ColumnMapping, row: &'a [CellValue]) -> Self {
        Self { mapping, row }
    }

    pub fn date(&self, field: &str) -> Option<NaiveDate> {
        read_date(self.mapping.cell(field, self.row))
    }

    pub fn numeric(&self, field: &str) -> NumericCell {
        read_numeric(self.mapping.cell(field, self.row))
    }

    pub fn text(&self, field: &str) -> Option<String> {
        self.mapping
            .cell(field, self.row)
            .and_then(|c| c.as_text())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
    }

    /// Existing row id, or a freshly minted one. Fresh ids are random by
    /// design: they are scoped to this run, not derived from content.
    pub fn uuid(&self, field: &str) -> (Uuid, bool) {
        if let Some(text) = self.mapping.cell(field, self.row).and_then(|c| c.as_text()) {
            if let Ok(id) = Uuid::parse_str(text) {
                return (id, false);
            }
        }
        (Uuid::new_v4(), true)
    }
}

/// Strip currency symbols, thousands separators, percent signs, and stray
/// quotes, then parse. Parenthesized values are negative.
pub fn read_numeric(cell: Option<&CellValue>) -> NumericCell {
    let Some(cell) = cell else {
        return NumericCell::Blank;
    };
    match cell {
        CellValue::Empty => NumericCell::Blank,
        CellValue::Number(n) => NumericCell::Value(*n),
        CellValue::Bool(_) => NumericCell::Unparseable,
        CellValue::Text(raw) => {
            if raw.trim().is_empty() {
                return NumericCell::Blank;
            }
            let cleaned: String = raw
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | '%' | '"' | ' '))
                .collect();
            let (digits, negative) = match cleaned
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
            {
                Some(inner) => (inner, true),
                None => (cleaned.as_str(), false),
            };
            match digits.parse::<f64>() {
                Ok(v) if negative => NumericCell::Value(-v),
                Ok(v) => NumericCell::Value(v),
                Err(_) => NumericCell::Unparseable,
            }
        }
    }
}

/// Excel's day-serial epoch (1899-12-30, accounting for the 1900 leap bug).
pub fn date_from_serial(serial: f64) -> Option<NaiveDate> {
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(Duration::days(serial as i64))
}

const TEXT_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%B %d, %Y", "%b %d, %Y"];

/// Best-effort date read: Excel serials, ISO, and US month/day/year text.
pub fn read_date(cell: Option<&CellValue>) -> Option<NaiveDate> {
    match cell? {
        CellValue::Number(serial) if *serial > 0.0 => date_from_serial(*serial),
        CellValue::Text(raw) => {
            let raw = raw.trim();
            TEXT_DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        }
        _ => None,
    }
}

/// Monetary cell within the global sane range; blank and unparseable cells
/// become `None` without erroring.
pub fn check_money(field: &'static str, cell: NumericCell) -> Result<Option<f64>, RowError> {
    bounded(field, cell, MONEY_MIN, MONEY_MAX)
}

/// Production-style amounts must not be negative.
pub fn check_non_negative(field: &'static str, cell: NumericCell) -> Result<Option<f64>, RowError> {
    bounded(field, cell, 0.0, MONEY_MAX)
}

fn bounded(
    field: &'static str,
    cell: NumericCell,
    min: f64,
    max: f64,
) -> Result<Option<f64>, RowError> {
    match cell {
        NumericCell::Value(value) if !(min..=max).contains(&value) => Err(RowError::OutOfRange {
            field,
            value,
            min,
            max,
        }),
        NumericCell::Value(value) => Ok(Some(value)),
        _ => Ok(None),
    }
}

/// Sheets report variance either as a fraction (0.85) or in percentage
/// points (85). Values above 1 are scaled down; exactly 1.0 is ambiguous
/// and left untouched.
pub fn normalize_percent(value: f64) -> f64 {
    if value > 1.0 {
        value / 100.0
    } else {
        value
    }
}
