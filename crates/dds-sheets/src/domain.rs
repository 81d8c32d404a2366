//! Sync domains: which tabs belong to a domain and how its rows become
//! typed records. One domain instance is scoped to a single practice
//! location for the duration of a run.

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use dds_core::{FinancialRecord, HygieneRecord, SkipReason};

use crate::columns::FieldSpec;
use crate::transform::{
    check_money, check_non_negative, normalize_percent, RowError, RowOutcome, RowReader,
    TransformContext, TransformedRow,
};

/// Everything the processor needs to run one sync domain over a workbook.
pub trait SheetDomain {
    type Record: Serialize + Clone;

    fn name(&self) -> &'static str;

    /// Field table in matching priority order (specific before loose).
    fn fields(&self) -> &'static [FieldSpec];

    fn tab_matches(&self, tab_name: &str) -> bool;

    fn build_row(
        &self,
        reader: &RowReader<'_>,
        ctx: &TransformContext,
    ) -> Result<RowOutcome<Self::Record>, RowError>;

    /// Synthetic record for a dry-run credential check; never persisted.
    fn probe_record(&self, today: NaiveDate) -> Self::Record;
}

/// Tab names like "Jan 2024", "January '24", "2024-01", or "01/2024".
fn month_year_patterns() -> Vec<Regex> {
    [
        r"(?i)^(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s*'?\d{2,4}$",
        r"^\d{4}[-/]\d{1,2}$",
        r"^\d{1,2}[-/]\d{4}$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static tab pattern"))
    .collect()
}

fn tab_matches_patterns(patterns: &[Regex], code: &str, tab_name: &str) -> bool {
    let trimmed = tab_name.trim();
    if patterns.iter().any(|p| p.is_match(trimmed)) {
        return true;
    }
    // Location-prefixed tabs like "BV Jan 2024" or "BV-financials".
    let lower = trimmed.to_lowercase();
    let code = code.to_lowercase();
    lower == code
        || lower.starts_with(&format!("{code} "))
        || lower.starts_with(&format!("{code}-"))
}

const FINANCIAL_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "date",
        variants: &["date", "day"],
        required: true,
    },
    FieldSpec {
        name: "net_production",
        variants: &["net production", "net prod"],
        required: false,
    },
    FieldSpec {
        name: "production",
        variants: &["total production", "gross production", "production"],
        required: true,
    },
    FieldSpec {
        name: "adjustments",
        variants: &["adjustments", "adjustment"],
        required: false,
    },
    FieldSpec {
        name: "write_offs",
        variants: &["write-offs", "write offs", "writeoffs"],
        required: false,
    },
    FieldSpec {
        name: "collections",
        variants: &["total collections", "collections", "patient income"],
        required: false,
    },
    FieldSpec {
        name: "unearned",
        variants: &["unearned income", "unearned"],
        required: false,
    },
    FieldSpec {
        name: "uuid",
        variants: &["uuid", "row id"],
        required: false,
    },
];

/// Daily location financials: production, adjustments, write-offs,
/// collections.
pub struct FinancialDomain {
    location_code: String,
    tab_patterns: Vec<Regex>,
}

impl FinancialDomain {
    pub fn new(location_code: impl Into<String>) -> Self {
        Self {
            location_code: location_code.into(),
            tab_patterns: month_year_patterns(),
        }
    }
}

impl SheetDomain for FinancialDomain {
    type Record = FinancialRecord;

    fn name(&self) -> &'static str {
        "financials"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FINANCIAL_FIELDS
    }

    fn tab_matches(&self, tab_name: &str) -> bool {
        tab_matches_patterns(&self.tab_patterns, &self.location_code, tab_name)
    }

    fn build_row(
        &self,
        reader: &RowReader<'_>,
        ctx: &TransformContext,
    ) -> Result<RowOutcome<FinancialRecord>, RowError> {
        let Some(date) = reader.date("date") else {
            return Ok(RowOutcome::Skip(SkipReason::MissingDate));
        };
        if date > ctx.today {
            return Ok(RowOutcome::Skip(SkipReason::FutureDate));
        }
        let production = reader.numeric("production");
        if production.is_blank() {
            return Ok(RowOutcome::Skip(SkipReason::BlankAmount));
        }

        let production = check_non_negative("production", production)?;
        let adjustments = check_money("adjustments", reader.numeric("adjustments"))?;
        let write_offs = check_money("write_offs", reader.numeric("write_offs"))?;
        let net_production = check_money("net_production", reader.numeric("net_production"))?;
        let collections = check_money("collections", reader.numeric("collections"))?;
        let unearned = check_money("unearned", reader.numeric("unearned"))?;
        let (uuid, id_generated) = reader.uuid("uuid");

        Ok(RowOutcome::Record(TransformedRow {
            id: uuid,
            id_generated,
            record: FinancialRecord {
                uuid,
                date,
                location_code: self.location_code.clone(),
                production,
                adjustments,
                write_offs,
                net_production,
                collections,
                unearned,
            },
        }))
    }

    fn probe_record(&self, today: NaiveDate) -> FinancialRecord {
        FinancialRecord {
            uuid: Uuid::new_v4(),
            date: today,
            location_code: self.location_code.clone(),
            production: Some(0.0),
            adjustments: None,
            write_offs: None,
            net_production: None,
            collections: None,
            unearned: None,
        }
    }
}

const HYGIENE_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "date",
        variants: &["date", "day"],
        required: true,
    },
    FieldSpec {
        name: "production_goal",
        variants: &["production goal", "goal"],
        required: false,
    },
    FieldSpec {
        name: "verified_production",
        variants: &["verified production", "actual production"],
        required: true,
    },
    FieldSpec {
        name: "estimated_production",
        variants: &["estimated production", "scheduled production"],
        required: false,
    },
    FieldSpec {
        name: "hours_worked",
        variants: &["hours worked", "hours"],
        required: false,
    },
    FieldSpec {
        name: "variance_pct",
        variants: &["variance %", "variance percent", "% to goal", "variance"],
        required: false,
    },
    FieldSpec {
        name: "bonus",
        variants: &["bonus"],
        required: false,
    },
    FieldSpec {
        name: "provider",
        variants: &["provider", "hygienist"],
        required: false,
    },
    FieldSpec {
        name: "uuid",
        variants: &["uuid", "row id"],
        required: false,
    },
];

/// Daily hygiene production per provider: hours, goal, verified production,
/// variance against goal.
pub struct HygieneDomain {
    provider_code: String,
    tab_patterns: Vec<Regex>,
}

impl HygieneDomain {
    pub fn new(provider_code: impl Into<String>) -> Self {
        Self {
            provider_code: provider_code.into(),
            tab_patterns: month_year_patterns(),
        }
    }
}

impl SheetDomain for HygieneDomain {
    type Record = HygieneRecord;

    fn name(&self) -> &'static str {
        "hygiene"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        HYGIENE_FIELDS
    }

    fn tab_matches(&self, tab_name: &str) -> bool {
        tab_matches_patterns(&self.tab_patterns, &self.provider_code, tab_name)
    }

    fn build_row(
        &self,
        reader: &RowReader<'_>,
        ctx: &TransformContext,
    ) -> Result<RowOutcome<HygieneRecord>, RowError> {
        let Some(date) = reader.date("date") else {
            return Ok(RowOutcome::Skip(SkipReason::MissingDate));
        };
        if date > ctx.today {
            return Ok(RowOutcome::Skip(SkipReason::FutureDate));
        }
        let verified = reader.numeric("verified_production");
        if verified.is_blank() {
            return Ok(RowOutcome::Skip(SkipReason::BlankAmount));
        }

        let verified_production = check_non_negative("verified_production", verified)?;
        let estimated_production =
            check_non_negative("estimated_production", reader.numeric("estimated_production"))?;
        let production_goal =
            check_non_negative("production_goal", reader.numeric("production_goal"))?;
        let hours_worked = reader.numeric("hours_worked").value();
        let variance_pct = reader
            .numeric("variance_pct")
            .value()
            .map(normalize_percent);
        let bonus = check_money("bonus", reader.numeric("bonus"))?;
        let provider_code = reader
            .text("provider")
            .unwrap_or_else(|| self.provider_code.clone());
        let (uuid, id_generated) = reader.uuid("uuid");

        Ok(RowOutcome::Record(TransformedRow {
            id: uuid,
            id_generated,
            record: HygieneRecord {
                uuid,
                date,
                provider_code,
                hours_worked,
                estimated_production,
                verified_production,
                production_goal,
                variance_pct,
                bonus,
            },
        }))
    }

    fn probe_record(&self, today: NaiveDate) -> HygieneRecord {
        HygieneRecord {
            uuid: Uuid::new_v4(),
            date: today,
            provider_code: self.provider_code.clone(),
            hours_worked: None,
            estimated_production: None,
            verified_production: Some(0.0),
            production_goal: None,
            variance_pct: None,
            bonus: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::map_columns;
    use crate::workbook::CellValue;

    fn text_row(cells: &[&str]) -> Vec<CellValue> {
        cells
            .iter()
            .map(|c| {
                if c.is_empty() {
                    CellValue::Empty
                } else {
                    CellValue::Text(c.to_string())
                }
            })
            .collect()
    }

    fn ctx() -> TransformContext {
        TransformContext {
            today: NaiveDate::from_ymd_opt(2024, 6, 15).expect("valid date"),
        }
    }

    #[test]
    fn month_year_tabs_are_selected() {
        let domain = FinancialDomain::new("BV");
        assert!(domain.tab_matches("Jan 2024"));
        assert!(domain.tab_matches("January '24"));
        assert!(domain.tab_matches("2024-01"));
        assert!(domain.tab_matches("01/2024"));
        assert!(domain.tab_matches("BV Jan 2024"));
        assert!(domain.tab_matches("bv-financials"));
        assert!(!domain.tab_matches("Notes"));
        assert!(!domain.tab_matches("Sync Log"));
    }

    #[test]
    fn financial_row_builds_with_cleaned_money() {
        let domain = FinancialDomain::new("BV");
        let header = text_row(&["Date", "Production", "Adjustments"]);
        let mapping = map_columns(&header, domain.fields());
        let row = text_row(&["2024-01-05", "$1,234.56", "($50.00)"]);
        let reader = RowReader::new(&mapping, &row);

        let outcome = domain.build_row(&reader, &ctx()).expect("build");
        let RowOutcome::Record(transformed) = outcome else {
            panic!("expected a record");
        };
        assert_eq!(transformed.record.production, Some(1234.56));
        assert_eq!(transformed.record.adjustments, Some(-50.0));
        assert_eq!(transformed.record.location_code, "BV");
        assert!(transformed.id_generated);
    }

    #[test]
    fn bad_dates_skip_and_never_error() {
        let domain = FinancialDomain::new("BV");
        let header = text_row(&["Date", "Production"]);
        let mapping = map_columns(&header, domain.fields());

        for (date_cell, expected) in [
            ("", SkipReason::MissingDate),
            ("not a date", SkipReason::MissingDate),
            ("2030-01-01", SkipReason::FutureDate),
        ] {
            let row = text_row(&[date_cell, "$100.00"]);
            let reader = RowReader::new(&mapping, &row);
            let outcome = domain.build_row(&reader, &ctx()).expect("never an error");
            assert_eq!(outcome, RowOutcome::Skip(expected));
        }
    }

    #[test]
    fn blank_amount_skips_but_zero_does_not() {
        let domain = FinancialDomain::new("BV");
        let header = text_row(&["Date", "Production"]);
        let mapping = map_columns(&header, domain.fields());

        let row = text_row(&["2024-01-05", ""]);
        let reader = RowReader::new(&mapping, &row);
        assert_eq!(
            domain.build_row(&reader, &ctx()).expect("skip"),
            RowOutcome::Skip(SkipReason::BlankAmount)
        );

        let row = text_row(&["2024-01-05", "0"]);
        let reader = RowReader::new(&mapping, &row);
        let outcome = domain.build_row(&reader, &ctx()).expect("record");
        let RowOutcome::Record(transformed) = outcome else {
            panic!("zero production is a valid record");
        };
        assert_eq!(transformed.record.production, Some(0.0));
    }

    #[test]
    fn negative_production_is_a_row_error() {
        let domain = FinancialDomain::new("BV");
        let header = text_row(&["Date", "Production"]);
        let mapping = map_columns(&header, domain.fields());
        let row = text_row(&["2024-01-05", "($25.00)"]);
        let reader = RowReader::new(&mapping, &row);

        let err = domain.build_row(&reader, &ctx()).expect_err("range error");
        assert!(err.to_string().contains("production"));
    }

    #[test]
    fn existing_uuid_is_kept() {
        let domain = FinancialDomain::new("BV");
        let header = text_row(&["Date", "Production", "UUID"]);
        let mapping = map_columns(&header, domain.fields());
        let row = text_row(&[
            "2024-01-05",
            "100",
            "0a6289c2-5b4e-4bb7-8aa7-3f2f2be01f2d",
        ]);
        let reader = RowReader::new(&mapping, &row);

        let RowOutcome::Record(transformed) =
            domain.build_row(&reader, &ctx()).expect("record")
        else {
            panic!("expected record");
        };
        assert!(!transformed.id_generated);
        assert_eq!(
            transformed.id.to_string(),
            "0a6289c2-5b4e-4bb7-8aa7-3f2f2be01f2d"
        );
    }

    #[test]
    fn hygiene_variance_points_are_normalized() {
        let domain = HygieneDomain::new("adriane");
        let header = text_row(&["Date", "Verified Production", "Variance %"]);
        let mapping = map_columns(&header, domain.fields());
        let row = text_row(&["2024-01-05", "$950.00", "85%"]);
        let reader = RowReader::new(&mapping, &row);

        let RowOutcome::Record(transformed) =
            domain.build_row(&reader, &ctx()).expect("record")
        else {
            panic!("expected record");
        };
        assert_eq!(transformed.record.variance_pct, Some(0.85));
        assert_eq!(transformed.record.verified_production, Some(950.0));
        assert_eq!(transformed.record.provider_code, "adriane");
    }

    #[test]
    fn hygiene_goal_column_is_not_claimed_by_production() {
        let domain = HygieneDomain::new("adriane");
        let header = text_row(&["Date", "Production Goal", "Verified Production"]);
        let mapping = map_columns(&header, domain.fields());
        assert_eq!(mapping.index_of("production_goal"), Some(1));
        assert_eq!(mapping.index_of("verified_production"), Some(2));
    }
}
