//! Per-tab orchestration: tab selection, header discovery, row streaming,
//! and outcome bucketing. One bad row or tab never halts the run.

use std::collections::HashSet;

use tracing::{debug, warn};
use uuid::Uuid;

use dds_core::{SkipCounts, SkipReason};

use crate::columns::{find_header_row, map_columns};
use crate::domain::SheetDomain;
use crate::transform::{RowOutcome, RowReader, TransformContext};
use crate::workbook::{Sheet, Workbook};

/// What happened inside one selected tab.
#[derive(Debug, Clone, Default)]
pub struct TabReport {
    pub sheet: String,
    pub rows_seen: usize,
    pub added: usize,
    pub skips: SkipCounts,
    /// Per-row validation failures, with 1-based row numbers.
    pub row_errors: Vec<String>,
    /// Structural failure that made the whole tab unprocessable.
    pub error: Option<String>,
    /// 1-based row number → id minted for a row the sheet left unidentified.
    pub generated_ids: Vec<(usize, Uuid)>,
}

impl TabReport {
    pub fn skipped(&self) -> usize {
        self.skips.total()
    }
}

/// Aggregate outcome of one domain pass over a workbook.
#[derive(Debug, Default)]
pub struct ProcessOutcome<R> {
    pub records: Vec<R>,
    pub tabs: Vec<TabReport>,
}

impl<R> ProcessOutcome<R> {
    pub fn rows_seen(&self) -> usize {
        self.tabs.iter().map(|t| t.rows_seen).sum()
    }

    pub fn skipped(&self) -> usize {
        self.tabs.iter().map(|t| t.skipped()).sum()
    }

    pub fn row_errors(&self) -> usize {
        self.tabs.iter().map(|t| t.row_errors.len()).sum()
    }

    pub fn tab_errors(&self) -> usize {
        self.tabs.iter().filter(|t| t.error.is_some()).count()
    }

    pub fn generated_ids(&self) -> usize {
        self.tabs.iter().map(|t| t.generated_ids.len()).sum()
    }
}

/// Run one domain over every matching tab of the workbook. The outcome
/// always covers every selected tab, failed or not.
pub fn process_workbook<D: SheetDomain>(
    workbook: &Workbook,
    domain: &D,
    ctx: &TransformContext,
) -> ProcessOutcome<D::Record> {
    let mut outcome = ProcessOutcome {
        records: Vec::new(),
        tabs: Vec::new(),
    };
    let mut seen_ids: HashSet<Uuid> = HashSet::new();

    for sheet in &workbook.sheets {
        if !domain.tab_matches(&sheet.name) {
            debug!(tab = %sheet.name, domain = domain.name(), "tab not selected");
            continue;
        }
        let report = process_tab(sheet, domain, ctx, &mut seen_ids, &mut outcome.records);
        outcome.tabs.push(report);
    }
    outcome
}

fn process_tab<D: SheetDomain>(
    sheet: &Sheet,
    domain: &D,
    ctx: &TransformContext,
    seen_ids: &mut HashSet<Uuid>,
    records: &mut Vec<D::Record>,
) -> TabReport {
    let mut report = TabReport {
        sheet: sheet.name.clone(),
        ..TabReport::default()
    };

    if sheet.rows.is_empty() {
        report.error = Some("tab is empty".to_string());
        return report;
    }

    let header_row = find_header_row(&sheet.rows);
    let mapping = map_columns(&sheet.rows[header_row], domain.fields());
    let missing = mapping.missing_required(domain.fields());
    if !missing.is_empty() {
        report.error = Some(format!("missing required columns: {}", missing.join(", ")));
        warn!(
            tab = %sheet.name,
            columns = ?missing,
            "tab skipped: required headers not found"
        );
        return report;
    }

    for (row_index, row) in sheet.rows.iter().enumerate().skip(header_row + 1) {
        if row.iter().all(|c| c.is_empty()) {
            continue;
        }
        report.rows_seen += 1;
        let reader = RowReader::new(&mapping, row);
        match domain.build_row(&reader, ctx) {
            Ok(RowOutcome::Record(transformed)) => {
                if !seen_ids.insert(transformed.id) {
                    report.skips.bump(SkipReason::DuplicateId);
                    continue;
                }
                if transformed.id_generated {
                    report.generated_ids.push((row_index + 1, transformed.id));
                }
                records.push(transformed.record);
                report.added += 1;
            }
            Ok(RowOutcome::Skip(reason)) => report.skips.bump(reason),
            Err(err) => report.row_errors.push(format!("row {}: {err}", row_index + 1)),
        }
    }
    report
}
