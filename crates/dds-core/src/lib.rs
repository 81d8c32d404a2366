//! Core domain model for the dental dashboard sheet sync.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One day of location-level financial figures parsed from a sheet row.
///
/// Monetary fields are optional: a cell the sheet left blank or filled with
/// something unparseable stays `None`, which the endpoint treats as "no
/// figure reported" rather than zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialRecord {
    pub uuid: Uuid,
    pub date: NaiveDate,
    pub location_code: String,
    pub production: Option<f64>,
    pub adjustments: Option<f64>,
    pub write_offs: Option<f64>,
    pub net_production: Option<f64>,
    pub collections: Option<f64>,
    pub unearned: Option<f64>,
}

/// One day of hygiene production for a single provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HygieneRecord {
    pub uuid: Uuid,
    pub date: NaiveDate,
    pub provider_code: String,
    pub hours_worked: Option<f64>,
    pub estimated_production: Option<f64>,
    pub verified_production: Option<f64>,
    pub production_goal: Option<f64>,
    /// Fraction of goal, normalized from sheets that report percentage points.
    pub variance_pct: Option<f64>,
    pub bonus: Option<f64>,
}

/// Why a row was excluded without being counted as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingDate,
    FutureDate,
    BlankAmount,
    DuplicateId,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingDate => "missing_date",
            Self::FutureDate => "future_date",
            Self::BlankAmount => "blank_amount",
            Self::DuplicateId => "duplicate_id",
        }
    }
}

/// Tally of silently excluded rows, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    pub missing_date: usize,
    pub future_date: usize,
    pub blank_amount: usize,
    pub duplicate_id: usize,
}

impl SkipCounts {
    pub fn bump(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::MissingDate => self.missing_date += 1,
            SkipReason::FutureDate => self.future_date += 1,
            SkipReason::BlankAmount => self.blank_amount += 1,
            SkipReason::DuplicateId => self.duplicate_id += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.missing_date + self.future_date + self.blank_amount + self.duplicate_id
    }
}

/// Terminal status of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }
}

/// Audit row appended to the run log after every invocation, success or not.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub tabs_selected: usize,
    pub rows_seen: usize,
    pub records_added: usize,
    pub rows_skipped: usize,
    pub row_errors: usize,
    pub tab_errors: usize,
    pub generated_ids: usize,
    pub batches_sent: usize,
    pub created: u64,
    pub updated: u64,
    pub error: Option<String>,
}

impl SyncRunSummary {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
