//! Sync orchestration: credentials, audit logging, notification, and the
//! end-to-end pipeline from workbook export to dashboard import endpoint.
//!
//! A run moves through validate-credentials → process-tabs → send-batches →
//! log-summary. The summary row is written on every path out, including
//! total failure; only fatal configuration errors abort a run.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use dds_core::{RunStatus, SyncRunSummary};
use dds_sheets::{process_workbook, SheetDomain, TransformContext, Workbook};
use dds_transport::{ErrorCategory, ImportClient, ImportClientConfig, RetryPolicy, SourceMeta};

pub const RUN_LOG_FILE: &str = "sync_runs.csv";
pub const EVENT_LOG_FILE: &str = "sync_events.csv";

const RUN_LOG_HEADERS: [&str; 15] = [
    "started_at",
    "status",
    "tabs",
    "rows_seen",
    "added",
    "skipped",
    "row_errors",
    "tab_errors",
    "generated_ids",
    "batches",
    "created",
    "updated",
    "duration_ms",
    "session_id",
    "error",
];

const EVENT_LOG_HEADERS: [&str; 8] = [
    "timestamp",
    "level",
    "operation",
    "message",
    "context",
    "extra",
    "session_id",
    "user",
];

/// Fatal configuration problems; these abort the run after logging.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} could not be read: {1}")]
    Unreadable(PathBuf, #[source] std::io::Error),
    #[error("config file {0} is not valid yaml: {1}")]
    Invalid(PathBuf, #[source] serde_yaml::Error),
    #[error("base url is missing")]
    MissingBaseUrl,
    #[error("api key is missing")]
    MissingApiKey,
    #[error("no clinic id configured for location {0}")]
    UnknownLocation(String),
}

/// One tenant: a practice location and its dashboard clinic id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationCredential {
    pub code: String,
    pub clinic_id: String,
    /// Default provider for hygiene tabs that carry no provider column.
    #[serde(default)]
    pub provider_code: Option<String>,
}

/// Flat credential/settings store, read fresh at the start of every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub api_key: String,
    pub import_path: String,
    pub data_source_id: Option<String>,
    pub locations: Vec<LocationCredential>,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    pub http_timeout_secs: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub log_dir: PathBuf,
    pub log_max_entries: usize,
    pub log_max_age_days: i64,
    /// Mail-relay webhook for critical failure alerts; unset disables them.
    pub notify_url: Option<String>,
    pub notify_to: Option<String>,
    pub schedule_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            import_path: "api/sheets/import".to_string(),
            data_source_id: None,
            locations: Vec::new(),
            batch_size: 50,
            batch_pause_ms: 500,
            http_timeout_secs: 20,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            log_dir: PathBuf::from("logs"),
            log_max_entries: 2000,
            log_max_age_days: 90,
            notify_url: None,
            notify_to: None,
            schedule_cron: "0 30 5 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load from `DDS_CONFIG` (default `dds.yaml`), then let env vars
    /// override the secrets so keys can stay out of the file.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("DDS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("dds.yaml"));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(path.to_path_buf(), e))?;
        let mut config: SyncConfig = serde_yaml::from_str(&text)
            .map_err(|e| ConfigError::Invalid(path.to_path_buf(), e))?;
        if let Ok(url) = std::env::var("DDS_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(key) = std::env::var("DDS_API_KEY") {
            config.api_key = key;
        }
        Ok(config)
    }

    /// Fatal-class validation; anything flagged here aborts the run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::MissingBaseUrl);
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        Ok(())
    }

    pub fn clinic_for(&self, location: &str) -> Result<&LocationCredential, ConfigError> {
        self.locations
            .iter()
            .find(|l| l.code.eq_ignore_ascii_case(location))
            .ok_or_else(|| ConfigError::UnknownLocation(location.to_string()))
    }

    pub fn client_config(&self) -> ImportClientConfig {
        ImportClientConfig {
            base_url: self.base_url.clone(),
            import_path: self.import_path.clone(),
            api_key: self.api_key.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            batch_size: self.batch_size,
            batch_pause: Duration::from_millis(self.batch_pause_ms),
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
        }
    }
}

/// Hex sha256 of the workbook file, recorded with the run-start event so
/// re-imports of an unchanged export are visible in the audit trail.
pub fn file_checksum(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Side-effecting alert channel for critical failure classes. A notifier
/// that fails is logged and swallowed, never propagated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// Default: alerts disabled.
#[derive(Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _subject: &str, _body: &str) -> Result<()> {
        Ok(())
    }
}

/// Posts alerts to a mail-relay webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    to: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: String, to: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building notifier http client")?;
        Ok(Self { client, url, to })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({ "to": self.to, "subject": subject, "body": body }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Test double that records every alert it is handed.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("notifier lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .expect("notifier lock")
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Severity for the structured event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Append-only audit logs with size/age pruning. Headers are written on
/// first use; existing rows are never updated.
pub struct RunLog {
    dir: PathBuf,
    max_entries: usize,
    max_age_days: i64,
    user: String,
}

impl RunLog {
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize, max_age_days: i64) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            dir: dir.into(),
            max_entries,
            max_age_days,
            user,
        }
    }

    /// One row per run, written even when the run failed outright.
    pub fn append_summary(&self, summary: &SyncRunSummary) -> Result<()> {
        let row = vec![
            summary.started_at.to_rfc3339(),
            summary.status.as_str().to_string(),
            summary.tabs_selected.to_string(),
            summary.rows_seen.to_string(),
            summary.records_added.to_string(),
            summary.rows_skipped.to_string(),
            summary.row_errors.to_string(),
            summary.tab_errors.to_string(),
            summary.generated_ids.to_string(),
            summary.batches_sent.to_string(),
            summary.created.to_string(),
            summary.updated.to_string(),
            summary.duration_ms().to_string(),
            summary.session_id.to_string(),
            summary.error.clone().unwrap_or_default(),
        ];
        append_row(&self.dir.join(RUN_LOG_FILE), &RUN_LOG_HEADERS, &row)?;
        self.prune(&self.dir.join(RUN_LOG_FILE));
        self.prune(&self.dir.join(EVENT_LOG_FILE));
        Ok(())
    }

    /// Structured operational event; best-effort, failures only warn.
    pub fn event(
        &self,
        session_id: Uuid,
        level: EventLevel,
        operation: &str,
        message: &str,
        context: Option<serde_json::Value>,
        extra: Option<serde_json::Value>,
    ) {
        let row = vec![
            Utc::now().to_rfc3339(),
            level.as_str().to_string(),
            operation.to_string(),
            message.to_string(),
            context.map(|c| c.to_string()).unwrap_or_default(),
            extra.map(|e| e.to_string()).unwrap_or_default(),
            session_id.to_string(),
            self.user.clone(),
        ];
        if let Err(err) = append_row(&self.dir.join(EVENT_LOG_FILE), &EVENT_LOG_HEADERS, &row) {
            warn!(%err, operation, "failed to append event log row");
        }
    }

    fn prune(&self, path: &Path) {
        if let Err(err) = prune_log(path, self.max_entries, self.max_age_days) {
            warn!(path = %path.display(), %err, "log pruning failed");
        }
    }
}

fn append_row(path: &Path, headers: &[&str], row: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let fresh = !path.exists();
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if fresh {
        writer.write_record(headers)?;
    }
    writer.write_record(row)?;
    writer.flush()?;
    Ok(())
}

/// Drop oldest entries once a log exceeds the entry ceiling or rows age
/// past the retention window. The first column of both logs is rfc3339.
fn prune_log(path: &Path, max_entries: usize, max_age_days: i64) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut rows: Vec<csv::StringRecord> = Vec::new();
    for record in reader.records() {
        rows.push(record?);
    }
    if rows.len() <= 1 {
        return Ok(());
    }
    let header = rows.remove(0);
    let total = rows.len();
    let cutoff = Utc::now() - chrono::Duration::days(max_age_days);

    let mut retained: Vec<csv::StringRecord> = rows
        .into_iter()
        .filter(|row| {
            row.get(0)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc) >= cutoff)
                // Rows with unreadable timestamps are left alone.
                .unwrap_or(true)
        })
        .collect();
    if retained.len() > max_entries {
        retained.drain(..retained.len() - max_entries);
    }
    if retained.len() == total {
        return Ok(());
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(&header)?;
    for row in &retained {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Default)]
struct RunStats {
    tabs_selected: usize,
    rows_seen: usize,
    records_added: usize,
    rows_skipped: usize,
    row_errors: usize,
    tab_errors: usize,
    generated_ids: usize,
    batches_sent: usize,
    failed_batches: usize,
    created: u64,
    updated: u64,
    batch_error: Option<String>,
    critical: Option<ErrorCategory>,
}

impl RunStats {
    fn status(&self) -> RunStatus {
        if self.tab_errors > 0 || self.row_errors > 0 || self.failed_batches > 0 {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        }
    }
}

/// End-to-end pipeline for one sync domain against one location.
pub struct SyncPipeline<D: SheetDomain> {
    config: SyncConfig,
    domain: D,
    client: ImportClient,
    runlog: RunLog,
    notifier: Box<dyn Notifier>,
}

impl<D: SheetDomain> SyncPipeline<D> {
    pub fn new(config: SyncConfig, domain: D) -> Result<Self> {
        let client = ImportClient::new(config.client_config())?;
        let runlog = RunLog::new(
            &config.log_dir,
            config.log_max_entries,
            config.log_max_age_days,
        );
        let notifier: Box<dyn Notifier> = match &config.notify_url {
            Some(url) => Box::new(WebhookNotifier::new(url.clone(), config.notify_to.clone())?),
            None => Box::new(NoopNotifier),
        };
        Ok(Self {
            config,
            domain,
            client,
            runlog,
            notifier,
        })
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One complete run. The summary row is written on every path out;
    /// critical transport failures additionally raise a notification.
    pub async fn run_once(&self, workbook_path: &Path, location: &str) -> Result<SyncRunSummary> {
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();

        let result = self.execute(session_id, workbook_path, location).await;
        let summary = summarize(session_id, started_at, &result);
        if let Err(err) = self.runlog.append_summary(&summary) {
            warn!(%err, "failed to append run summary");
        }
        if let Ok(stats) = &result {
            if let Some(category) = stats.critical {
                self.escalate(&summary, category).await;
            }
        }

        match result {
            Ok(_) => Ok(summary),
            Err(err) => Err(err),
        }
    }

    /// Dry-run credential check: one synthetic record, nothing persisted.
    pub async fn test_connection(&self, location: &str) -> Result<()> {
        self.config.validate()?;
        let credential = self.config.clinic_for(location)?;
        let probe = self.domain.probe_record(Local::now().date_naive());
        let meta = SourceMeta {
            clinic_id: credential.clinic_id.clone(),
            data_source_id: self.config.data_source_id.clone(),
            spreadsheet_id: None,
            spreadsheet_name: "connection-test".to_string(),
            sheet_name: "connection-test".to_string(),
        };
        self.client
            .test_connection(&probe, &meta)
            .await
            .map(|_| ())
            .context("connection test failed")
    }

    async fn execute(
        &self,
        session_id: Uuid,
        workbook_path: &Path,
        location: &str,
    ) -> Result<RunStats> {
        self.config.validate()?;
        let credential = self.config.clinic_for(location)?.clone();

        self.runlog.event(
            session_id,
            EventLevel::Info,
            "sync",
            &format!("run started for location {location}"),
            Some(json!({
                "workbook": workbook_path.display().to_string(),
                "checksum": file_checksum(workbook_path).ok(),
                "domain": self.domain.name(),
            })),
            None,
        );

        let workbook = Workbook::open(workbook_path)?;
        let ctx = TransformContext {
            today: Local::now().date_naive(),
        };
        let outcome = process_workbook(&workbook, &self.domain, &ctx);

        for tab in &outcome.tabs {
            if let Some(error) = &tab.error {
                self.runlog.event(
                    session_id,
                    EventLevel::Error,
                    "process_tab",
                    error,
                    Some(json!({ "tab": tab.sheet })),
                    None,
                );
            }
            for row_error in &tab.row_errors {
                self.runlog.event(
                    session_id,
                    EventLevel::Warning,
                    "transform_row",
                    row_error,
                    Some(json!({ "tab": tab.sheet })),
                    None,
                );
            }
        }
        if outcome.generated_ids() > 0 {
            self.runlog.event(
                session_id,
                EventLevel::Warning,
                "transform_row",
                "rows without ids were assigned fresh ones; write them back to keep re-syncs idempotent",
                Some(json!({ "count": outcome.generated_ids() })),
                None,
            );
        }

        let mut stats = RunStats {
            tabs_selected: outcome.tabs.len(),
            rows_seen: outcome.rows_seen(),
            records_added: outcome.records.len(),
            rows_skipped: outcome.skipped(),
            row_errors: outcome.row_errors(),
            tab_errors: outcome.tab_errors(),
            generated_ids: outcome.generated_ids(),
            ..RunStats::default()
        };
        if outcome.records.is_empty() {
            info!(location, tabs = stats.tabs_selected, "no records to send");
            return Ok(stats);
        }

        let tab_names: Vec<&str> = outcome.tabs.iter().map(|t| t.sheet.as_str()).collect();
        let meta = SourceMeta {
            clinic_id: credential.clinic_id.clone(),
            data_source_id: self.config.data_source_id.clone(),
            spreadsheet_id: None,
            spreadsheet_name: workbook.name.clone(),
            sheet_name: tab_names.join(", "),
        };
        let import = self
            .client
            .send_records(&outcome.records, &meta, true, false)
            .await;

        stats.batches_sent = import.batches.len();
        stats.failed_batches = import.failed_batches();
        stats.created = import.created();
        stats.updated = import.updated();
        if let Some(err) = import.first_error() {
            let category = err.category();
            stats.batch_error = Some(err.to_string());
            if category.is_critical() {
                stats.critical = Some(category);
            }
            self.runlog.event(
                session_id,
                EventLevel::Error,
                "send_batch",
                &err.to_string(),
                Some(json!({ "category": category.as_str() })),
                None,
            );
        }

        info!(
            location,
            added = stats.records_added,
            skipped = stats.rows_skipped,
            batches = stats.batches_sent,
            failed_batches = stats.failed_batches,
            "sync run finished"
        );
        Ok(stats)
    }

    async fn escalate(&self, summary: &SyncRunSummary, category: ErrorCategory) {
        let subject = format!("sheet sync {} failure", category.as_str());
        let body = format!(
            "session {}\nstatus: {}\nbatches sent: {}\nerror: {}",
            summary.session_id,
            summary.status.as_str(),
            summary.batches_sent,
            summary.error.as_deref().unwrap_or("unknown"),
        );
        if let Err(err) = self.notifier.notify(&subject, &body).await {
            warn!(err = %format!("{err:#}"), "notification failed");
            self.runlog.event(
                summary.session_id,
                EventLevel::Warning,
                "notify",
                &format!("notification failed: {err:#}"),
                None,
                None,
            );
        }
    }
}

fn summarize(
    session_id: Uuid,
    started_at: DateTime<Utc>,
    result: &Result<RunStats>,
) -> SyncRunSummary {
    let finished_at = Utc::now();
    match result {
        Ok(stats) => SyncRunSummary {
            session_id,
            started_at,
            finished_at,
            status: stats.status(),
            tabs_selected: stats.tabs_selected,
            rows_seen: stats.rows_seen,
            records_added: stats.records_added,
            rows_skipped: stats.rows_skipped,
            row_errors: stats.row_errors,
            tab_errors: stats.tab_errors,
            generated_ids: stats.generated_ids,
            batches_sent: stats.batches_sent,
            created: stats.created,
            updated: stats.updated,
            error: stats.batch_error.clone(),
        },
        Err(err) => SyncRunSummary {
            session_id,
            started_at,
            finished_at,
            status: RunStatus::Failed,
            tabs_selected: 0,
            rows_seen: 0,
            records_added: 0,
            rows_skipped: 0,
            row_errors: 0,
            tab_errors: 0,
            generated_ids: 0,
            batches_sent: 0,
            created: 0,
            updated: 0,
            error: Some(format!("{err:#}")),
        },
    }
}

/// Daily trigger: the job runs the same pipeline as a manual sync and
/// reports only through the logs and the notifier.
pub async fn build_scheduler<D>(
    pipeline: Arc<SyncPipeline<D>>,
    workbook: PathBuf,
    location: String,
) -> Result<JobScheduler>
where
    D: SheetDomain + Send + Sync + 'static,
    D::Record: Send + Sync,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().schedule_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let workbook = workbook.clone();
        let location = location.clone();
        Box::pin(async move {
            match pipeline.run_once(&workbook, &location).await {
                Ok(summary) => info!(
                    status = summary.status.as_str(),
                    added = summary.records_added,
                    "scheduled sync finished"
                ),
                Err(err) => warn!(err = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
