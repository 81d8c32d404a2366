//! Batched HTTP import client for the dashboard endpoint.
//!
//! Records are sent in fixed-size chunks with bearer auth and an upsert
//! flag so re-sending an unchanged batch updates instead of duplicating.
//! Rate limits and server errors retry with exponential backoff; other
//! rejections fail the batch immediately while later batches continue.

use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Broad failure classes used for notification escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    Quota,
    Timeout,
    Network,
    Server,
    Validation,
    Other,
}

impl ErrorCategory {
    /// Categories that warrant waking a human.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Authentication | Self::Authorization | Self::Quota | Self::Timeout | Self::Network
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Quota => "quota",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Server => "server",
            Self::Validation => "validation",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("import endpoint rejected batch with http {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("retries exhausted after {attempts} attempts, last http {status}")]
    RetriesExhausted { attempts: usize, status: u16 },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl TransportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Rejected { status: 401, .. } => ErrorCategory::Authentication,
            Self::Rejected { status: 403, .. } => ErrorCategory::Authorization,
            Self::Rejected { .. } => ErrorCategory::Validation,
            Self::RetriesExhausted { status: 429, .. } => ErrorCategory::Quota,
            Self::RetriesExhausted { .. } => ErrorCategory::Server,
            Self::Request(err) if err.is_timeout() => ErrorCategory::Timeout,
            Self::Request(err) if err.is_connect() => ErrorCategory::Network,
            Self::Request(_) => ErrorCategory::Other,
        }
    }
}

/// Retry policy for transient failures: attempt ceiling, delay growth, and
/// optional jitter on top of the computed delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter; 0 disables.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for the zero-based attempt index, capped at
    /// `max_delay`, with jitter applied after the cap.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = delay.mul_f64(self.jitter.min(1.0));
        delay + spread.mul_f64(rand::thread_rng().gen::<f64>())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient_request_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Provenance echoed to the endpoint with every batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMeta {
    pub clinic_id: String,
    pub data_source_id: Option<String>,
    pub spreadsheet_id: Option<String>,
    pub spreadsheet_name: String,
    pub sheet_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportBody<'a, R: Serialize> {
    clinic_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_source_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spreadsheet_id: Option<&'a str>,
    spreadsheet_name: &'a str,
    sheet_name: &'a str,
    records: &'a [R],
    upsert: bool,
    dry_run: bool,
}

/// Per-batch created/updated counts from a 2xx response body.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportClientConfig {
    pub base_url: String,
    pub import_path: String,
    pub api_key: String,
    pub timeout: Duration,
    pub batch_size: usize,
    /// Pause between successive batches, regardless of outcome.
    pub batch_pause: Duration,
    pub retry: RetryPolicy,
}

impl Default for ImportClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            import_path: "api/sheets/import".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(20),
            batch_size: 50,
            batch_pause: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one outbound batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_index: usize,
    pub records: usize,
    pub attempts: usize,
    pub result: Result<BatchResponse, TransportError>,
}

/// Aggregate over every batch of one send.
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub batches: Vec<BatchOutcome>,
}

impl ImportSummary {
    pub fn records_sent(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.result.is_ok())
            .map(|b| b.records)
            .sum()
    }

    pub fn created(&self) -> u64 {
        self.batches
            .iter()
            .filter_map(|b| b.result.as_ref().ok())
            .map(|r| r.created)
            .sum()
    }

    pub fn updated(&self) -> u64 {
        self.batches
            .iter()
            .filter_map(|b| b.result.as_ref().ok())
            .map(|r| r.updated)
            .sum()
    }

    pub fn failed_batches(&self) -> usize {
        self.batches.iter().filter(|b| b.result.is_err()).count()
    }

    pub fn first_error(&self) -> Option<&TransportError> {
        self.batches
            .iter()
            .find_map(|b| b.result.as_ref().err())
    }
}

pub struct ImportClient {
    client: reqwest::Client,
    config: ImportClientConfig,
}

impl ImportClient {
    pub fn new(config: ImportClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client, config })
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.import_path.trim_start_matches('/')
        )
    }

    /// Send every record, chunked. A failed batch never stops later ones;
    /// the configured pause separates successive requests either way.
    pub async fn send_records<R: Serialize>(
        &self,
        records: &[R],
        meta: &SourceMeta,
        upsert: bool,
        dry_run: bool,
    ) -> ImportSummary {
        let mut summary = ImportSummary::default();
        let chunks: Vec<&[R]> = records.chunks(self.batch_size()).collect();
        let total = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let (attempts, result) = self.send_batch(chunk, meta, upsert, dry_run).await;
            match &result {
                Ok(response) => debug!(
                    batch = index,
                    records = chunk.len(),
                    created = response.created,
                    updated = response.updated,
                    "batch accepted"
                ),
                Err(err) => warn!(batch = index, attempts, %err, "batch failed"),
            }
            summary.batches.push(BatchOutcome {
                batch_index: index,
                records: chunk.len(),
                attempts,
                result,
            });
            if index + 1 < total && !self.config.batch_pause.is_zero() {
                tokio::time::sleep(self.config.batch_pause).await;
            }
        }
        summary
    }

    /// Credential check: one synthetic record with the dry-run flag set, so
    /// nothing is persisted upstream.
    pub async fn test_connection<R: Serialize>(
        &self,
        probe: &R,
        meta: &SourceMeta,
    ) -> Result<BatchResponse, TransportError> {
        let (_, result) = self
            .send_batch(std::slice::from_ref(probe), meta, false, true)
            .await;
        result
    }

    async fn send_batch<R: Serialize>(
        &self,
        records: &[R],
        meta: &SourceMeta,
        upsert: bool,
        dry_run: bool,
    ) -> (usize, Result<BatchResponse, TransportError>) {
        let body = ImportBody {
            clinic_id: &meta.clinic_id,
            data_source_id: meta.data_source_id.as_deref(),
            spreadsheet_id: meta.spreadsheet_id.as_deref(),
            spreadsheet_name: &meta.spreadsheet_name,
            sheet_name: &meta.sheet_name,
            records,
            upsert,
            dry_run,
        };
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_status = 0u16;

        while attempts < max_attempts {
            attempts += 1;
            let response = self
                .client
                .post(self.endpoint())
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed = resp.json::<BatchResponse>().await.unwrap_or_default();
                        return (attempts, Ok(parsed));
                    }
                    if is_transient_status(status) {
                        last_status = status.as_u16();
                        if attempts < max_attempts {
                            tokio::time::sleep(
                                self.config.retry.delay_for_attempt(attempts - 1),
                            )
                            .await;
                        }
                        continue;
                    }
                    let detail = read_error_detail(resp).await;
                    return (
                        attempts,
                        Err(TransportError::Rejected {
                            status: status.as_u16(),
                            detail,
                        }),
                    );
                }
                Err(err) => {
                    if is_transient_request_error(&err) && attempts < max_attempts {
                        tokio::time::sleep(self.config.retry.delay_for_attempt(attempts - 1))
                            .await;
                        continue;
                    }
                    return (attempts, Err(TransportError::Request(err)));
                }
            }
        }

        (
            attempts,
            Err(TransportError::RetriesExhausted {
                attempts,
                status: last_status,
            }),
        )
    }
}

async fn read_error_detail(resp: reqwest::Response) -> String {
    match resp.json::<ApiErrorBody>().await {
        Ok(body) => body
            .error
            .or(body.message)
            .unwrap_or_else(|| "no error detail".to_string()),
        Err(_) => "no error detail".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Serialize, Clone)]
    struct TestRecord {
        uuid: &'static str,
        production: f64,
    }

    fn record() -> TestRecord {
        TestRecord {
            uuid: "0a6289c2-5b4e-4bb7-8aa7-3f2f2be01f2d",
            production: 100.0,
        }
    }

    fn meta() -> SourceMeta {
        SourceMeta {
            clinic_id: "clinic-1".to_string(),
            data_source_id: Some("ds-1".to_string()),
            spreadsheet_id: None,
            spreadsheet_name: "bv.xlsx".to_string(),
            sheet_name: "Jan 2024".to_string(),
        }
    }

    fn client_for(base_url: String, batch_size: usize, pause: Duration) -> ImportClient {
        ImportClient::new(ImportClientConfig {
            base_url,
            api_key: "test-key".to_string(),
            batch_size,
            batch_pause: pause,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: 0.0,
            },
            ..ImportClientConfig::default()
        })
        .expect("client")
    }

    /// Read one HTTP request fully: headers, then content-length of body.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let Ok(n) = socket.read(&mut chunk).await else {
                break;
            };
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            let Some(header_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let content_length = text
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                break;
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Minimal canned-response server: every connection gets the same
    /// status line and body, and the raw request is captured for asserts.
    async fn canned_server(
        status_line: &'static str,
        body: &'static str,
        hits: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<String>>>,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let hits = hits.clone();
                let requests = requests.clone();
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    hits.fetch_add(1, Ordering::SeqCst);
                    requests.lock().expect("requests lock").push(request);
                    let response = format!(
                        "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_the_configured_fraction() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            jitter: 0.5,
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn error_categories_map_from_status_codes() {
        let auth = TransportError::Rejected {
            status: 401,
            detail: "bad key".to_string(),
        };
        assert_eq!(auth.category(), ErrorCategory::Authentication);
        assert!(auth.category().is_critical());

        let forbidden = TransportError::Rejected {
            status: 403,
            detail: "wrong clinic".to_string(),
        };
        assert_eq!(forbidden.category(), ErrorCategory::Authorization);

        let quota = TransportError::RetriesExhausted {
            attempts: 3,
            status: 429,
        };
        assert_eq!(quota.category(), ErrorCategory::Quota);
        assert!(quota.category().is_critical());

        let server = TransportError::RetriesExhausted {
            attempts: 3,
            status: 503,
        };
        assert_eq!(server.category(), ErrorCategory::Server);
        assert!(!server.category().is_critical());

        let validation = TransportError::Rejected {
            status: 422,
            detail: "bad record".to_string(),
        };
        assert_eq!(validation.category(), ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn eternal_429_stops_after_exactly_max_attempts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let base = canned_server(
            "HTTP/1.1 429 Too Many Requests",
            "{}",
            hits.clone(),
            requests.clone(),
        )
        .await;

        let client = client_for(base, 50, Duration::ZERO);
        let summary = client
            .send_records(&[record()], &meta(), true, false)
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(summary.failed_batches(), 1);
        assert_eq!(summary.batches[0].attempts, 3);
        match summary.batches[0].result.as_ref().expect_err("must fail") {
            TransportError::RetriesExhausted { attempts: 3, status: 429 } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_is_not_retried_and_carries_the_endpoint_detail() {
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let base = canned_server(
            "HTTP/1.1 400 Bad Request",
            "{\"error\":\"unknown clinicId\"}",
            hits.clone(),
            requests.clone(),
        )
        .await;

        let client = client_for(base, 50, Duration::ZERO);
        let summary = client
            .send_records(&[record()], &meta(), true, false)
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        match summary.batches[0].result.as_ref().expect_err("must fail") {
            TransportError::Rejected { status: 400, detail } => {
                assert_eq!(detail, "unknown clinicId");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_hundred_twenty_records_at_batch_25_make_five_requests() {
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let base = canned_server(
            "HTTP/1.1 200 OK",
            "{\"created\":25,\"updated\":0}",
            hits.clone(),
            requests.clone(),
        )
        .await;

        let records: Vec<TestRecord> = (0..120).map(|_| record()).collect();
        let pause = Duration::from_millis(10);
        let client = client_for(base, 25, pause);

        let started = std::time::Instant::now();
        let summary = client.send_records(&records, &meta(), true, false).await;
        let elapsed = started.elapsed();

        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(summary.batches.len(), 5);
        assert_eq!(summary.failed_batches(), 0);
        assert_eq!(summary.records_sent(), 120);
        assert_eq!(summary.created(), 125);
        // Four inter-batch pauses, regardless of outcome.
        assert!(elapsed >= pause * 4, "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn upsert_flag_and_bearer_key_are_on_the_wire() {
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let base = canned_server("HTTP/1.1 200 OK", "{}", hits.clone(), requests.clone()).await;

        let client = client_for(base, 50, Duration::ZERO);
        client.send_records(&[record()], &meta(), true, false).await;

        let captured = requests.lock().expect("requests lock");
        let request = captured.first().expect("one request");
        assert!(request.contains("authorization: Bearer test-key"));
        assert!(request.contains("\"upsert\":true"));
        assert!(request.contains("\"dryRun\":false"));
        assert!(request.contains("\"clinicId\":\"clinic-1\""));
        assert!(request.contains("\"uuid\":\"0a6289c2-5b4e-4bb7-8aa7-3f2f2be01f2d\""));
    }

    #[tokio::test]
    async fn connection_test_is_a_single_dry_run_record() {
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let base = canned_server("HTTP/1.1 200 OK", "{}", hits.clone(), requests.clone()).await;

        let client = client_for(base, 50, Duration::ZERO);
        client
            .test_connection(&record(), &meta())
            .await
            .expect("dry run accepted");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let captured = requests.lock().expect("requests lock");
        assert!(captured[0].contains("\"dryRun\":true"));
        assert!(captured[0].contains("\"upsert\":false"));
    }
}
