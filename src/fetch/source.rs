//! Paginated access to a remote tabular data API (Socrata SODA).
//!
//! [`RecordSource`] fetches one page. [`fetch`] wraps it in a [`PageCursor`]
//! that walks `$offset` windows until a short page comes back, retrying each
//! page with exponential backoff under a [`RetryPolicy`].

use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::{ACCEPT, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::HttpClient;
use crate::error::SourceError;

/// One field-value record from a feed.
pub type Row = Map<String, Value>;

/// Server-side row filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// SoQL `$where` clause, e.g. `requested_datetime >= '2024-01-01T00:00:00'`.
    Where(String),
    /// Full-text `$q` search.
    Text(String),
}

/// A single page window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub offset: usize,
    pub limit: usize,
    pub filter: Option<RowFilter>,
}

/// Fetches one page of raw JSON items from a dataset.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_page(&self, dataset_id: &str, query: &PageQuery)
    -> Result<Vec<Value>, SourceError>;
}

#[async_trait]
impl<S: RecordSource + ?Sized> RecordSource for Arc<S> {
    async fn fetch_page(
        &self,
        dataset_id: &str,
        query: &PageQuery,
    ) -> Result<Vec<Value>, SourceError> {
        (**self).fetch_page(dataset_id, query).await
    }
}

/// [`RecordSource`] backed by a SODA endpoint such as
/// `https://data.sfgov.org/resource`.
pub struct SodaClient<C> {
    client: C,
    base_url: String,
}

impl<C: HttpClient> SodaClient<C> {
    pub fn new(client: C, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Builds `{base}/{dataset}.json?$limit=..&$offset=..&$order=:id[&filter]`.
    ///
    /// Ordering by the system `:id` column keeps offsets stable between pages.
    pub fn page_url(&self, dataset_id: &str, query: &PageQuery) -> Result<Url, SourceError> {
        let raw = format!("{}/{}.json", self.base_url.trim_end_matches('/'), dataset_id);
        let mut url = Url::parse(&raw).map_err(|e| SourceError::Url(format!("{raw}: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("$limit", &query.limit.to_string());
            pairs.append_pair("$offset", &query.offset.to_string());
            pairs.append_pair("$order", ":id");
            match &query.filter {
                Some(RowFilter::Where(clause)) => {
                    pairs.append_pair("$where", clause);
                }
                Some(RowFilter::Text(text)) => {
                    pairs.append_pair("$q", text);
                }
                None => {}
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl<C: HttpClient> RecordSource for SodaClient<C> {
    async fn fetch_page(
        &self,
        dataset_id: &str,
        query: &PageQuery,
    ) -> Result<Vec<Value>, SourceError> {
        let url = self.page_url(dataset_id, query)?;
        let mut req = reqwest::Request::new(reqwest::Method::GET, url);
        req.headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("application/json"));

        let resp = self.client.execute(req).await?;
        let status = resp.status();
        if !status.is_success() {
            let body: String = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(512)
                .collect();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await?;
        parse_page(&body)
    }
}

/// Parses a SODA response body, which must be a JSON array.
pub(crate) fn parse_page(body: &str) -> Result<Vec<Value>, SourceError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Err(SourceError::Payload(format!(
            "expected a JSON array, got {}",
            kind_of(&other)
        ))),
        Err(e) => Err(SourceError::Payload(e.to_string())),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Bounded exponential backoff: `base_delay_ms * 2^(n-1)` after the n-th
/// failure, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// `attempts` tries with no sleeping in between.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Fetches one page, retrying transient failures. Exhausting the policy
/// yields [`SourceError::Unavailable`].
#[tracing::instrument(skip(source, query, policy), fields(offset = query.offset))]
pub async fn fetch_page_with_retry<S: RecordSource + ?Sized>(
    source: &S,
    dataset_id: &str,
    query: &PageQuery,
    policy: &RetryPolicy,
) -> Result<Vec<Value>, SourceError> {
    let max_attempts = policy.attempts.max(1);
    let mut made = 0;
    let mut last_error = None;

    while made < max_attempts {
        made += 1;
        match source.fetch_page(dataset_id, query).await {
            Ok(items) => return Ok(items),
            Err(e) => {
                warn!(attempt = made, max_attempts, error = %e, "Page fetch failed");
                let retryable = e.is_retryable();
                last_error = Some(e);
                if !retryable {
                    break;
                }
                if made < max_attempts {
                    tokio::time::sleep(policy.delay_for(made)).await;
                }
            }
        }
    }

    Err(SourceError::Unavailable {
        dataset: dataset_id.to_string(),
        attempts: made,
        reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// Result of draining a [`PageCursor`].
#[derive(Debug)]
pub enum FetchOutcome {
    Complete(Vec<Row>),
    /// The source became unavailable part-way; `rows` holds what arrived first.
    Degraded { rows: Vec<Row>, error: SourceError },
}

impl FetchOutcome {
    /// All-or-nothing view: partial pages are discarded.
    pub fn into_result(self) -> Result<Vec<Row>, SourceError> {
        match self {
            FetchOutcome::Complete(rows) => Ok(rows),
            FetchOutcome::Degraded { error, .. } => Err(error),
        }
    }
}

/// Lazy, finite walk over a dataset's pages.
pub struct PageCursor<'a, S: ?Sized> {
    source: &'a S,
    dataset_id: String,
    filter: Option<RowFilter>,
    page_size: usize,
    retry: RetryPolicy,
    offset: usize,
    done: bool,
    malformed: usize,
}

/// Starts a fresh cursor at offset 0.
pub fn fetch<'a, S: RecordSource + ?Sized>(
    source: &'a S,
    dataset_id: &str,
    filter: Option<RowFilter>,
    page_size: usize,
    retry: &RetryPolicy,
) -> PageCursor<'a, S> {
    PageCursor {
        source,
        dataset_id: dataset_id.to_string(),
        filter,
        page_size: page_size.max(1),
        retry: retry.clone(),
        offset: 0,
        done: false,
        malformed: 0,
    }
}

impl<S: RecordSource + ?Sized> PageCursor<'_, S> {
    /// Returns the next non-empty page, `None` at end of stream, or the
    /// error that ended it.
    pub async fn next_page(&mut self) -> Option<Result<Vec<Row>, SourceError>> {
        if self.done {
            return None;
        }

        let query = PageQuery {
            offset: self.offset,
            limit: self.page_size,
            filter: self.filter.clone(),
        };

        match fetch_page_with_retry(self.source, &self.dataset_id, &query, &self.retry).await {
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
            Ok(items) => {
                let received = items.len();
                self.offset += received;
                if received < self.page_size {
                    self.done = true;
                }
                if received == 0 {
                    return None;
                }

                let rows: Vec<Row> = items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Object(map) => Some(map),
                        _ => None,
                    })
                    .collect();
                if rows.len() < received {
                    let skipped = received - rows.len();
                    self.malformed += skipped;
                    debug!(dataset = %self.dataset_id, skipped, "Skipped non-object rows");
                }
                Some(Ok(rows))
            }
        }
    }

    /// Rows requested so far (including any skipped as malformed).
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Items that were not JSON objects.
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub async fn collect_all(mut self) -> FetchOutcome {
        let mut rows = Vec::new();
        while let Some(page) = self.next_page().await {
            match page {
                Ok(mut page) => rows.append(&mut page),
                Err(error) => return FetchOutcome::Degraded { rows, error },
            }
        }
        debug!(dataset = %self.dataset_id, rows = rows.len(), "Dataset drained");
        FetchOutcome::Complete(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves a fixed row set sliced by offset/limit, failing the first
    /// `failures` calls.
    struct TableSource {
        rows: Vec<Value>,
        failures: Mutex<u32>,
        offsets: Mutex<Vec<usize>>,
    }

    impl TableSource {
        fn new(n: usize, failures: u32) -> Self {
            Self {
                rows: (0..n).map(|i| json!({ "i": i })).collect(),
                failures: Mutex::new(failures),
                offsets: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RecordSource for TableSource {
        async fn fetch_page(&self, _: &str, q: &PageQuery) -> Result<Vec<Value>, SourceError> {
            self.offsets.lock().unwrap().push(q.offset);
            {
                let mut f = self.failures.lock().unwrap();
                if *f > 0 {
                    *f -= 1;
                    return Err(SourceError::Status {
                        status: 503,
                        body: "busy".into(),
                    });
                }
            }
            let start = q.offset.min(self.rows.len());
            let end = (q.offset + q.limit).min(self.rows.len());
            Ok(self.rows[start..end].to_vec())
        }
    }

    /// Replays a script of responses in order.
    struct ScriptedSource(Mutex<VecDeque<Result<Vec<Value>, SourceError>>>);

    #[async_trait]
    impl RecordSource for ScriptedSource {
        async fn fetch_page(&self, _: &str, _: &PageQuery) -> Result<Vec<Value>, SourceError> {
            self.0.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    #[tokio::test]
    async fn test_paginates_until_short_page() {
        let source = TableSource::new(25, 0);
        let outcome = fetch(&source, "ds", None, 10, &RetryPolicy::immediate(3))
            .collect_all()
            .await;

        let rows = outcome.into_result().unwrap();
        assert_eq!(rows.len(), 25);
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_on_empty_page() {
        let source = TableSource::new(20, 0);
        let rows = fetch(&source, "ds", None, 10, &RetryPolicy::immediate(3))
            .collect_all()
            .await
            .into_result()
            .unwrap();

        assert_eq!(rows.len(), 20);
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let source = TableSource::new(5, 2);
        let rows = fetch(&source, "ds", None, 10, &RetryPolicy::immediate(3))
            .collect_all()
            .await
            .into_result()
            .unwrap();

        assert_eq!(rows.len(), 5);
        assert_eq!(source.offsets.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_unavailable() {
        let source = TableSource::new(5, 3);
        let outcome = fetch(&source, "nbtm-fbw5", None, 10, &RetryPolicy::immediate(3))
            .collect_all()
            .await;

        match outcome {
            FetchOutcome::Degraded { rows, error } => {
                assert!(rows.is_empty());
                match error {
                    SourceError::Unavailable {
                        dataset, attempts, ..
                    } => {
                        assert_eq!(dataset, "nbtm-fbw5");
                        assert_eq!(attempts, 3);
                    }
                    other => panic!("unexpected error: {other}"),
                }
            }
            FetchOutcome::Complete(_) => panic!("expected degraded outcome"),
        }
    }

    #[tokio::test]
    async fn test_failure_mid_stream_keeps_earlier_pages() {
        let busy = || SourceError::Payload("truncated".into());
        let source = ScriptedSource(Mutex::new(VecDeque::from(vec![
            Ok(vec![json!({"a": 1}), json!({"a": 2})]),
            Err(busy()),
            Err(busy()),
        ])));
        let outcome = fetch(&source, "ds", None, 2, &RetryPolicy::immediate(2))
            .collect_all()
            .await;

        match outcome {
            FetchOutcome::Degraded { rows, .. } => assert_eq!(rows.len(), 2),
            FetchOutcome::Complete(_) => panic!("expected degraded outcome"),
        }
    }

    #[tokio::test]
    async fn test_cursor_is_restartable() {
        let source = TableSource::new(3, 0);
        let retry = RetryPolicy::immediate(1);

        let first = fetch(&source, "ds", None, 10, &retry).collect_all().await;
        let second = fetch(&source, "ds", None, 10, &retry).collect_all().await;

        assert_eq!(first.into_result().unwrap(), second.into_result().unwrap());
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_non_object_items_are_skipped() {
        let source = ScriptedSource(Mutex::new(VecDeque::from(vec![Ok(vec![
            json!({"a": 1}),
            json!(42),
            json!({"a": 2}),
        ])])));
        let mut cursor = fetch(&source, "ds", None, 10, &RetryPolicy::immediate(1));
        let page = cursor.next_page().await.unwrap().unwrap();

        assert_eq!(page.len(), 2);
        assert_eq!(cursor.malformed(), 1);
        assert_eq!(cursor.offset(), 3);
        assert!(cursor.next_page().await.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(p.delay_for(10), Duration::from_millis(8_000));
    }

    #[test]
    fn test_page_url_includes_window_and_filter() {
        let client = SodaClient::new(BasicClient::new().unwrap(), "https://data.sfgov.org/resource/");
        let query = PageQuery {
            offset: 100,
            limit: 50,
            filter: Some(RowFilter::Where("status = 'open'".into())),
        };
        let url = client.page_url("nbtm-fbw5", &query).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert_eq!(url.path(), "/resource/nbtm-fbw5.json");
        assert!(pairs.contains(&("$limit".into(), "50".into())));
        assert!(pairs.contains(&("$offset".into(), "100".into())));
        assert!(pairs.contains(&("$where".into(), "status = 'open'".into())));
    }

    #[test]
    fn test_page_url_rejects_bad_base() {
        let client = SodaClient::new(BasicClient::new().unwrap(), "not a url");
        let query = PageQuery {
            offset: 0,
            limit: 1,
            filter: None,
        };
        assert!(matches!(
            client.page_url("x", &query),
            Err(SourceError::Url(_))
        ));
    }

    #[test]
    fn test_parse_page_requires_array() {
        assert_eq!(parse_page(r#"[{"a":1}]"#).unwrap().len(), 1);
        assert!(matches!(
            parse_page(r#"{"error": true}"#),
            Err(SourceError::Payload(_))
        ));
        assert!(matches!(parse_page("<html>"), Err(SourceError::Payload(_))));
    }
}
