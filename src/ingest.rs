//! Per-dataset fetch and coarse filtering.
//!
//! Each feed is pulled through the paginated source adapter, then shaped
//! into [`RawEventRow`]s keyed by parcel, tract or address. No joins and no
//! aggregation happen here; that is the job of [`crate::normalize`].

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::datasets::DatasetKind;
use crate::fetch::{RecordSource, Row, RowFilter, fetch};
use crate::parcel::{ParcelId, TractId, field_str, first_field, normalize_address};

pub const TRACT_FIELDS: &[&str] = &["census_tract", "census_tract_2010", "tract", "tractce"];
pub const ADDRESS_FIELDS: &[&str] = &["address", "from_address", "street_address"];
pub const NEIGHBORHOOD_FIELDS: &[&str] = &[
    "analysis_neighborhood",
    "nhood",
    "neighborhoods_analysis_boundaries",
    "neighborhoods_sffind_boundaries",
    "neighborhood",
];
pub const DISTRICT_FIELDS: &[&str] = &["supervisor_district", "supervisorial_district"];
const BLIGHT_TEXT_FIELDS: &[&str] = &["service_name", "service_subtype", "service_details"];
const TIMESTAMP_FIELDS: &[&str] = &[
    "requested_datetime",
    "date_filed",
    "date_received",
    "date",
    "data_as_of",
];
const CATEGORY_FIELDS: &[&str] = &[
    "nov_category_description",
    "complaint_description",
    "service_name",
    "landuse",
    "category",
    "status",
];

/// How a raw row identifies the place it talks about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKey {
    Parcel(ParcelId),
    Tract(TractId),
    /// Normalized street address, resolved to a tract later.
    Address(String),
    /// No tract or address; counted against the neighborhood instead.
    Neighborhood(String),
    District(String),
}

/// One row from one feed after shaping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEventRow {
    pub source: DatasetKind,
    pub key: RowKey,
    pub timestamp: Option<NaiveDateTime>,
    pub category: String,
    pub attributes: Row,
}

impl RawEventRow {
    pub fn parcel_id(&self) -> Option<&ParcelId> {
        match &self.key {
            RowKey::Parcel(id) => Some(id),
            _ => None,
        }
    }
}

/// Per-dataset ingest result consumed by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedResult {
    Ok(Vec<RawEventRow>),
    /// Optional feed unavailable or disabled; its signal defaults to zero.
    Degraded(String),
    /// Mandatory feed unavailable; the run cannot continue.
    Fatal(String),
}

impl FeedResult {
    pub fn rows(&self) -> &[RawEventRow] {
        match self {
            FeedResult::Ok(rows) => rows,
            _ => &[],
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            FeedResult::Ok(_) => "ok",
            FeedResult::Degraded(_) => "degraded",
            FeedResult::Fatal(_) => "fatal",
        }
    }
}

/// Counts reported for one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub fetched: usize,
    pub kept: usize,
    pub malformed: usize,
}

/// Everything ingest produced, keyed by feed.
#[derive(Debug, Default)]
pub struct IngestBundle {
    feeds: BTreeMap<DatasetKind, FeedResult>,
    summaries: BTreeMap<DatasetKind, IngestSummary>,
}

impl IngestBundle {
    pub fn insert(&mut self, kind: DatasetKind, result: FeedResult, summary: IngestSummary) {
        self.feeds.insert(kind, result);
        self.summaries.insert(kind, summary);
    }

    /// Records a feed that was never fetched (e.g. missing credential).
    pub fn skip(&mut self, kind: DatasetKind, reason: impl Into<String>) {
        self.insert(
            kind,
            FeedResult::Degraded(reason.into()),
            IngestSummary::default(),
        );
    }

    pub fn result(&self, kind: DatasetKind) -> Option<&FeedResult> {
        self.feeds.get(&kind)
    }

    /// Rows for `kind`, empty when the feed degraded or was never planned.
    pub fn rows(&self, kind: DatasetKind) -> &[RawEventRow] {
        self.feeds.get(&kind).map(FeedResult::rows).unwrap_or(&[])
    }

    pub fn summary(&self, kind: DatasetKind) -> Option<&IngestSummary> {
        self.summaries.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DatasetKind, &FeedResult)> {
        self.feeds.iter().map(|(k, v)| (*k, v))
    }
}

/// One dataset to pull.
#[derive(Clone)]
pub struct IngestPlan {
    pub kind: DatasetKind,
    pub dataset_id: String,
    pub filter: Option<RowFilter>,
    pub source: Arc<dyn RecordSource>,
}

/// Server-side window for 311 cases: `requested_datetime >= today - years`.
pub fn blight_window_filter(years_back: u32, today: NaiveDate) -> Option<RowFilter> {
    if years_back == 0 {
        return None;
    }
    let since = today - ChronoDuration::days(365 * i64::from(years_back));
    Some(RowFilter::Where(format!(
        "requested_datetime >= '{}T00:00:00'",
        since.format("%Y-%m-%d")
    )))
}

/// Lower-cased 311 category text used for keyword matching.
pub fn blight_text(row: &Row) -> String {
    BLIGHT_TEXT_FIELDS
        .iter()
        .filter_map(|f| field_str(row, f))
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when `text` contains any keyword (case-insensitive).
pub fn matches_blight(text: &str, keywords: &[String]) -> bool {
    let text = text.to_lowercase();
    keywords
        .iter()
        .any(|kw| !kw.is_empty() && text.contains(&kw.to_lowercase()))
}

fn parse_timestamp(row: &Row) -> Option<NaiveDateTime> {
    let raw = first_field(row, TIMESTAMP_FIELDS)?;
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map(|d| d.and_time(Default::default()))
        })
        .ok()
}

fn event_row(source: DatasetKind, key: RowKey, category: String, row: Row) -> RawEventRow {
    RawEventRow {
        source,
        key,
        timestamp: parse_timestamp(&row),
        category,
        attributes: row,
    }
}

/// Rows kept for one dataset plus how many were malformed.
#[derive(Debug, Default)]
pub struct Shaped {
    pub rows: Vec<RawEventRow>,
    pub malformed: usize,
    pub filtered: usize,
}

/// Filters and keys the raw rows of one dataset.
pub fn shape(kind: DatasetKind, rows: Vec<Row>, keywords: &[String]) -> Shaped {
    let mut out = Shaped::default();

    for row in rows {
        match kind {
            DatasetKind::Blight311 => {
                let text = blight_text(&row);
                if !matches_blight(&text, keywords) {
                    out.filtered += 1;
                    continue;
                }
                let key = first_field(&row, TRACT_FIELDS)
                    .and_then(|t| TractId::new(&t))
                    .map(RowKey::Tract)
                    .or_else(|| {
                        first_field(&row, ADDRESS_FIELDS)
                            .map(|a| normalize_address(&a))
                            .filter(|a| !a.is_empty())
                            .map(RowKey::Address)
                    })
                    .or_else(|| first_field(&row, NEIGHBORHOOD_FIELDS).map(RowKey::Neighborhood))
                    .or_else(|| first_field(&row, DISTRICT_FIELDS).map(RowKey::District));
                match key {
                    Some(key) => out.rows.push(event_row(kind, key, text, row)),
                    None => {
                        debug!(dataset = %kind, "311 row has no tract, address or area");
                        out.malformed += 1;
                    }
                }
            }
            DatasetKind::Nov
            | DatasetKind::Complaint
            | DatasetKind::LandUse
            | DatasetKind::Vacancy => match ParcelId::from_row(&row) {
                Some(id) => {
                    let category = first_field(&row, CATEGORY_FIELDS).unwrap_or_default();
                    out.rows
                        .push(event_row(kind, RowKey::Parcel(id), category, row));
                }
                None => {
                    debug!(dataset = %kind, "Row has no block-lot key");
                    out.malformed += 1;
                }
            },
        }
    }

    out
}

/// Fetches and shapes one dataset.
///
/// Unavailability is absorbed: optional feeds degrade, the mandatory
/// land-use feed comes back as [`FeedResult::Fatal`].
pub async fn ingest_dataset(
    plan: &IngestPlan,
    config: &PipelineConfig,
) -> (FeedResult, IngestSummary) {
    let outcome = fetch(
        &*plan.source,
        &plan.dataset_id,
        plan.filter.clone(),
        config.page_size,
        &config.retry,
    )
    .collect_all()
    .await;

    match outcome.into_result() {
        Ok(rows) => {
            let fetched = rows.len();
            let shaped = shape(plan.kind, rows, &config.blight_keywords);
            let summary = IngestSummary {
                fetched,
                kept: shaped.rows.len(),
                malformed: shaped.malformed,
            };
            info!(
                dataset = %plan.dataset_id,
                kind = %plan.kind,
                fetched,
                kept = summary.kept,
                malformed = summary.malformed,
                "Dataset ingested"
            );
            (FeedResult::Ok(shaped.rows), summary)
        }
        Err(e) if plan.kind.is_mandatory() => {
            error!(dataset = %plan.dataset_id, kind = %plan.kind, error = %e, "Mandatory dataset unavailable");
            (FeedResult::Fatal(e.to_string()), IngestSummary::default())
        }
        Err(e) => {
            warn!(dataset = %plan.dataset_id, kind = %plan.kind, error = %e, "Dataset unavailable, continuing without it");
            (FeedResult::Degraded(e.to_string()), IngestSummary::default())
        }
    }
}

/// Ingests every plan concurrently, at most `concurrency` at a time, and
/// waits for all of them.
pub async fn ingest_all(
    plans: Vec<IngestPlan>,
    config: Arc<PipelineConfig>,
    concurrency: usize,
) -> IngestBundle {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency.max(1)));
    let mut tasks = Vec::with_capacity(plans.len());

    for plan in plans {
        let sem = semaphore.clone();
        let config = config.clone();
        let kind = plan.kind;

        let span = tracing::info_span!(
            "ingest_dataset",
            dataset = %plan.dataset_id,
            kind = %plan.kind,
        );

        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire_owned().await.ok();
                ingest_dataset(&plan, &config).await
            }
            .instrument(span),
        );
        tasks.push((kind, task));
    }

    let mut bundle = IngestBundle::default();
    for (kind, task) in tasks {
        match task.await {
            Ok((result, summary)) => bundle.insert(kind, result, summary),
            Err(e) => {
                error!(kind = %kind, error = %e, "Ingest task failed");
                let reason = format!("ingest task failed: {e}");
                let result = if kind.is_mandatory() {
                    FeedResult::Fatal(reason)
                } else {
                    FeedResult::Degraded(reason)
                };
                bundle.insert(kind, result, IngestSummary::default());
            }
        }
    }
    bundle
}

/// Reads a boolean-ish vacancy flag.
pub fn vacancy_flag(row: &Row) -> Option<bool> {
    let raw = ["vacant", "is_vacant", "vacancy_status"]
        .iter()
        .find_map(|k| row.get(*k))?;
    match raw {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|v| v != 0.0)),
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            Some(matches!(s.as_str(), "true" | "yes" | "y" | "1" | "vacant"))
        }
        _ => None,
    }
}
