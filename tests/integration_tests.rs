use async_trait::async_trait;
use parcel_distress::config::PipelineConfig;
use parcel_distress::error::{PipelineError, SourceError};
use parcel_distress::fetch::{PageQuery, RecordSource, RetryPolicy};
use parcel_distress::pipeline::Pipeline;
use parcel_distress::report::{ReportFormat, render_text, write_report};
use parcel_distress::score::CapPolicy;
use parcel_distress::tract::LookupTable;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

const LAND_USE: &str = "fdfd-xptc";
const NOV: &str = "nbtm-fbw5";
const COMPLAINT: &str = "gm5e-kpe8";
const BLIGHT: &str = "vw6y-z8j6";

/// In-memory SODA stand-in. Datasets listed in `down` always fail.
#[derive(Default)]
struct MemorySource {
    tables: HashMap<String, Vec<Value>>,
    down: HashSet<String>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MemorySource {
    fn calls(&self, dataset: &str) -> usize {
        self.calls.lock().unwrap().get(dataset).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn fetch_page(&self, dataset: &str, q: &PageQuery) -> Result<Vec<Value>, SourceError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(dataset.to_string())
            .or_insert(0) += 1;

        if self.down.contains(dataset) {
            return Err(SourceError::Status {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        let rows = self.tables.get(dataset).map(Vec::as_slice).unwrap_or(&[]);
        let start = q.offset.min(rows.len());
        let end = (q.offset + q.limit).min(rows.len());
        Ok(rows[start..end].to_vec())
    }
}

fn repeat(n: usize, v: Value) -> Vec<Value> {
    std::iter::repeat_n(v, n).collect()
}

fn city() -> MemorySource {
    let land_use = vec![
        json!({"mapblklot": "3553022", "res": "4", "address": "100 VALENCIA ST", "nhood": "Mission", "census_tract": "020800"}),
        json!({"mapblklot": "3553023", "restype": "SINGLE", "address": "102 VALENCIA ST", "nhood": "Mission", "census_tract": "020800"}),
        json!({"mapblklot": "0100001", "landuse": "RESIDENT", "address": "1 MARINA BLVD", "nhood": "Marina", "census_tract": "012700"}),
        json!({"mapblklot": "0200001", "landuse": "RETAIL/ENT", "address": "9 MARKET ST", "nhood": "SoMa", "census_tract": "020800"}),
        json!({"address": "no key here"}),
    ];

    let mut novs = repeat(73, json!({"block": "3553", "lot": "022"}));
    novs.extend(repeat(50, json!({"block": "0200", "lot": "001"})));
    novs.extend(repeat(2, json!({"block": "100", "lot": "001"})));
    novs.push(json!({"block": "9999", "lot": "999"}));

    let complaints = repeat(196, json!({"block": "3553", "lot": "022"}));

    let mut blight = repeat(
        1843,
        json!({"service_name": "Graffiti", "service_subtype": "Graffiti on Building", "census_tract": "020800"}),
    );
    blight.extend(repeat(
        10,
        json!({"service_name": "Encampments", "census_tract": "012700"}),
    ));
    blight.extend(repeat(
        5,
        json!({"service_name": "Streetlights", "census_tract": "012700"}),
    ));

    let mut tables = HashMap::new();
    tables.insert(LAND_USE.to_string(), land_use);
    tables.insert(NOV.to_string(), novs);
    tables.insert(COMPLAINT.to_string(), complaints);
    tables.insert(BLIGHT.to_string(), blight);

    MemorySource {
        tables,
        ..Default::default()
    }
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        page_size: 100,
        retry: RetryPolicy::immediate(3),
        blight_years_back: 0,
        ..Default::default()
    }
}

fn pipeline(config: PipelineConfig, source: Arc<MemorySource>) -> Pipeline {
    Pipeline::new(config, source, Arc::new(LookupTable::default()))
}

#[tokio::test]
async fn test_full_pipeline_ranks_reference_parcel_first() {
    let run = pipeline(test_config(), Arc::new(city())).run().await.unwrap();

    let text = render_text(&run.selected);
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(
        lines[0],
        "1. Score 723.90 | 3553-022 | 100 VALENCIA ST | Mission | NOVs: 73 | Complaints: 196 | 311: 1843"
    );
    assert!((run.selected[0].score - 723.9).abs() < 1e-9);

    // the commercial parcel has 50 NOVs but is not residential
    assert!(run
        .selected
        .iter()
        .all(|p| p.record.parcel_id.as_str() != "0200-001"));
    assert_eq!(run.scored, 3);
    assert_eq!(run.normalize.nov_dropped, 1);
    assert_eq!(run.normalize.blight_matched, 1853);
}

#[tokio::test]
async fn test_tract_count_is_shared_within_tract() {
    let run = pipeline(test_config(), Arc::new(city())).run().await.unwrap();

    let tract_counts: Vec<_> = run
        .selected
        .iter()
        .filter(|p| p.record.tract_id.as_ref().map(|t| t.as_str()) == Some("020800"))
        .map(|p| p.record.tract_311_count)
        .collect();
    assert_eq!(tract_counts, vec![1843, 1843]);
}

#[tokio::test]
async fn test_unavailable_nov_feed_degrades_to_zero() {
    let mut source = city();
    source.down.insert(NOV.to_string());
    let source = Arc::new(source);

    let run = pipeline(test_config(), source.clone()).run().await.unwrap();

    assert_eq!(source.calls(NOV), 3);
    assert!(run.feeds.contains(&(parcel_distress::datasets::DatasetKind::Nov, "degraded")));
    let top = &run.selected[0];
    assert_eq!(top.record.parcel_id.as_str(), "3553-022");
    assert_eq!(top.record.nov_count, 0);
    assert!((top.score - 650.9).abs() < 1e-9);

    let path = format!(
        "{}/parcel_distress_degraded_report.txt",
        std::env::temp_dir().display()
    );
    write_report(&path, &run.selected, ReportFormat::Text).unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 3);
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_unavailable_land_use_is_fatal() {
    let mut source = city();
    source.down.insert(LAND_USE.to_string());

    let err = pipeline(test_config(), Arc::new(source))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::MandatoryFeedUnavailable { ref dataset, .. } if dataset == LAND_USE
    ));
}

#[tokio::test]
async fn test_neighborhood_cap_diversifies_selection() {
    let config = PipelineConfig {
        top_n: 2,
        cap: CapPolicy::Fixed {
            per_neighborhood: Some(1),
        },
        ..test_config()
    };
    let run = pipeline(config, Arc::new(city())).run().await.unwrap();

    let ids: Vec<_> = run
        .selected
        .iter()
        .map(|p| p.record.parcel_id.as_str())
        .collect();
    assert_eq!(ids, vec!["3553-022", "0100-001"]);
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let source = Arc::new(city());
    let a = pipeline(test_config(), source.clone()).run().await.unwrap();
    let b = pipeline(test_config(), source).run().await.unwrap();
    assert_eq!(render_text(&a.selected), render_text(&b.selected));
    assert_eq!(a.normalize, b.normalize);
}

#[tokio::test]
async fn test_vacancy_feed_sets_flag_when_enabled() {
    let mut config = test_config();
    config.datasets.vacancy = Some("vac-0001".into());

    let mut vacancy = MemorySource::default();
    vacancy.tables.insert(
        "vac-0001".into(),
        vec![json!({"block": "0100", "lot": "001", "vacant": "Y"})],
    );
    let vacancy: Arc<dyn RecordSource> = Arc::new(vacancy);

    let run = pipeline(config, Arc::new(city()))
        .with_vacancy_source(Some(vacancy))
        .run()
        .await
        .unwrap();

    let marina = run
        .selected
        .iter()
        .find(|p| p.record.parcel_id.as_str() == "0100-001")
        .unwrap();
    assert_eq!(marina.record.vacant, Some(true));
    assert!(run
        .selected
        .iter()
        .filter(|p| p.record.parcel_id.as_str() != "0100-001")
        .all(|p| p.record.vacant.is_none()));
}

#[tokio::test]
async fn test_untracted_311_rows_score_by_neighborhood() {
    let mut tables = HashMap::new();
    tables.insert(
        LAND_USE.to_string(),
        vec![
            json!({"mapblklot": "3553022", "res": "4", "address": "100 VALENCIA ST", "nhood": "Mission"}),
            json!({"mapblklot": "0100001", "res": "1", "address": "1 MARINA BLVD", "nhood": "Marina"}),
        ],
    );
    tables.insert(
        BLIGHT.to_string(),
        repeat(
            50,
            json!({"service_name": "Graffiti", "address": "500 VALENCIA ST", "analysis_neighborhood": "Mission", "supervisor_district": "9"}),
        ),
    );
    let source = MemorySource {
        tables,
        ..Default::default()
    };

    let run = pipeline(test_config(), Arc::new(source)).run().await.unwrap();

    let top = &run.selected[0];
    assert_eq!(top.record.parcel_id.as_str(), "3553-022");
    assert_eq!(top.record.tract_311_count, 50);
    assert!((top.score - 15.0).abs() < 1e-9);
    assert_eq!(run.normalize.blight_by_area, 50);
    assert_eq!(run.selected[1].record.tract_311_count, 0);
}
