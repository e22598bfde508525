//! End-to-end run: ingest -> normalize -> score.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::datasets::DatasetKind;
use crate::error::PipelineError;
use crate::fetch::{ApiKey, BasicClient, RecordSource, SodaClient};
use crate::ingest::{FeedResult, IngestBundle, IngestPlan, blight_window_filter, ingest_all};
use crate::normalize::{NormalizeInput, NormalizeStats, ResidentialPolicy, normalize};
use crate::score::{ScoredParcel, score_parcels, select_top};
use crate::tract::TractResolver;

/// Builds the SODA sources from optional credentials.
///
/// `app_token` decorates every feed; `vacancy_token` is required for the
/// vacancy feed and `None` disables it.
pub fn soda_sources(
    config: &PipelineConfig,
    app_token: Option<&str>,
    vacancy_token: Option<&str>,
) -> Result<(Arc<dyn RecordSource>, Option<Arc<dyn RecordSource>>)> {
    let public: Arc<dyn RecordSource> = match app_token {
        Some(token) => Arc::new(SodaClient::new(
            ApiKey::app_token(BasicClient::new()?, token)?,
            config.base_url.clone(),
        )),
        None => Arc::new(SodaClient::new(BasicClient::new()?, config.base_url.clone())),
    };

    let vacancy: Option<Arc<dyn RecordSource>> = match vacancy_token {
        Some(token) => Some(Arc::new(SodaClient::new(
            ApiKey::new(BasicClient::new()?, &config.credential_header, token)?,
            config.base_url.clone(),
        ))),
        None => None,
    };

    Ok((public, vacancy))
}

/// What a run produced.
#[derive(Debug)]
pub struct RunOutput {
    /// Diversified top-N in rank order.
    pub selected: Vec<ScoredParcel>,
    /// Residential parcels scored before selection.
    pub scored: usize,
    pub normalize: NormalizeStats,
    pub feeds: Vec<(DatasetKind, &'static str)>,
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    source: Arc<dyn RecordSource>,
    vacancy_source: Option<Arc<dyn RecordSource>>,
    resolver: Arc<dyn TractResolver>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn RecordSource>,
        resolver: Arc<dyn TractResolver>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            source,
            vacancy_source: None,
            resolver,
        }
    }

    /// Enables the vacancy feed with its credentialed source.
    pub fn with_vacancy_source(mut self, source: Option<Arc<dyn RecordSource>>) -> Self {
        self.vacancy_source = source;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Splits the catalog into datasets to fetch and datasets to skip.
    pub fn plans(&self, today: NaiveDate) -> (Vec<IngestPlan>, Vec<(DatasetKind, String)>) {
        let mut plans = Vec::new();
        let mut skipped = Vec::new();

        for kind in DatasetKind::ALL {
            let Some(dataset_id) = self.config.datasets.id_for(kind) else {
                skipped.push((kind, "no dataset configured".to_string()));
                continue;
            };

            let source = if kind.requires_credential() {
                match &self.vacancy_source {
                    Some(s) => s.clone(),
                    None => {
                        skipped.push((kind, "missing credential".to_string()));
                        continue;
                    }
                }
            } else {
                self.source.clone()
            };

            let filter = match kind {
                DatasetKind::Blight311 => {
                    blight_window_filter(self.config.blight_years_back, today)
                }
                _ => None,
            };

            plans.push(IngestPlan {
                kind,
                dataset_id: dataset_id.to_string(),
                filter,
                source,
            });
        }

        (plans, skipped)
    }

    /// Runs the whole pipeline. Only an unreachable land-use feed is fatal.
    #[tracing::instrument(skip(self), fields(top_n = self.config.top_n))]
    pub async fn run(&self) -> Result<RunOutput, PipelineError> {
        let (plans, skipped) = self.plans(Utc::now().date_naive());
        let concurrency = self.config.concurrency.unwrap_or(plans.len());

        let mut bundle = ingest_all(plans, self.config.clone(), concurrency).await;
        for (kind, reason) in skipped {
            info!(kind = %kind, reason = %reason, "Dataset skipped");
            bundle.skip(kind, reason);
        }

        self.finish(bundle)
    }

    /// Normalize and score an already-ingested bundle.
    pub fn finish(&self, bundle: IngestBundle) -> Result<RunOutput, PipelineError> {
        match bundle.result(DatasetKind::LandUse) {
            Some(FeedResult::Ok(_)) => {}
            Some(FeedResult::Fatal(reason)) | Some(FeedResult::Degraded(reason)) => {
                return Err(PipelineError::MandatoryFeedUnavailable {
                    dataset: self.config.datasets.land_use.clone(),
                    reason: reason.clone(),
                });
            }
            None => {
                return Err(PipelineError::MandatoryFeedUnavailable {
                    dataset: self.config.datasets.land_use.clone(),
                    reason: "not ingested".to_string(),
                });
            }
        }

        let feeds: Vec<_> = bundle.iter().map(|(k, r)| (k, r.status())).collect();

        let input = NormalizeInput {
            land_use: bundle.rows(DatasetKind::LandUse),
            novs: bundle.rows(DatasetKind::Nov),
            complaints: bundle.rows(DatasetKind::Complaint),
            blight: bundle.rows(DatasetKind::Blight311),
            vacancy: bundle.rows(DatasetKind::Vacancy),
        };
        if input.land_use.is_empty() {
            warn!("Land-use feed returned no parcels");
        }

        let policy = ResidentialPolicy::new(
            &self.config.residential_types,
            &self.config.residential_landuse,
        );
        let normalized = normalize(input, &policy, self.resolver.as_ref());

        let ranked = score_parcels(normalized.parcels.into_values(), &self.config.weights);
        let top_n = self.config.top_n;
        let mut admission = self.config.cap.build(top_n);
        let selected = select_top(&ranked, top_n, admission.as_mut());

        info!(
            scored = ranked.len(),
            selected = selected.len(),
            top_n,
            cap = ?self.config.cap,
            "Scoring complete"
        );

        Ok(RunOutput {
            selected,
            scored: ranked.len(),
            normalize: normalized.stats,
            feeds,
        })
    }
}
