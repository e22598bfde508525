//! Pipeline configuration.
//!
//! Every knob has an embedded default. A JSON file can override any subset
//! of fields:
//! ```json
//! {
//!   "top_n": 50,
//!   "weights": { "nov_weight": 2.0 },
//!   "cap": { "policy": "dynamic" },
//!   "datasets": { "vacancy": "abcd-1234" }
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::datasets::{DEFAULT_BASE_URL, DatasetIds};
use crate::fetch::RetryPolicy;
use crate::score::{CapPolicy, ScoreWeights};

/// Default SODA page size; the API caps `$limit` at 50k.
pub const DEFAULT_PAGE_SIZE: usize = 50_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub base_url: String,
    pub datasets: DatasetIds,
    pub page_size: usize,
    pub retry: RetryPolicy,
    pub weights: ScoreWeights,
    pub top_n: usize,
    pub cap: CapPolicy,
    /// `restype` values that mark a parcel residential.
    pub residential_types: Vec<String>,
    /// `landuse` values that mark a parcel residential.
    pub residential_landuse: Vec<String>,
    /// Terms matched case-insensitively against 311 category text.
    pub blight_keywords: Vec<String>,
    /// How far back to pull 311 cases. 0 pulls everything.
    pub blight_years_back: u32,
    /// Worker permits for dataset ingest. Defaults to one per dataset.
    pub concurrency: Option<usize>,
    /// Header used to pass the vacancy feed credential.
    pub credential_header: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            datasets: DatasetIds::default(),
            page_size: DEFAULT_PAGE_SIZE,
            retry: RetryPolicy::default(),
            weights: ScoreWeights::default(),
            top_n: 100,
            cap: CapPolicy::default(),
            residential_types: to_strings(&["SINGLE", "FLATS", "APTS", "CONDO", "SRO"]),
            residential_landuse: to_strings(&["RESIDENT", "MIXRES"]),
            blight_keywords: to_strings(&[
                "abandoned",
                "vehicle",
                "graffiti",
                "encampment",
                "homeless",
                "illegal",
                "posting",
                "postings",
                "damaged",
                "property",
                "vacant",
                "lot",
                "blight",
            ]),
            blight_years_back: 2,
            concurrency: None,
            credential_header: "X-App-Token".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Loads the config from a JSON file at `path`. Missing fields keep
    /// their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("invalid config '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.page_size > 0, "page_size must be positive");
        anyhow::ensure!(self.top_n > 0, "top_n must be positive");
        anyhow::ensure!(self.retry.attempts > 0, "retry.attempts must be positive");
        self.weights.validate()?;
        self.cap.validate(self.top_n)?;
        Ok(())
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
