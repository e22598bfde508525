//! Dataset catalog: which feeds exist and which of them the run depends on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default SODA endpoint for San Francisco open data.
pub const DEFAULT_BASE_URL: &str = "https://data.sfgov.org/resource";

/// The role a feed plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// 311 service requests, filtered down to blight categories.
    Blight311,
    /// DBI notices of violation.
    Nov,
    /// DBI complaints (abatement inspections).
    Complaint,
    /// Land use / parcel registry. The base universe of parcels.
    LandUse,
    /// Vacancy registry. Needs a credential.
    Vacancy,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 5] = [
        DatasetKind::LandUse,
        DatasetKind::Nov,
        DatasetKind::Complaint,
        DatasetKind::Blight311,
        DatasetKind::Vacancy,
    ];

    /// Only the land-use feed is mandatory; without it there are no parcels.
    pub fn is_mandatory(self) -> bool {
        matches!(self, DatasetKind::LandUse)
    }

    pub fn requires_credential(self) -> bool {
        matches!(self, DatasetKind::Vacancy)
    }

    pub fn label(self) -> &'static str {
        match self {
            DatasetKind::Blight311 => "blight_311",
            DatasetKind::Nov => "nov",
            DatasetKind::Complaint => "complaint",
            DatasetKind::LandUse => "land_use",
            DatasetKind::Vacancy => "vacancy",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Dataset identifiers on the SODA endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetIds {
    pub blight_311: String,
    pub nov: String,
    pub complaint: String,
    pub land_use: String,
    /// Unset disables the vacancy feed regardless of credentials.
    pub vacancy: Option<String>,
}

impl Default for DatasetIds {
    fn default() -> Self {
        Self {
            blight_311: "vw6y-z8j6".to_string(),
            nov: "nbtm-fbw5".to_string(),
            complaint: "gm5e-kpe8".to_string(),
            land_use: "fdfd-xptc".to_string(),
            vacancy: None,
        }
    }
}

impl DatasetIds {
    pub fn id_for(&self, kind: DatasetKind) -> Option<&str> {
        match kind {
            DatasetKind::Blight311 => Some(&self.blight_311),
            DatasetKind::Nov => Some(&self.nov),
            DatasetKind::Complaint => Some(&self.complaint),
            DatasetKind::LandUse => Some(&self.land_use),
            DatasetKind::Vacancy => self.vacancy.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_land_use_is_mandatory() {
        let mandatory: Vec<_> = DatasetKind::ALL
            .iter()
            .filter(|k| k.is_mandatory())
            .collect();
        assert_eq!(mandatory, vec![&DatasetKind::LandUse]);
    }

    #[test]
    fn test_vacancy_disabled_by_default() {
        let ids = DatasetIds::default();
        assert!(ids.id_for(DatasetKind::Vacancy).is_none());
        assert_eq!(ids.id_for(DatasetKind::Nov), Some("nbtm-fbw5"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let s = serde_json::to_string(&DatasetKind::Blight311).unwrap();
        assert_eq!(s, "\"blight311\"");
    }
}
