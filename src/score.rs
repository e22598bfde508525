//! Distress scoring and neighborhood-diversified selection.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::normalize::ParcelRecord;

/// Weights for the three count signals. NOVs and complaints are
/// parcel-level; 311 cases are tract-level and so weigh least.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub nov_weight: f64,
    pub complaint_weight: f64,
    pub tract_weight: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            nov_weight: 1.0,
            complaint_weight: 0.5,
            tract_weight: 0.3,
        }
    }
}

impl ScoreWeights {
    pub fn score(&self, r: &ParcelRecord) -> f64 {
        r.nov_count as f64 * self.nov_weight
            + r.complaint_count as f64 * self.complaint_weight
            + r.tract_311_count as f64 * self.tract_weight
    }

    /// Weights must be positive for the score to rise with every signal.
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("nov_weight", self.nov_weight),
            ("complaint_weight", self.complaint_weight),
            ("tract_weight", self.tract_weight),
        ] {
            anyhow::ensure!(w.is_finite() && w > 0.0, "{name} must be positive, got {w}");
        }
        Ok(())
    }
}

/// A parcel with its computed score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredParcel {
    #[serde(flatten)]
    pub record: ParcelRecord,
    pub score: f64,
}

/// Descending score, then ascending parcel id.
pub fn rank_order(a: &ScoredParcel, b: &ScoredParcel) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.record.parcel_id.cmp(&b.record.parcel_id))
}

/// Scores every record and returns them in rank order.
pub fn score_parcels(
    records: impl IntoIterator<Item = ParcelRecord>,
    weights: &ScoreWeights,
) -> Vec<ScoredParcel> {
    let mut scored: Vec<ScoredParcel> = records
        .into_iter()
        .map(|record| ScoredParcel {
            score: weights.score(&record),
            record,
        })
        .collect();
    scored.sort_by(rank_order);
    scored
}

/// Decides whether the next candidate in rank order may be selected.
/// Implementations record an admitted candidate in their own state.
pub trait AdmissionPolicy {
    fn admit(&mut self, score: f64, neighborhood: &str) -> bool;
}

/// At most `cap` parcels per neighborhood.
#[derive(Debug, Default)]
pub struct FixedCap {
    cap: usize,
    taken: HashMap<String, usize>,
}

impl FixedCap {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            taken: HashMap::new(),
        }
    }
}

impl AdmissionPolicy for FixedCap {
    fn admit(&mut self, _score: f64, neighborhood: &str) -> bool {
        let taken = self.taken.entry(neighborhood.to_string()).or_insert(0);
        if *taken < self.cap {
            *taken += 1;
            true
        } else {
            false
        }
    }
}

/// Cap shrinks as neighborhoods appear: `ceil(n / distinct_seen)`, where the
/// candidate's own neighborhood counts as seen.
#[derive(Debug, Default)]
pub struct DynamicCap {
    n: usize,
    taken: HashMap<String, usize>,
    seen: HashSet<String>,
}

impl DynamicCap {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            ..Default::default()
        }
    }
}

impl AdmissionPolicy for DynamicCap {
    fn admit(&mut self, _score: f64, neighborhood: &str) -> bool {
        self.seen.insert(neighborhood.to_string());
        let cap = self.n.div_ceil(self.seen.len());
        let taken = self.taken.entry(neighborhood.to_string()).or_insert(0);
        if *taken < cap {
            *taken += 1;
            true
        } else {
            false
        }
    }
}

/// Admits everything; plain top-N.
#[derive(Debug, Default)]
pub struct Unlimited;

impl AdmissionPolicy for Unlimited {
    fn admit(&mut self, _score: f64, _neighborhood: &str) -> bool {
        true
    }
}

/// Configured diversification strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CapPolicy {
    /// Fixed per-neighborhood cap; unset means `max(1, n / 10)`.
    Fixed {
        #[serde(default)]
        per_neighborhood: Option<usize>,
    },
    Dynamic,
    Unlimited,
}

impl Default for CapPolicy {
    fn default() -> Self {
        CapPolicy::Fixed {
            per_neighborhood: None,
        }
    }
}

impl CapPolicy {
    /// Effective fixed cap for a selection of `n`, if the policy has one.
    pub fn fixed_cap(&self, n: usize) -> Option<usize> {
        match self {
            CapPolicy::Fixed { per_neighborhood } => {
                Some(per_neighborhood.unwrap_or_else(|| (n / 10).max(1)))
            }
            CapPolicy::Dynamic | CapPolicy::Unlimited => None,
        }
    }

    /// An explicit fixed cap must admit something and stay below `n`.
    pub fn validate(&self, n: usize) -> Result<()> {
        if let CapPolicy::Fixed {
            per_neighborhood: Some(k),
        } = self
        {
            anyhow::ensure!(*k >= 1, "per_neighborhood cap must be at least 1");
            anyhow::ensure!(
                *k < n,
                "per_neighborhood cap {k} must be below top_n {n}; use the unlimited policy instead"
            );
        }
        Ok(())
    }

    pub fn build(&self, n: usize) -> Box<dyn AdmissionPolicy> {
        match self {
            CapPolicy::Fixed { .. } => Box::new(FixedCap::new(self.fixed_cap(n).unwrap_or(1))),
            CapPolicy::Dynamic => Box::new(DynamicCap::new(n)),
            CapPolicy::Unlimited => Box::new(Unlimited),
        }
    }
}

/// Greedy walk over `ranked` (already in rank order), keeping admitted
/// parcels until `n` are selected. Output keeps the global order.
pub fn select_top(
    ranked: &[ScoredParcel],
    n: usize,
    policy: &mut dyn AdmissionPolicy,
) -> Vec<ScoredParcel> {
    let mut selected = Vec::with_capacity(n.min(ranked.len()));
    for candidate in ranked {
        if selected.len() >= n {
            break;
        }
        if policy.admit(candidate.score, &candidate.record.neighborhood) {
            selected.push(candidate.clone());
        }
    }
    selected
}
