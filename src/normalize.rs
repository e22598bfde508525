//! Fuses the per-feed rows into one record per parcel.
//!
//! Two explicit maps carry the joins: `ParcelId -> ParcelRecord` for
//! parcel-addressable signals and `TractId -> count` for 311 cases, which
//! are fanned back out onto every parcel in the tract. 311 rows that resolve
//! to no tract are counted per neighborhood and supervisor district instead,
//! and those counts go to parcels that have no tract.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::ingest::{
    ADDRESS_FIELDS, DISTRICT_FIELDS, NEIGHBORHOOD_FIELDS, RawEventRow, RowKey, TRACT_FIELDS,
    vacancy_flag,
};
use crate::parcel::{ParcelId, TractId, field_str, first_field};
use crate::tract::TractResolver;

const UNIT_FIELDS: &[&str] = &["res", "resunits", "res_units", "units"];
const STREET_PARTS: &[&str] = &["street_number", "street_name", "street_suffix"];

/// Neighborhood used when a parcel carries none.
pub const UNKNOWN_NEIGHBORHOOD: &str = "Unknown";

/// Canonical fused parcel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParcelRecord {
    pub parcel_id: ParcelId,
    pub address: String,
    pub neighborhood: String,
    pub residential: bool,
    pub nov_count: u64,
    pub complaint_count: u64,
    pub tract_id: Option<TractId>,
    pub supervisor_district: Option<String>,
    /// 311 cases for the parcel's tract, or for its neighborhood or district
    /// when no tract is known.
    pub tract_311_count: u64,
    pub vacant: Option<bool>,
}

impl ParcelRecord {
    pub fn new(parcel_id: ParcelId) -> Self {
        Self {
            parcel_id,
            address: String::new(),
            neighborhood: UNKNOWN_NEIGHBORHOOD.to_string(),
            residential: false,
            nov_count: 0,
            complaint_count: 0,
            tract_id: None,
            supervisor_district: None,
            tract_311_count: 0,
            vacant: None,
        }
    }
}

/// `residential := units > 0 OR restype in types OR landuse in landuse`.
#[derive(Debug, Clone)]
pub struct ResidentialPolicy {
    types: HashSet<String>,
    landuse: HashSet<String>,
}

impl ResidentialPolicy {
    pub fn new(types: &[String], landuse: &[String]) -> Self {
        let upper = |v: &[String]| v.iter().map(|s| s.trim().to_uppercase()).collect();
        Self {
            types: upper(types),
            landuse: upper(landuse),
        }
    }

    pub fn is_residential(&self, row: &RawEventRow) -> bool {
        let attrs = &row.attributes;
        if unit_count(attrs) > 0.0 {
            return true;
        }
        let upper = |key: &str| field_str(attrs, key).map(|s| s.to_uppercase());
        upper("restype").is_some_and(|t| self.types.contains(&t))
            || upper("landuse").is_some_and(|l| self.landuse.contains(&l))
    }
}

/// Residential unit count. Unparsable values count as zero.
fn unit_count(attrs: &crate::fetch::Row) -> f64 {
    let Some(raw) = first_field(attrs, UNIT_FIELDS) else {
        return 0.0;
    };
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => {
            debug!(value = %raw, "Unparsable residential unit count");
            0.0
        }
    }
}

fn seed_address(attrs: &crate::fetch::Row) -> String {
    if let Some(a) = first_field(attrs, ADDRESS_FIELDS) {
        return a;
    }
    STREET_PARTS
        .iter()
        .filter_map(|k| field_str(attrs, k))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case-insensitive key for neighborhood and district counts.
fn area_key(name: &str) -> String {
    name.trim().to_uppercase()
}

/// Rows from every feed, already shaped by ingest.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeInput<'a> {
    pub land_use: &'a [RawEventRow],
    pub novs: &'a [RawEventRow],
    pub complaints: &'a [RawEventRow],
    pub blight: &'a [RawEventRow],
    pub vacancy: &'a [RawEventRow],
}

/// Counters describing one normalize pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub seeded: usize,
    pub duplicate_seeds: usize,
    pub nov_matched: usize,
    pub nov_dropped: usize,
    pub complaint_matched: usize,
    pub complaint_dropped: usize,
    pub blight_matched: usize,
    pub blight_by_area: usize,
    pub blight_unresolved: usize,
    pub vacancy_matched: usize,
    pub tracts: usize,
    pub residential: usize,
    pub non_residential_dropped: usize,
}

/// Output of [`normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Residential parcels only.
    pub parcels: BTreeMap<ParcelId, ParcelRecord>,
    pub tract_counts: BTreeMap<TractId, u64>,
    pub neighborhood_counts: BTreeMap<String, u64>,
    pub district_counts: BTreeMap<String, u64>,
    pub stats: NormalizeStats,
}

/// Builds the parcel map. Pure: identical inputs give identical output.
pub fn normalize(
    input: NormalizeInput<'_>,
    policy: &ResidentialPolicy,
    resolver: &dyn TractResolver,
) -> Normalized {
    let mut stats = NormalizeStats::default();
    let mut parcels: BTreeMap<ParcelId, ParcelRecord> = BTreeMap::new();

    // 1. seed
    for row in input.land_use {
        let Some(id) = row.parcel_id() else {
            continue;
        };
        if parcels.contains_key(id) {
            stats.duplicate_seeds += 1;
            continue;
        }
        let attrs = &row.attributes;
        let mut record = ParcelRecord::new(id.clone());
        record.residential = policy.is_residential(row);
        record.address = seed_address(attrs);
        if let Some(n) = first_field(attrs, NEIGHBORHOOD_FIELDS) {
            record.neighborhood = n;
        }
        record.tract_id = first_field(attrs, TRACT_FIELDS).and_then(|t| TractId::new(&t));
        record.supervisor_district = first_field(attrs, DISTRICT_FIELDS);
        parcels.insert(id.clone(), record);
    }
    stats.seeded = parcels.len();
    if stats.duplicate_seeds > 0 {
        debug!(duplicates = stats.duplicate_seeds, "Duplicate land-use rows ignored");
    }

    // 2-3. parcel-level counts
    (stats.nov_matched, stats.nov_dropped) =
        fold_counts(&mut parcels, input.novs, |r| &mut r.nov_count);
    (stats.complaint_matched, stats.complaint_dropped) =
        fold_counts(&mut parcels, input.complaints, |r| &mut r.complaint_count);

    // 4. tract resolution and 311 aggregation
    for record in parcels.values_mut() {
        let seeded = record.tract_id.take();
        record.tract_id = resolver
            .tract_for_parcel(&record.parcel_id, &record.address)
            .or(seeded);
    }

    let mut tract_counts: BTreeMap<TractId, u64> = BTreeMap::new();
    let mut neighborhood_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut district_counts: BTreeMap<String, u64> = BTreeMap::new();
    for row in input.blight {
        let tract = match &row.key {
            RowKey::Tract(t) => Some(t.clone()),
            RowKey::Address(a) => resolver.tract_for_address(a),
            RowKey::Parcel(p) => parcels.get(p).and_then(|r| r.tract_id.clone()),
            RowKey::Neighborhood(_) | RowKey::District(_) => None,
        };
        if let Some(t) = tract {
            *tract_counts.entry(t).or_insert(0) += 1;
            stats.blight_matched += 1;
            continue;
        }

        let hood = first_field(&row.attributes, NEIGHBORHOOD_FIELDS);
        let district = first_field(&row.attributes, DISTRICT_FIELDS);
        if hood.is_none() && district.is_none() {
            stats.blight_unresolved += 1;
            continue;
        }
        if let Some(h) = hood {
            *neighborhood_counts.entry(area_key(&h)).or_insert(0) += 1;
        }
        if let Some(d) = district {
            *district_counts.entry(area_key(&d)).or_insert(0) += 1;
        }
        stats.blight_by_area += 1;
    }
    stats.tracts = tract_counts.len();

    // 5. fan-out: tract first, else neighborhood, else district
    for record in parcels.values_mut() {
        record.tract_311_count = match &record.tract_id {
            Some(t) => tract_counts.get(t).copied().unwrap_or(0),
            None => neighborhood_counts
                .get(&area_key(&record.neighborhood))
                .copied()
                .filter(|&n| n > 0)
                .or_else(|| {
                    record
                        .supervisor_district
                        .as_deref()
                        .and_then(|d| district_counts.get(&area_key(d)).copied())
                })
                .unwrap_or(0),
        };
    }

    // vacancy signal (reported, not scored)
    for row in input.vacancy {
        let (Some(id), Some(flag)) = (row.parcel_id(), vacancy_flag(&row.attributes)) else {
            continue;
        };
        if let Some(record) = parcels.get_mut(id) {
            record.vacant = Some(record.vacant.unwrap_or(false) || flag);
            stats.vacancy_matched += 1;
        }
    }

    // 6. residential filter
    let before = parcels.len();
    parcels.retain(|_, r| r.residential);
    stats.residential = parcels.len();
    stats.non_residential_dropped = before - parcels.len();

    info!(
        seeded = stats.seeded,
        residential = stats.residential,
        nov_matched = stats.nov_matched,
        nov_dropped = stats.nov_dropped,
        complaint_matched = stats.complaint_matched,
        complaint_dropped = stats.complaint_dropped,
        blight_matched = stats.blight_matched,
        blight_by_area = stats.blight_by_area,
        blight_unresolved = stats.blight_unresolved,
        tracts = stats.tracts,
        "Normalize complete"
    );

    Normalized {
        parcels,
        tract_counts,
        neighborhood_counts,
        district_counts,
        stats,
    }
}

/// Increments one counter per row on the matching seeded parcel. Also fills
/// a missing address or neighborhood from the row. Returns (matched, dropped).
fn fold_counts(
    parcels: &mut BTreeMap<ParcelId, ParcelRecord>,
    rows: &[RawEventRow],
    counter: fn(&mut ParcelRecord) -> &mut u64,
) -> (usize, usize) {
    let mut matched = 0;
    let mut dropped = 0;

    for row in rows {
        let Some(record) = row.parcel_id().and_then(|id| parcels.get_mut(id)) else {
            dropped += 1;
            continue;
        };
        *counter(record) += 1;
        matched += 1;

        if record.address.is_empty() {
            record.address = seed_address(&row.attributes);
        }
        if record.neighborhood == UNKNOWN_NEIGHBORHOOD {
            if let Some(n) = first_field(&row.attributes, NEIGHBORHOOD_FIELDS) {
                record.neighborhood = n;
            }
        }
        if record.supervisor_district.is_none() {
            record.supervisor_district = first_field(&row.attributes, DISTRICT_FIELDS);
        }
    }

    if dropped > 0 {
        debug!(dropped, "Rows without a seeded parcel dropped");
    }
    (matched, dropped)
}
