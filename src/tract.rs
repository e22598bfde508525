//! Parcel and address to census tract resolution.
//!
//! The lookup itself is external data. [`LookupTable`] reads it from a CSV
//! with `kind,key,tract` rows, where `kind` is `parcel` or `address`:
//! ```text
//! kind,key,tract
//! parcel,3553/022,020800
//! address,1 MAIN ST,061500
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

use crate::parcel::{ParcelId, TractId, normalize_address};

/// Maps parcels and free-text addresses onto census tracts.
pub trait TractResolver: Send + Sync {
    fn tract_for_parcel(&self, parcel: &ParcelId, address: &str) -> Option<TractId>;

    fn tract_for_address(&self, address: &str) -> Option<TractId>;
}

#[derive(Debug, Deserialize)]
struct LookupRecord {
    kind: String,
    key: String,
    tract: String,
}

/// In-memory lookup table. An empty table resolves nothing.
#[derive(Debug, Default, Clone)]
pub struct LookupTable {
    by_parcel: HashMap<ParcelId, TractId>,
    by_address: HashMap<String, TractId>,
}

impl LookupTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open tract table '{}'", path.display()))?;
        let table = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            parcels = table.by_parcel.len(),
            addresses = table.by_address.len(),
            "Tract table loaded"
        );
        Ok(table)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut table = Self::default();

        for (line, result) in rdr.deserialize::<LookupRecord>().enumerate() {
            let record = result.with_context(|| format!("bad tract table row {}", line + 2))?;
            let Some(tract) = TractId::new(&record.tract) else {
                debug!(line = line + 2, "Tract table row without tract");
                continue;
            };
            match record.kind.to_ascii_lowercase().as_str() {
                "parcel" => match ParcelId::parse(&record.key) {
                    Some(id) => {
                        table.by_parcel.insert(id, tract);
                    }
                    None => debug!(key = %record.key, "Unparsable parcel key in tract table"),
                },
                "address" => {
                    table.insert_address(&record.key, tract);
                }
                other => debug!(kind = other, "Unknown tract table row kind"),
            }
        }

        Ok(table)
    }

    pub fn insert_parcel(&mut self, parcel: ParcelId, tract: TractId) {
        self.by_parcel.insert(parcel, tract);
    }

    pub fn insert_address(&mut self, address: &str, tract: TractId) {
        let key = normalize_address(address);
        if !key.is_empty() {
            self.by_address.insert(key, tract);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_parcel.is_empty() && self.by_address.is_empty()
    }
}

impl TractResolver for LookupTable {
    /// Parcel entries win; otherwise the parcel's address is tried.
    fn tract_for_parcel(&self, parcel: &ParcelId, address: &str) -> Option<TractId> {
        self.by_parcel
            .get(parcel)
            .cloned()
            .or_else(|| self.tract_for_address(address))
    }

    fn tract_for_address(&self, address: &str) -> Option<TractId> {
        self.by_address.get(&normalize_address(address)).cloned()
    }
}
