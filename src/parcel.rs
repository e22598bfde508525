//! Parcel and tract identifiers.
//!
//! Feeds spell block-lot keys several ways (`"0012"` + `"3"`, `"0012/003"`,
//! `"0012003"`). Every form is normalized into one canonical [`ParcelId`]
//! before any join happens.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Canonical block-lot key: block zero-padded to four characters, lot
/// upper-cased, joined by `-` (e.g. `3553-022`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ParcelId(String);

impl ParcelId {
    /// Builds a key from separate block and lot fields.
    ///
    /// Returns `None` if either part is empty after trimming.
    pub fn from_block_lot(block: &str, lot: &str) -> Option<Self> {
        let block = block.trim();
        let lot = lot.trim();
        if block.is_empty() || lot.is_empty() {
            return None;
        }
        Some(Self(format!("{:0>4}-{}", block.to_uppercase(), lot.to_uppercase())))
    }

    /// Parses a single-field key: `BBBB-LLL`, `BBBB/LLL`, or concatenated
    /// `BBBBLLL` (block is the first four characters).
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        if let Some((block, lot)) = s.split_once(['/', '-']) {
            return Self::from_block_lot(block, lot);
        }
        if s.len() >= 7 && s.is_char_boundary(4) {
            let (block, lot) = s.split_at(4);
            return Self::from_block_lot(block, lot);
        }
        None
    }

    /// Extracts a key from a raw feed row, trying the field spellings used
    /// across the city's datasets.
    pub fn from_row(row: &Map<String, Value>) -> Option<Self> {
        let pairs = [("block", "lot"), ("block_id", "lot_id"), ("block_num", "lot_num")];
        for (b, l) in pairs {
            if let (Some(block), Some(lot)) = (field_str(row, b), field_str(row, l)) {
                if let Some(id) = Self::from_block_lot(&block, &lot) {
                    return Some(id);
                }
            }
        }

        ["mapblklot", "blklot", "parcel_number"]
            .iter()
            .filter_map(|f| field_str(row, f))
            .find_map(|v| Self::parse(&v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParcelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Census tract identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TractId(String);

impl TractId {
    pub fn new(raw: &str) -> Option<Self> {
        let t = raw.trim();
        if t.is_empty() {
            None
        } else {
            Some(Self(t.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reads a field as a trimmed, non-empty string. Numbers are stringified
/// since SODA is inconsistent about quoting numeric columns.
pub fn field_str(row: &Map<String, Value>, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// First non-empty value among `keys`.
pub fn first_field(row: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| field_str(row, k))
}

/// Upper-cases an address and collapses runs of whitespace so that
/// addresses from different feeds compare equal.
pub fn normalize_address(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join(" ")
}
