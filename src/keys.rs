use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rows::RowRecord;

pub const ZIP_COLUMNS: &[&str] = &["zip", "zip code", "zipcode", "postal_code"];
const CITY_COLUMN: &str = "city";
const STATE_COLUMN: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    PostalCode,
    CityState,
}

impl KeyMode {
    pub fn as_tag(&self) -> &'static str {
        match self {
            KeyMode::PostalCode => "postal_code",
            KeyMode::CityState => "city_state",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            KeyMode::PostalCode => "zip codes",
            KeyMode::CityState => "cities",
        }
    }
}

/// A validated geocoding key. Ordering follows the key text so batches are
/// numbered the same way on every run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupKey {
    text: String,
    mode: KeyMode,
}

impl LookupKey {
    pub fn postal_code(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() == 5 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self {
                text: trimmed.to_string(),
                mode: KeyMode::PostalCode,
            })
        } else {
            None
        }
    }

    pub fn city_state(city: &str, state: &str) -> Option<Self> {
        let city = city.trim();
        let state = state.trim();
        if city.is_empty() || state.is_empty() {
            return None;
        }
        Some(Self {
            text: format!("{city}, {state}"),
            mode: KeyMode::CityState,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyExtractor {
    mode: KeyMode,
    city_requires_missing_zip: bool,
}

impl KeyExtractor {
    pub fn new(mode: KeyMode) -> Self {
        Self {
            mode,
            city_requires_missing_zip: true,
        }
    }

    pub fn city_requires_missing_zip(mut self, value: bool) -> Self {
        self.city_requires_missing_zip = value;
        self
    }

    pub fn key_for(&self, row: &RowRecord) -> Option<LookupKey> {
        match self.mode {
            KeyMode::PostalCode => row.first_of(ZIP_COLUMNS).and_then(LookupKey::postal_code),
            KeyMode::CityState => {
                if self.city_requires_missing_zip && row.first_of(ZIP_COLUMNS).is_some() {
                    return None;
                }
                LookupKey::city_state(row.get(CITY_COLUMN)?, row.get(STATE_COLUMN)?)
            }
        }
    }

    pub fn extract<'a, I>(&self, rows: I) -> BTreeSet<LookupKey>
    where
        I: IntoIterator<Item = &'a RowRecord>,
    {
        rows.into_iter().filter_map(|row| self.key_for(row)).collect()
    }
}

pub fn missing_keys<V>(keys: &BTreeSet<LookupKey>, existing: &BTreeMap<String, V>) -> Vec<LookupKey> {
    keys.iter()
        .filter(|key| !existing.contains_key(key.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RowRecord {
        RowRecord::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn validates_postal_codes() {
        assert_eq!(LookupKey::postal_code(" 02134 ").unwrap().as_str(), "02134");
        assert!(LookupKey::postal_code("1234").is_none());
        assert!(LookupKey::postal_code("123456").is_none());
        assert!(LookupKey::postal_code("12a45").is_none());
        assert!(LookupKey::postal_code("12345-6789").is_none());
        assert!(LookupKey::postal_code("").is_none());
    }

    #[test]
    fn extracts_unique_sorted_postal_codes() {
        let rows = vec![
            row(&[("zip", "90210")]),
            row(&[("zip", " 10001")]),
            row(&[("zip", "90210")]),
            row(&[("zip", "bad")]),
            row(&[("zip", ""), ("postal_code", "60601")]),
            row(&[("city", "Nowhere")]),
        ];
        let keys = KeyExtractor::new(KeyMode::PostalCode).extract(&rows);
        let texts: Vec<&str> = keys.iter().map(LookupKey::as_str).collect();
        assert_eq!(texts, vec!["10001", "60601", "90210"]);
        assert!(keys.iter().all(|key| key.mode() == KeyMode::PostalCode));
    }

    #[test]
    fn city_mode_requires_both_parts() {
        let rows = vec![
            row(&[("zip", ""), ("city", " Austin "), ("state", "TX")]),
            row(&[("zip", ""), ("city", "Austin"), ("state", "TX ")]),
            row(&[("zip", ""), ("city", ""), ("state", "TX")]),
            row(&[("zip", ""), ("city", "Dallas"), ("state", "  ")]),
            row(&[("zip", "78701"), ("city", "Houston"), ("state", "TX")]),
        ];
        let keys = KeyExtractor::new(KeyMode::CityState).extract(&rows);
        let texts: Vec<&str> = keys.iter().map(LookupKey::as_str).collect();
        assert_eq!(texts, vec!["Austin, TX"]);

        let all = KeyExtractor::new(KeyMode::CityState)
            .city_requires_missing_zip(false)
            .extract(&rows);
        let texts: Vec<&str> = all.iter().map(LookupKey::as_str).collect();
        assert_eq!(texts, vec!["Austin, TX", "Houston, TX"]);
    }

    #[test]
    fn missing_keys_skips_stored_entries() {
        let rows = vec![row(&[("zip", "10001")]), row(&[("zip", "90210")])];
        let keys = KeyExtractor::new(KeyMode::PostalCode).extract(&rows);
        let mut existing = BTreeMap::new();
        existing.insert("10001".to_string(), ());
        let missing = missing_keys(&keys, &existing);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].as_str(), "90210");
    }
}
