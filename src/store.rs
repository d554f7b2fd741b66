use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::info;

use crate::batch::{percentage, BatchReport};
use crate::config::BatchConfig;
use crate::errors::{AppError, AppResult};
use crate::geocode::Coordinates;
use crate::keys::KeyMode;

pub type CoordinateMap = BTreeMap<String, Coordinates>;

pub const METHOD_BOUNDED: &str = "Bounded Parallel Processing";
pub const METHOD_INCREMENTAL: &str = "Incremental Update";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub key_mode: KeyMode,
    pub total_keys: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: String,
    // persisted mapping, earlier runs included
    pub total_coordinates: usize,
    pub generated_at: String,
    pub processing_method: String,
    pub batch_size: usize,
    pub max_concurrent: usize,
}

impl StoreMetadata {
    pub fn for_run(
        mode: KeyMode,
        report: &BatchReport,
        total_coordinates: usize,
        processing_method: &str,
        batch: &BatchConfig,
    ) -> Self {
        Self {
            key_mode: mode,
            total_keys: report.processed(),
            successful: report.resolved.len(),
            failed: report.failed.len(),
            success_rate: format!(
                "{:.1}%",
                percentage(report.resolved.len(), report.processed())
            ),
            total_coordinates,
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            processing_method: processing_method.to_string(),
            batch_size: batch.batch_size,
            max_concurrent: batch.concurrency_cap,
        }
    }
}

fn coordinates_field(mode: KeyMode) -> &'static str {
    match mode {
        KeyMode::PostalCode => "coordinates",
        KeyMode::CityState => "city_coordinates",
    }
}

fn failed_field(mode: KeyMode) -> &'static str {
    match mode {
        KeyMode::PostalCode => "failed_zips",
        KeyMode::CityState => "failed_cities",
    }
}

struct Document<'a> {
    mode: KeyMode,
    metadata: &'a StoreMetadata,
    coordinates: &'a CoordinateMap,
    failed: &'a [String],
}

impl Serialize for Document<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("metadata", self.metadata)?;
        map.serialize_entry(coordinates_field(self.mode), self.coordinates)?;
        map.serialize_entry(failed_field(self.mode), self.failed)?;
        map.end()
    }
}

pub fn load(path: &Path, mode: KeyMode) -> AppResult<CoordinateMap> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no existing coordinate store; starting fresh");
            return Ok(CoordinateMap::new());
        }
        Err(err) => return Err(AppError::Io(err)),
    };

    let mut document: Value = serde_json::from_str(&contents)?;
    let coordinates = match document.get_mut(coordinates_field(mode)).map(Value::take) {
        Some(value) => serde_json::from_value(value)?,
        None => CoordinateMap::new(),
    };
    info!(
        path = %path.display(),
        entries = coordinates.len(),
        "loaded existing coordinates"
    );
    Ok(coordinates)
}

pub fn merge(mut existing: CoordinateMap, new: CoordinateMap) -> CoordinateMap {
    for (key, coordinates) in new {
        existing.entry(key).or_insert(coordinates);
    }
    existing
}

/// Writes the whole document to a temporary sibling file and renames it over
/// `path`, so readers see either the old or the new document.
pub fn save(
    path: &Path,
    mode: KeyMode,
    coordinates: &CoordinateMap,
    failed: &[String],
    metadata: &StoreMetadata,
) -> AppResult<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let document = Document {
        mode,
        metadata,
        coordinates,
        failed,
    };
    let mut serialized = serde_json::to_vec_pretty(&document)?;
    serialized.push(b'\n');

    let mut staged = NamedTempFile::new_in(parent)?;
    staged.write_all(&serialized)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|err| AppError::Persist {
        path: path.to_path_buf(),
        source: err.error,
    })?;

    info!(
        path = %path.display(),
        entries = coordinates.len(),
        failed = failed.len(),
        "saved coordinate store"
    );
    Ok(())
}
