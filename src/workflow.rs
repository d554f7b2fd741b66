use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::batch::{percentage, BatchReport, BatchRunner};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geocode::GeocodeService;
use crate::keys::{missing_keys, KeyExtractor, KeyMode, LookupKey};
use crate::rows::read_rows;
use crate::store::{self, CoordinateMap, StoreMetadata, METHOD_BOUNDED, METHOD_INCREMENTAL};

const SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: KeyMode,
    pub output: PathBuf,
    pub attempted: usize,
    pub successful: usize,
    pub failed_keys: Vec<String>,
    pub total_coordinates: usize,
    /// False when the run had nothing to resolve and left the output untouched.
    pub written: bool,
}

impl RunSummary {
    fn untouched(mode: KeyMode, output: PathBuf, total_coordinates: usize) -> Self {
        Self {
            mode,
            output,
            attempted: 0,
            successful: 0,
            failed_keys: Vec::new(),
            total_coordinates,
            written: false,
        }
    }

    fn from_report(
        mode: KeyMode,
        output: PathBuf,
        report: &BatchReport,
        total_coordinates: usize,
    ) -> Self {
        Self {
            mode,
            output,
            attempted: report.processed(),
            successful: report.resolved.len(),
            failed_keys: report.failed_keys(),
            total_coordinates,
            written: true,
        }
    }

    pub fn success_rate(&self) -> f64 {
        percentage(self.successful, self.attempted)
    }

    pub fn log(&self) {
        info!(
            mode = self.mode.as_tag(),
            output = %self.output.display(),
            attempted = self.attempted,
            successful = self.successful,
            failed = self.failed_keys.len(),
            total_coordinates = self.total_coordinates,
            success_rate = %format!("{:.1}%", self.success_rate()),
            "run complete"
        );
        log_sample("failed", &self.failed_keys);
    }
}

#[derive(Debug, Clone)]
pub struct UpdatePlan {
    pub mode: KeyMode,
    pub output: PathBuf,
    pub row_keys: usize,
    pub stored: usize,
    pub missing: Vec<LookupKey>,
}

impl UpdatePlan {
    pub fn log(&self) {
        info!(
            mode = self.mode.as_tag(),
            output = %self.output.display(),
            csv_keys = self.row_keys,
            stored = self.stored,
            missing = self.missing.len(),
            "incremental update analysis"
        );
        if self.missing.is_empty() {
            info!("all {} have coordinates", self.mode.display_name());
        } else {
            let sample: Vec<String> = self.missing.iter().map(LookupKey::to_string).collect();
            log_sample("missing", &sample);
        }
    }
}

/// Resolves every key in the input and writes a fresh store, replacing any
/// previous output.
pub async fn generate(
    config: &AppConfig,
    mode: KeyMode,
    service: GeocodeService,
) -> AppResult<RunSummary> {
    let output = config.output_path(mode).to_path_buf();
    let keys = collect_keys(config, mode)?;
    if keys.is_empty() {
        warn!("no valid {} found in input", mode.display_name());
        return Ok(RunSummary::untouched(mode, output, 0));
    }

    let keys = limit_keys(keys.into_iter().collect(), config.key_limit);
    info!(keys = keys.len(), "resolving {}", mode.display_name());

    let report = BatchRunner::new(service, config.batch.clone()).run(&keys).await;
    let metadata = StoreMetadata::for_run(
        mode,
        &report,
        report.resolved.len(),
        METHOD_BOUNDED,
        &config.batch,
    );
    store::save(
        &output,
        mode,
        &report.resolved,
        &report.failed_keys(),
        &metadata,
    )?;

    Ok(RunSummary::from_report(
        mode,
        output,
        &report,
        report.resolved.len(),
    ))
}

pub async fn update(
    config: &AppConfig,
    mode: KeyMode,
    service: GeocodeService,
) -> AppResult<RunSummary> {
    let output = config.output_path(mode).to_path_buf();
    let keys = collect_keys(config, mode)?;
    let existing = load_existing(config, mode);
    let missing = missing_keys(&keys, &existing);
    info!(
        csv_keys = keys.len(),
        stored = existing.len(),
        missing = missing.len(),
        "compared input with existing store"
    );

    if missing.is_empty() {
        info!("no new {} found; no update needed", mode.display_name());
        return Ok(RunSummary::untouched(mode, output, existing.len()));
    }

    let missing = limit_keys(missing, config.key_limit);
    let report = BatchRunner::new(service, config.batch.clone())
        .run(&missing)
        .await;
    let combined = store::merge(existing, report.resolved.clone());
    let metadata = StoreMetadata::for_run(
        mode,
        &report,
        combined.len(),
        METHOD_INCREMENTAL,
        &config.batch,
    );
    store::save(&output, mode, &combined, &report.failed_keys(), &metadata)?;

    Ok(RunSummary::from_report(mode, output, &report, combined.len()))
}

pub fn plan_update(config: &AppConfig, mode: KeyMode) -> AppResult<UpdatePlan> {
    let output = config.output_path(mode).to_path_buf();
    let keys = collect_keys(config, mode)?;
    let existing = store::load(&output, mode)?;
    Ok(UpdatePlan {
        mode,
        row_keys: keys.len(),
        stored: existing.len(),
        missing: missing_keys(&keys, &existing),
        output,
    })
}

fn collect_keys(config: &AppConfig, mode: KeyMode) -> AppResult<BTreeSet<LookupKey>> {
    let rows = read_rows(&config.input_csv)?;
    let keys = KeyExtractor::new(mode)
        .city_requires_missing_zip(config.city_requires_missing_zip)
        .extract(&rows);
    info!(keys = keys.len(), "found unique valid {}", mode.display_name());
    Ok(keys)
}

fn load_existing(config: &AppConfig, mode: KeyMode) -> CoordinateMap {
    let path = config.output_path(mode);
    match store::load(path, mode) {
        Ok(existing) => existing,
        Err(err) => {
            warn!(path = %path.display(), %err, "unable to read existing store; starting fresh");
            CoordinateMap::new()
        }
    }
}

fn limit_keys(mut keys: Vec<LookupKey>, limit: Option<usize>) -> Vec<LookupKey> {
    if let Some(limit) = limit {
        if keys.len() > limit {
            info!(limit, available = keys.len(), "limiting run to the first keys");
            keys.truncate(limit);
        }
    }
    keys
}

fn log_sample(label: &str, keys: &[String]) {
    if keys.is_empty() {
        return;
    }
    info!("{label} keys (first {}):", SAMPLE_SIZE.min(keys.len()));
    for key in keys.iter().take(SAMPLE_SIZE) {
        info!("   - {key}");
    }
    if keys.len() > SAMPLE_SIZE {
        info!("   ... and {} more", keys.len() - SAMPLE_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn limit_keeps_the_first_sorted_keys() {
        let keys: Vec<LookupKey> = ["10001", "20002", "30003"]
            .iter()
            .filter_map(|zip| LookupKey::postal_code(zip))
            .collect();
        let limited = limit_keys(keys.clone(), Some(2));
        assert_eq!(limited, keys[..2].to_vec());
        assert_eq!(limit_keys(keys.clone(), None), keys);
    }

    #[test]
    fn plan_reports_missing_keys_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("rows.csv");
        fs::write(&input, "zip,city,state\n10001,New York,NY\n90210,Beverly Hills,CA\n").unwrap();
        let output = dir.path().join("zip_coordinates.json");
        fs::write(
            &output,
            r#"{"metadata": {}, "coordinates": {"10001": {"latitude": 40.7, "longitude": -74.0}}, "failed_zips": []}"#,
        )
        .unwrap();
        let config = AppConfig {
            input_csv: input,
            zip_output: output,
            ..AppConfig::default()
        };

        let plan = plan_update(&config, KeyMode::PostalCode).unwrap();
        assert_eq!(plan.row_keys, 2);
        assert_eq!(plan.stored, 1);
        assert_eq!(plan.missing.len(), 1);
        assert_eq!(plan.missing[0].as_str(), "90210");
    }

    #[test]
    fn corrupt_store_is_treated_as_empty_by_update() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("zip_coordinates.json");
        fs::write(&output, "[1, 2").unwrap();
        let config = AppConfig {
            zip_output: output,
            ..AppConfig::default()
        };
        assert!(load_existing(&config, KeyMode::PostalCode).is_empty());
    }
}
