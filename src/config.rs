use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

use crate::keys::KeyMode;

const DEFAULT_INPUT_CSV: &str = "01_master_all_states.csv";
const DEFAULT_ZIP_OUTPUT: &str = "zip_coordinates.json";
const DEFAULT_CITY_OUTPUT: &str = "city_coordinates.json";
const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_USER_AGENT: &str = "OrganizationSearch/1.0";
const DEFAULT_COUNTRY_CODE: &str = "US";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub input_csv: PathBuf,
    pub zip_output: PathBuf,
    pub city_output: PathBuf,
    pub key_limit: Option<usize>,
    pub city_requires_missing_zip: bool,
    pub geocoder: GeocoderConfig,
    pub batch: BatchConfig,
}

#[derive(Clone, Debug)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub country_code: Option<String>,
    pub request_timeout: Duration,
    // total attempts, the first one included
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub rate_limit_qps: u32,
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub concurrency_cap: usize,
    pub inter_batch_delay: Duration,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub input_csv: String,
    pub zip_output: String,
    pub city_output: String,
    pub key_limit: Option<usize>,
    pub city_requires_missing_zip: bool,
    pub endpoint: String,
    pub country_code: Option<String>,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub rate_limit_qps: u32,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub batch_delay_ms: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            country_code: Some(DEFAULT_COUNTRY_CODE.to_string()),
            request_timeout: Duration::from_secs(15),
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            rate_limit_qps: 0,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency_cap: 20,
            inter_batch_delay: Duration::from_secs(2),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_csv: PathBuf::from(DEFAULT_INPUT_CSV),
            zip_output: PathBuf::from(DEFAULT_ZIP_OUTPUT),
            city_output: PathBuf::from(DEFAULT_CITY_OUTPUT),
            key_limit: None,
            city_requires_missing_zip: true,
            geocoder: GeocoderConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = GeocoderConfig::default();
        let batch_defaults = BatchConfig::default();
        Self {
            input_csv: parse_path("GEOCODER_INPUT_CSV", DEFAULT_INPUT_CSV),
            zip_output: parse_path("GEOCODER_ZIP_OUTPUT", DEFAULT_ZIP_OUTPUT),
            city_output: parse_path("GEOCODER_CITY_OUTPUT", DEFAULT_CITY_OUTPUT),
            key_limit: env::var("GEOCODER_KEY_LIMIT")
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok()),
            city_requires_missing_zip: parse_bool("GEOCODER_CITY_REQUIRES_MISSING_ZIP", true),
            geocoder: GeocoderConfig {
                endpoint: env::var("NOMINATIM_ENDPOINT")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or(defaults.endpoint),
                user_agent: env::var("GEOCODER_USER_AGENT")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or(defaults.user_agent),
                country_code: match env::var("GEOCODER_COUNTRY_CODE") {
                    Ok(value) if value.trim().is_empty() => None,
                    Ok(value) => Some(value.trim().to_string()),
                    Err(_) => defaults.country_code,
                },
                request_timeout: Duration::from_secs(
                    parse_u64("GEOCODER_TIMEOUT_SECS", defaults.request_timeout.as_secs()).max(1),
                ),
                max_attempts: parse_u32("GEOCODER_MAX_ATTEMPTS", defaults.max_attempts).max(1),
                retry_delay: Duration::from_millis(parse_u64(
                    "GEOCODER_RETRY_DELAY_MS",
                    defaults.retry_delay.as_millis() as u64,
                )),
                rate_limit_qps: parse_u32("GEOCODER_RATE_LIMIT_QPS", defaults.rate_limit_qps),
            },
            batch: BatchConfig {
                batch_size: parse_usize("GEOCODER_BATCH_SIZE", batch_defaults.batch_size).max(1),
                concurrency_cap: parse_usize(
                    "GEOCODER_MAX_CONCURRENT",
                    batch_defaults.concurrency_cap,
                )
                .max(1),
                inter_batch_delay: Duration::from_millis(parse_u64(
                    "GEOCODER_BATCH_DELAY_MS",
                    batch_defaults.inter_batch_delay.as_millis() as u64,
                )),
            },
        }
    }

    pub fn output_path(&self, mode: KeyMode) -> &Path {
        match mode {
            KeyMode::PostalCode => &self.zip_output,
            KeyMode::CityState => &self.city_output,
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            input_csv: self.input_csv.display().to_string(),
            zip_output: self.zip_output.display().to_string(),
            city_output: self.city_output.display().to_string(),
            key_limit: self.key_limit,
            city_requires_missing_zip: self.city_requires_missing_zip,
            endpoint: self.geocoder.endpoint.clone(),
            country_code: self.geocoder.country_code.clone(),
            request_timeout_secs: self.geocoder.request_timeout.as_secs(),
            max_attempts: self.geocoder.max_attempts,
            retry_delay_ms: self.geocoder.retry_delay.as_millis() as u64,
            rate_limit_qps: self.geocoder.rate_limit_qps,
            batch_size: self.batch.batch_size,
            max_concurrent: self.batch.concurrency_cap,
            batch_delay_ms: self.batch.inter_batch_delay.as_millis() as u64,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
