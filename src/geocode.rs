use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::config::GeocoderConfig;
use crate::errors::AppResult;
use crate::keys::{KeyMode, LookupKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    Timeout,
    NotFound,
    #[serde(rename = "transport-error")]
    Transport,
    RateLimited,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::NotFound => "not-found",
            FailureReason::Transport => "transport-error",
            FailureReason::RateLimited => "rate-limited",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Coordinates),
    Failure(FailureReason),
}

// A definitive "no match" is `Ok(None)`, never a `LookupError`.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("request timed out")]
    Timeout,
    #[error("geocoding service is rate limiting requests")]
    RateLimited,
    #[error("geocoding service responded with {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Request(reqwest::Error),
}

impl LookupError {
    pub fn reason(&self) -> FailureReason {
        match self {
            LookupError::Timeout => FailureReason::Timeout,
            LookupError::RateLimited => FailureReason::RateLimited,
            LookupError::Status(_) | LookupError::Request(_) => FailureReason::Transport,
        }
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LookupError::Timeout
        } else if err.status() == Some(StatusCode::TOO_MANY_REQUESTS) {
            LookupError::RateLimited
        } else {
            LookupError::Request(err)
        }
    }
}

#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn lookup(&self, key: &LookupKey) -> Result<Option<Coordinates>, LookupError>;
}

#[derive(Clone)]
pub struct GeocodeService {
    inner: Arc<dyn GeocodeLookup>,
    request_timeout: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl GeocodeService {
    pub fn new(config: &GeocoderConfig) -> AppResult<Self> {
        let client = NominatimClient::new(config)?;
        Ok(Self::from_lookup(Arc::new(client), config))
    }

    pub fn from_lookup(lookup: Arc<dyn GeocodeLookup>, config: &GeocoderConfig) -> Self {
        let rate_limiter = (config.rate_limit_qps > 0)
            .then(|| Arc::new(RateLimiter::new(config.rate_limit_qps)));
        Self {
            inner: lookup,
            request_timeout: config.request_timeout,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay,
            rate_limiter,
        }
    }

    pub async fn resolve(&self, key: &LookupKey) -> Outcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.rate_limiter {
                limiter.wait().await;
            }
            let result = match timeout(self.request_timeout, self.inner.lookup(key)).await {
                Ok(result) => result,
                Err(_) => Err(LookupError::Timeout),
            };
            match result {
                Ok(Some(coordinates)) => {
                    debug!(
                        %key,
                        latitude = coordinates.latitude,
                        longitude = coordinates.longitude,
                        "resolved coordinates"
                    );
                    return Outcome::Success(coordinates);
                }
                Ok(None) => {
                    warn!(%key, "no coordinates found");
                    return Outcome::Failure(FailureReason::NotFound);
                }
                Err(err) if attempt < self.max_attempts => {
                    warn!(
                        %key,
                        %err,
                        attempt,
                        reason = %err.reason(),
                        "geocode lookup failed; retrying after {:?}",
                        self.retry_delay
                    );
                    sleep(self.retry_delay).await;
                }
                Err(err) => {
                    warn!(
                        %key,
                        %err,
                        attempt,
                        last_reason = %err.reason(),
                        "geocode lookup failed; giving up"
                    );
                    return Outcome::Failure(FailureReason::Transport);
                }
            }
        }
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        interval_ms.max(50)
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

pub struct NominatimClient {
    http: reqwest::Client,
    endpoint: String,
    country_code: Option<String>,
}

impl NominatimClient {
    pub fn new(config: &GeocoderConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            country_code: config
                .country_code
                .clone()
                .filter(|code| !code.trim().is_empty()),
        })
    }

    fn query(&self, key: &LookupKey) -> Vec<(&'static str, String)> {
        let mut params = vec![("format", "json".to_string()), ("limit", "1".to_string())];
        match key.mode() {
            KeyMode::PostalCode => {
                params.push(("postalcode", key.as_str().to_string()));
                if let Some(code) = &self.country_code {
                    params.push(("country", code.to_ascii_uppercase()));
                }
            }
            KeyMode::CityState => {
                params.push(("q", key.as_str().to_string()));
                if let Some(code) = &self.country_code {
                    params.push(("countrycodes", code.to_ascii_lowercase()));
                }
            }
        }
        params
    }
}

#[async_trait]
impl GeocodeLookup for NominatimClient {
    async fn lookup(&self, key: &LookupKey) -> Result<Option<Coordinates>, LookupError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&self.query(key))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LookupError::RateLimited);
        }
        if !status.is_success() {
            return Err(LookupError::Status(status));
        }

        let hits: Vec<SearchHit> = response.json().await?;
        Ok(hits.into_iter().next().and_then(SearchHit::into_coordinates))
    }
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: Option<Value>,
    lon: Option<Value>,
    display_name: Option<String>,
}

impl SearchHit {
    fn into_coordinates(self) -> Option<Coordinates> {
        let latitude = parse_degrees(self.lat.as_ref()?)?;
        let longitude = parse_degrees(self.lon.as_ref()?)?;
        Some(Coordinates {
            latitude,
            longitude,
            display_name: self.display_name.filter(|name| !name.trim().is_empty()),
        })
    }
}

// Nominatim encodes degrees as strings; accept bare numbers too.
fn parse_degrees(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        Value::Number(number) => number.as_f64()?,
        _ => return None,
    };
    parsed.is_finite().then_some(parsed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    struct ScriptedLookup {
        responses: Mutex<Vec<Result<Option<Coordinates>, LookupError>>>,
        attempts: AtomicUsize,
    }

    impl ScriptedLookup {
        // Responses are popped from the back.
        fn new(responses: Vec<Result<Option<Coordinates>, LookupError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                attempts: AtomicUsize::new(0),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeocodeLookup for ScriptedLookup {
        async fn lookup(&self, _key: &LookupKey) -> Result<Option<Coordinates>, LookupError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().pop().unwrap_or(Ok(None))
        }
    }

    struct HangingLookup {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl GeocodeLookup for HangingLookup {
        async fn lookup(&self, _key: &LookupKey) -> Result<Option<Coordinates>, LookupError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_secs(5)).await;
            Ok(Some(Coordinates::new(0.0, 0.0)))
        }
    }

    fn fast_config() -> GeocoderConfig {
        GeocoderConfig {
            request_timeout: Duration::from_millis(50),
            retry_delay: Duration::from_millis(1),
            ..GeocoderConfig::default()
        }
    }

    fn zip(value: &str) -> LookupKey {
        LookupKey::postal_code(value).unwrap()
    }

    #[tokio::test]
    async fn retries_before_succeeding() {
        let lookup = Arc::new(ScriptedLookup::new(vec![
            Ok(Some(Coordinates::new(40.7, -74.0))),
            Err(LookupError::Status(StatusCode::BAD_GATEWAY)),
        ]));
        let service = GeocodeService::from_lookup(lookup.clone(), &fast_config());

        let outcome = service.resolve(&zip("10001")).await;
        assert_eq!(outcome, Outcome::Success(Coordinates::new(40.7, -74.0)));
        assert_eq!(lookup.attempts(), 2);
    }

    #[tokio::test]
    async fn empty_result_is_not_retried() {
        let lookup = Arc::new(ScriptedLookup::new(vec![Ok(None)]));
        let service = GeocodeService::from_lookup(lookup.clone(), &fast_config());

        let outcome = service.resolve(&zip("00000")).await;
        assert_eq!(outcome, Outcome::Failure(FailureReason::NotFound));
        assert_eq!(lookup.attempts(), 1);
    }

    #[tokio::test]
    async fn timeouts_exhaust_the_attempt_budget() {
        let lookup = Arc::new(HangingLookup {
            attempts: AtomicUsize::new(0),
        });
        let service = GeocodeService::from_lookup(lookup.clone(), &fast_config());

        let outcome = service.resolve(&zip("10001")).await;
        assert_eq!(lookup.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(outcome, Outcome::Failure(FailureReason::Transport));
    }

    #[tokio::test]
    async fn exhausted_retries_report_transport_failure() {
        let lookup = Arc::new(ScriptedLookup::new(vec![
            Err(LookupError::RateLimited),
            Err(LookupError::Timeout),
        ]));
        let config = GeocoderConfig {
            max_attempts: 2,
            ..fast_config()
        };
        let service = GeocodeService::from_lookup(lookup.clone(), &config);

        let outcome = service.resolve(&zip("10001")).await;
        assert_eq!(outcome, Outcome::Failure(FailureReason::Transport));
        assert_eq!(lookup.attempts(), 2);
    }

    #[tokio::test]
    async fn rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(10);
        let started = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn parses_string_and_numeric_degrees() {
        let hit: SearchHit = serde_json::from_value(json!({
            "lat": "30.2711286",
            "lon": -97.7436995,
            "display_name": "Austin, Travis County, Texas, United States"
        }))
        .unwrap();
        let coordinates = hit.into_coordinates().unwrap();
        assert!((coordinates.latitude - 30.2711286).abs() < 1e-9);
        assert!((coordinates.longitude + 97.7436995).abs() < 1e-9);
        assert!(coordinates.display_name.is_some());

        let broken: SearchHit =
            serde_json::from_value(json!({ "lat": "north", "lon": "1.0" })).unwrap();
        assert!(broken.into_coordinates().is_none());
        let partial: SearchHit = serde_json::from_value(json!({ "lat": "1.0" })).unwrap();
        assert!(partial.into_coordinates().is_none());
    }

    #[test]
    fn builds_queries_per_key_mode() {
        let client = NominatimClient::new(&GeocoderConfig::default()).unwrap();
        let postal = client.query(&zip("90210"));
        assert!(postal.contains(&("postalcode", "90210".to_string())));
        assert!(postal.contains(&("country", "US".to_string())));

        let city = client.query(&LookupKey::city_state("Austin", "TX").unwrap());
        assert!(city.contains(&("q", "Austin, TX".to_string())));
        assert!(city.contains(&("countrycodes", "us".to_string())));
        assert!(!city.iter().any(|(name, _)| *name == "postalcode"));
    }
}
