pub mod batch;
pub mod cli;
mod config;
mod errors;
pub mod geocode;
pub mod keys;
pub mod rows;
pub mod store;
pub mod workflow;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use batch::{BatchProgress, BatchReport, BatchRunner, FailedKey};
pub use config::{AppConfig, BatchConfig, GeocoderConfig, PublicAppConfig};
pub use errors::{AppError, AppResult};
pub use geocode::{
    Coordinates, FailureReason, GeocodeLookup, GeocodeService, LookupError, NominatimClient,
    Outcome,
};
pub use keys::{KeyExtractor, KeyMode, LookupKey};
pub use rows::{read_rows, RowRecord};
pub use store::{CoordinateMap, StoreMetadata};
pub use workflow::{generate, plan_update, update, RunSummary, UpdatePlan};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,postal_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
