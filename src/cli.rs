use std::process::ExitCode;

use anyhow::Context;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::geocode::GeocodeService;
use crate::init_tracing;
use crate::keys::KeyMode;
use crate::workflow;

#[derive(Debug, Clone, Copy)]
pub enum Command {
    Generate(KeyMode),
    Update(KeyMode),
    Check(KeyMode),
}

pub async fn run(command: Command) -> ExitCode {
    init_tracing();
    let config = AppConfig::from_env();
    match serde_json::to_string(&config.public_profile()) {
        Ok(profile) => info!(%profile, ?command, "configuration loaded"),
        Err(err) => info!(?err, ?command, "configuration loaded"),
    }

    match execute(command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err, &config);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, config: &AppConfig) -> anyhow::Result<()> {
    match command {
        Command::Generate(mode) => {
            let service = GeocodeService::new(&config.geocoder)?;
            workflow::generate(config, mode, service).await?.log();
        }
        Command::Update(mode) => {
            let service = GeocodeService::new(&config.geocoder)?;
            workflow::update(config, mode, service).await?.log();
        }
        Command::Check(mode) => {
            workflow::plan_update(config, mode)
                .with_context(|| format!("failed to analyse {}", config.output_path(mode).display()))?
                .log();
        }
    }
    Ok(())
}

fn report(err: &anyhow::Error, config: &AppConfig) {
    if let Some(AppError::MissingInput(path)) = err.downcast_ref::<AppError>() {
        error!(
            path = %path.display(),
            "CSV file '{}' not found; make sure it exists or set GEOCODER_INPUT_CSV",
            config.input_csv.display()
        );
        return;
    }
    error!("{err:#}");
}
