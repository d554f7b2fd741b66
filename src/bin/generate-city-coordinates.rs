use std::process::ExitCode;

use postal_geocoder::cli::{run, Command};
use postal_geocoder::KeyMode;

#[tokio::main]
async fn main() -> ExitCode {
    run(Command::Generate(KeyMode::CityState)).await
}
