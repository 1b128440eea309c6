//! Desktop simulator for the valve-ap actuator controller.
//!
//! Runs the same bring-up sequence as the firmware against an in-memory
//! platform, then serves the control endpoint on localhost. Pin writes land
//! in a simulated pin bank and are logged.
//!
//! ```text
//! RUST_LOG=debug cargo run -p valve-simulator -- --port 8080
//! curl -X POST localhost:8080/gpio -d '{"GPIO":4,"sts":"on"}'
//! ```

mod pins;
mod platform;
mod stream;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use embassy_futures::block_on;
use log::{error, info};
use valve_core::bringup::Sequencer;
use valve_core::config::NetworkConfig;
use valve_core::gpio::{MAX_PIN, PinAvailability, PinMask};

use crate::pins::SimulatedPins;
use crate::platform::SimulatedPlatform;

#[derive(Parser)]
#[command(name = "valve-simulator", version, about = "Simulated valve-ap controller")]
struct Cli {
    /// JSON network configuration; defaults apply to missing fields, strings
    /// may contain escapes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured listener port
    #[arg(short, long)]
    port: Option<u16>,

    /// Extra pins to treat as reserved, e.g. `--reserve 19,20`
    #[arg(long, value_delimiter = ',')]
    reserve: Vec<u8>,

    /// Start with a corrupted settings store to exercise the erase path
    #[arg(long)]
    corrupt_store: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let text = match &cli.config {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(e) => {
                error!("cannot read {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let mut config = match text.as_deref().map(serde_json::from_str::<NetworkConfig>) {
        None => NetworkConfig::default(),
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    let reserved = cli
        .reserve
        .iter()
        .filter(|&&pin| pin <= MAX_PIN)
        .fold(PinMask::EMPTY, |mask, &pin| mask.with(pin));
    let pins = Arc::new(SimulatedPins::new(PinAvailability::ESP32S3.reserve(reserved)));

    let mut platform = SimulatedPlatform::new(pins);
    if cli.corrupt_store {
        platform.corrupt_store();
    }

    let platform = match Sequencer::new(&config, platform) {
        Ok(sequencer) => block_on(sequencer.run()),
        Err(e) => Err(e),
    };
    let platform = match platform {
        Ok(platform) => platform,
        Err(e) => {
            error!("{}", e);
            error!("device halted in {:?}", e.stage());
            return ExitCode::FAILURE;
        }
    };

    info!(
        "access point {:?} up at {:?}, leasing={}",
        platform.access_point().map(|ap| ap.ssid.as_str()),
        platform.address(),
        platform.leasing()
    );
    platform.serve_forever();
    ExitCode::SUCCESS
}
