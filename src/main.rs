//! `syringe-pump` command-line tool.
//!
//! Each invocation connects, performs one action and disconnects. Ctrl-C during
//! `pump` or `waste` stops the device before exiting.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use syringe_pump::adapters::{Connector, MockConnector, MockPump};
use syringe_pump::config::PumpConfig;
use syringe_pump::logging;
use syringe_pump::pump::{Channel, PumpSession, SessionOptions};
use syringe_pump::PumpResult;

#[derive(Parser)]
#[command(name = "syringe-pump", version, about = "Drive a dual-channel syringe pump")]
struct Cli {
    /// Configuration file (defaults to config/pump.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port, overriding serial.port
    #[arg(long, global = true)]
    port: Option<String>,

    /// Talk to an in-process simulated pump instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    /// Log level, overriding application.log_level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the pump state as JSON
    Status,
    /// Reset the pump to a known state
    Init,
    /// Aspirate a volume, splitting it into strokes as needed
    Pump {
        /// A, B or A+B
        #[arg(long)]
        channel: Channel,
        /// Volume in uL
        #[arg(long)]
        volume: f64,
        /// Aspirate rate in uL/min
        #[arg(long)]
        aspirate_rate: f64,
        /// Dispense-to-waste rate in uL/min
        #[arg(long)]
        dispense_rate: f64,
        /// Syringe volume in uL, overriding syringe.volume_ul
        #[arg(long)]
        syringe_volume: Option<f64>,
    },
    /// Empty the syringe(s) to waste
    Waste {
        /// A, B or A+B
        #[arg(long)]
        channel: Channel,
        /// Dispense rate in uL/min
        #[arg(long)]
        rate: f64,
        /// Syringe volume in uL, overriding syringe.volume_ul
        #[arg(long)]
        syringe_volume: Option<f64>,
    },
    /// Kill the running command and clear the queue. Does not wait for a
    /// stroke in progress to finish before sending the kill.
    Stop,
    /// Print the firmware version
    Version,
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[cfg(feature = "instrument_serial")]
fn serial_connector() -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(syringe_pump::adapters::SerialConnector))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_connector() -> Result<Arc<dyn Connector>> {
    Err(anyhow!(
        "built without the instrument_serial feature; use --simulate"
    ))
}

fn load_config(cli: &Cli) -> Result<PumpConfig> {
    let mut config = match &cli.config {
        Some(path) => PumpConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PumpConfig::load()?,
    };
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    if let Some(port) = &cli.port {
        config.serial.port = Some(port.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Drive `operation` to completion, logging progress and turning Ctrl-C into a stop.
async fn supervise<T>(
    session: &Arc<PumpSession>,
    operation: impl Future<Output = PumpResult<T>>,
) -> PumpResult<T> {
    let mut updates = session.subscribe();
    let mut interrupted = false;
    tokio::pin!(operation);

    loop {
        tokio::select! {
            result = &mut operation => return result,
            Ok(()) = updates.changed() => {
                let snapshot = updates.borrow_and_update().clone();
                if let Some(progress) = &snapshot.progress {
                    info!(
                        state = %snapshot,
                        direction = %progress.direction,
                        stroke_ul = progress.stroke_volume_ul,
                        pumped_ul = progress.pumped_volume_ul,
                        total_ul = progress.total_volume_ul,
                        "Progress"
                    );
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("Interrupted, stopping pump");
                // Runs beside the operation, which may be holding the link mid-exchange.
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    if let Err(e) = session.stop().await {
                        error!(error = %e, "Stop failed");
                    }
                });
            }
        }
    }
}

async fn run(command: Commands, session: &Arc<PumpSession>, config: &PumpConfig) -> Result<()> {
    match command {
        Commands::Status => {
            session.poll_status().await?;
            println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
        }
        Commands::Init => {
            session.initialise().await?;
            println!("Pump initialised");
        }
        Commands::Pump {
            channel,
            volume,
            aspirate_rate,
            dispense_rate,
            syringe_volume,
        } => {
            let syringe_volume = syringe_volume.unwrap_or(config.syringe.volume_ul);
            let report = supervise(
                session,
                session.pump(channel, volume, aspirate_rate, dispense_rate, syringe_volume),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Waste {
            channel,
            rate,
            syringe_volume,
        } => {
            let syringe_volume = syringe_volume.unwrap_or(config.syringe.volume_ul);
            supervise(
                session,
                session.dispense_to_waste(channel, rate, syringe_volume),
            )
            .await?;
            println!("Syringe {channel} emptied to waste");
        }
        Commands::Stop => {
            session.stop().await?;
            println!("Pump stopped");
        }
        Commands::Version => {
            println!("{}", session.firmware_version().await?);
        }
        Commands::ShowConfig => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init(&config.application)?;

    if matches!(cli.command, Commands::ShowConfig) {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let (connector, port): (Arc<dyn Connector>, String) = if cli.simulate {
        (Arc::new(MockConnector::new(MockPump::new())), "simulated".to_string())
    } else {
        let port = config
            .serial
            .port
            .clone()
            .ok_or_else(|| anyhow!("no serial port configured; pass --port or set serial.port"))?;
        (serial_connector()?, port)
    };

    info!(app = %config.application.name, %port, "Starting");
    let session = Arc::new(PumpSession::new(connector, SessionOptions::from(&config)));
    let connected = match cli.command {
        Commands::Stop => session.connect_without_wait(&port).await.map(|_| ()),
        _ => session.connect(&port).await,
    };
    connected.with_context(|| format!("connecting to {port}"))?;

    let outcome = run(cli.command, &session, &config).await;

    if let Err(e) = session.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    outcome
}
