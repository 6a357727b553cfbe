//! Command line front end for BLEConnect.
//!
//! Everything runs over the in-process simulated radio: `replay` and
//! `send-test` stand up a peripheral and a central on one simulated network
//! and print what the central decodes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use bleconnect::ble::simulated::SimBleNetwork;
use bleconnect::simulator::test_message;
use bleconnect::{
    CentralService, CentralUpdate, Config, InstructionLog, InstructionSimulator, JsonFileStore,
    KeyValueStore, KnownPeers, MemoryStore, NavigationMessage, PeripheralService,
    SimulatorUpdate,
};

/// How long to keep listening for the last reads after a replay ends.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "bleconnect")]
#[command(about = "Parse, decode and replay BLE navigation data", version)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a navigation log and list its instructions
    Parse {
        log: PathBuf,

        /// Print the instructions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode a hex-encoded navigation payload
    Decode { hex: String },

    /// Replay a log from a simulated peripheral to a simulated central
    Replay {
        log: PathBuf,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Playback speed multiplier
        #[arg(short, long)]
        speed: Option<f64>,
    },

    /// Push random test messages over a simulated link
    SendTest {
        /// Number of messages to send
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.command {
        Command::Parse { log, json } => parse(&log, json),
        Command::Decode { hex } => decode(&hex),
        Command::Replay { log, config, speed } => replay(&log, config.as_deref(), speed).await,
        Command::SendTest { count, config } => send_test(count, config.as_deref()).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn parse(path: &Path, json: bool) -> Result<()> {
    let log = InstructionLog::from_file(path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(log.instructions())?);
        return Ok(());
    }

    for (index, instruction) in log.instructions().iter().enumerate() {
        println!(
            "{:>4}  +{:>7.3}s  {:<22} {:>6}m  {}",
            index,
            instruction.delay_to_next.as_secs_f64(),
            format!("{:?}", instruction.direction),
            instruction.distance_m(),
            instruction.street_name()
        );
    }
    println!(
        "{} instructions, {:.1}s of playback",
        log.len(),
        log.duration().as_secs_f64()
    );
    Ok(())
}

fn decode(hex_payload: &str) -> Result<()> {
    let bytes = hex::decode(hex_payload.trim()).context("Payload is not valid hex")?;
    let message = NavigationMessage::decode(&bytes)?;

    println!("identifier:  {:#010x}", message.identifier);
    println!(
        "direction:   {:?} ({})",
        message.direction,
        message.direction.icon_name().unwrap_or("no icon")
    );
    println!("distance:    {} m", message.distance_m);
    println!("street:      {:?}", message.street_name);
    Ok(())
}

/// A peripheral and a central connected over one simulated network.
struct Link {
    peripheral: Arc<PeripheralService>,
    central: Arc<CentralService>,
    central_updates: mpsc::UnboundedReceiver<CentralUpdate>,
}

impl Link {
    async fn establish(config: &Config) -> Result<Self> {
        let network = SimBleNetwork::new();

        let peripheral_radio = Arc::new(network.create_peripheral());
        let (peripheral, mut peripheral_updates) =
            PeripheralService::new(peripheral_radio, config.peripheral());
        peripheral.run();
        peripheral.set_up_service().await?;
        peripheral.start_advertising(true).await?;
        tokio::spawn(async move {
            while let Some(update) = peripheral_updates.recv().await {
                log::info!("Peripheral: {:?}", update);
            }
        });

        let store: Arc<dyn KeyValueStore> = match &config.known_peer_store {
            Some(path) => Arc::new(JsonFileStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let central_radio = Arc::new(network.create_central());
        let (central, mut central_updates) =
            CentralService::new(central_radio, KnownPeers::new(store), config.central());
        central.run();
        central.start_discovery().await?;

        let peer = loop {
            match central_updates.recv().await {
                Some(CentralUpdate::PeersDiscovered(peers)) if !peers.is_empty() => {
                    break peers[0].address.clone();
                }
                Some(_) => continue,
                None => bail!("Central stopped before discovering a peripheral"),
            }
        };
        central.connect(&peer).await?;

        Ok(Self {
            peripheral,
            central,
            central_updates,
        })
    }

    async fn next_message(&mut self) -> Result<NavigationMessage> {
        loop {
            match self.central_updates.recv().await {
                Some(CentralUpdate::Navigation(message)) => return Ok(message),
                Some(CentralUpdate::DecodeFailed { error, .. }) => return Err(error.into()),
                Some(_) => continue,
                None => bail!("Central stopped"),
            }
        }
    }

    async fn close(self) {
        self.central.disconnect_all().await;
        self.peripheral.stop_service().await;
    }
}

async fn replay(path: &Path, config_path: Option<&Path>, speed: Option<f64>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(speed) = speed {
        config.simulator.playback_speed = speed;
        config.validate()?;
    }

    let log = InstructionLog::from_file(path)?;
    if log.is_empty() {
        bail!("{} contains no instructions", path.display());
    }
    let mut link = Link::establish(&config).await?;

    let (simulator, mut updates) =
        InstructionSimulator::new(link.peripheral.clone(), log, config.simulator());
    simulator.start().await;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(SimulatorUpdate::Finished) | None => break,
                Some(SimulatorUpdate::InstructionFailed { index, error, .. }) => {
                    log::warn!("Instruction {} failed: {}", index, error);
                }
                Some(SimulatorUpdate::InstructionSent { .. }) => {}
            },
            update = link.central_updates.recv() => match update {
                Some(CentralUpdate::Navigation(message)) => println!("{}", message),
                Some(other) => log::debug!("Central: {:?}", other),
                None => bail!("Central stopped"),
            },
        }
    }

    while let Ok(Some(update)) =
        tokio::time::timeout(DRAIN_TIMEOUT, link.central_updates.recv()).await
    {
        if let CentralUpdate::Navigation(message) = update {
            println!("{}", message);
        }
    }

    simulator.stop().await;
    link.close().await;
    Ok(())
}

async fn send_test(count: usize, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut link = Link::establish(&config).await?;

    for _ in 0..count {
        let message = test_message();
        println!("sent:     {}", message);
        link.peripheral.send_message(message.clone()).await?;

        let received = link.next_message().await?;
        println!("received: {}", received);
        if received != message {
            bail!("Central decoded {} instead of {}", received, message);
        }
    }

    link.close().await;
    Ok(())
}
