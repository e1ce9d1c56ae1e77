//! Command-line entry point for the HiveLink bridge daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use hivelink_bridge::BridgeService;
use hivelink_bus::{BusClient, BusClientConfig};
use hivelink_core::BridgeConfig;
use hivelink_storage::{Ledger, NewDevice, NewRelease};

/// HiveLink - device command & OTA orchestration bridge.
#[derive(Parser, Debug)]
#[command(name = "hivelinkd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Path to the ledger database file.
    #[arg(long, global = true, env = "HIVELINK_DATA", default_value = "data/hivelink.redb")]
    data: PathBuf,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until interrupted.
    Run {
        /// MQTT broker host.
        #[arg(long, env = "HIVELINK_BROKER", default_value = "localhost")]
        broker: String,
        /// MQTT broker port.
        #[arg(short, long, env = "HIVELINK_BROKER_PORT", default_value_t = 1883)]
        port: u16,
        /// MQTT username.
        #[arg(long, env = "HIVELINK_BROKER_USER")]
        username: Option<String>,
        /// MQTT password.
        #[arg(long, env = "HIVELINK_BROKER_PASSWORD")]
        password: Option<String>,
        /// MQTT client id.
        #[arg(long, env = "HIVELINK_CLIENT_ID")]
        client_id: Option<String>,
    },
    /// Register a device in the directory.
    AddDevice {
        /// Display name.
        name: String,
        /// Shared device key.
        #[arg(long)]
        key: String,
    },
    /// Publish a firmware release.
    AddRelease {
        /// Version string, e.g. "1.4.2".
        version: String,
        /// Hex-encoded checksum of the binary.
        #[arg(long)]
        checksum: String,
        /// Binary size in bytes.
        #[arg(long)]
        size: u64,
        /// Download URL the device fetches from.
        #[arg(long)]
        url: String,
    },
    /// List registered devices.
    ListDevices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "hivelink=debug"
    } else {
        "hivelink=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();

    let ledger = Ledger::open(&args.data)?;

    match args.command {
        Command::Run {
            broker,
            port,
            username,
            password,
            client_id,
        } => run_bridge(ledger, broker, port, username, password, client_id).await,
        Command::AddDevice { name, key } => {
            let device = ledger.devices().create(NewDevice {
                name,
                device_key: key,
            })?;
            println!("device {} registered ({})", device.id, device.name);
            Ok(())
        }
        Command::AddRelease {
            version,
            checksum,
            size,
            url,
        } => {
            let release = ledger.firmware().create(NewRelease {
                version,
                checksum,
                size_bytes: size,
                download_url: url,
            })?;
            println!("release {} published ({})", release.id, release.version);
            Ok(())
        }
        Command::ListDevices => {
            for device in ledger.devices().list()? {
                let liveness = if device.online { "online" } else { "offline" };
                let seen = device
                    .last_seen
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}\t{}\t{}\tlast seen {}{}",
                    device.id,
                    device.name,
                    liveness,
                    seen,
                    if device.deleted { "\t(deleted)" } else { "" },
                );
            }
            Ok(())
        }
    }
}

/// Connect to the broker and run the bridge until ctrl-c.
async fn run_bridge(
    ledger: Ledger,
    broker: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
) -> Result<()> {
    let config = BridgeConfig::from_env();

    let mut bus_config = BusClientConfig::new(broker).with_port(port);
    if let (Some(user), Some(pass)) = (username, password) {
        bus_config = bus_config.with_auth(user, pass);
    }
    if let Some(id) = client_id {
        bus_config = bus_config.with_client_id(id);
    }

    let (client, inbound) = BusClient::connect(bus_config);
    let service = BridgeService::new(config, ledger, Arc::new(client.clone()));
    let runtime = service.start(&client, inbound).await?;
    tracing::info!("bridge running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    runtime.shutdown().await;
    let _ = client.disconnect().await;
    Ok(())
}
