//! `merlin` command-line tool.
//!
//! ```bash
//! merlin get NUMFRAMESPERTRIGGER
//! merlin set OPERATINGENERGY 8.5
//! merlin cmd SOFTTRIGGER
//! merlin status
//! merlin acquire --frames 100 --file /data/scan_0001.h5
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use merlin_daq::client::ControlClient;
use merlin_daq::config::{MerlinConfig, DEFAULT_CONFIG_PATH};
use merlin_daq::logging;
use merlin_daq::messages::{job_channel, WorkerEndpoint};
use merlin_daq::property::Property;
use merlin_daq::session::MerlinSession;
use merlin_daq::storage::Hdf5Backend;
use tokio::net::TcpStream;
use tracing::info;

#[derive(Parser)]
#[command(name = "merlin")]
#[command(about = "Control and acquire from a Merlin pixel detector", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the detector host from the configuration
    #[arg(long, global = true)]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a detector property
    Get { name: String },

    /// Write a detector property
    Set { name: String, value: String },

    /// Execute a detector command and print its status code
    Cmd { name: String },

    /// Print every catalogued property
    Status,

    /// Arm, start and wait for an acquisition
    Acquire {
        /// Frames to acquire
        #[arg(long)]
        frames: u64,

        /// HDF5 output file; frames are only counted when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        /// Skip arming (detector already armed)
        #[arg(long)]
        no_arm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MerlinConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        config.detector.host = host;
    }
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Acquire {
            frames,
            file,
            no_arm,
        } => acquire(&config, frames, file, no_arm).await,
        Commands::Get { name } => {
            let (client, _worker) = control_client(&config).await?;
            println!("{}", client.get(&name).await?);
            Ok(())
        }
        Commands::Set { name, value } => {
            let (client, _worker) = control_client(&config).await?;
            client.set(&name, &value).await?;
            println!("{} = {}", name, value);
            Ok(())
        }
        Commands::Cmd { name } => {
            let (client, _worker) = control_client(&config).await?;
            println!("{}", client.cmd(&name).await?.code());
            Ok(())
        }
        Commands::Status => {
            let (client, _worker) = control_client(&config).await?;
            for property in Property::ALL {
                match client.read_property(property).await {
                    Ok(value) => println!("{:<20} {}", property, value),
                    Err(error) => println!("{:<20} <{}>", property, error),
                }
            }
            Ok(())
        }
    }
}

/// Control channel only; the returned endpoint keeps the idle job channel open.
async fn control_client(config: &MerlinConfig) -> Result<(ControlClient<TcpStream>, WorkerEndpoint)> {
    let (control, worker) = job_channel(1);
    let client = ControlClient::connect(config, control)
        .await
        .context("connecting to detector")?;
    Ok((client, worker))
}

async fn acquire(config: &MerlinConfig, frames: u64, file: Option<PathBuf>, no_arm: bool) -> Result<()> {
    let backend = Arc::new(Hdf5Backend::new(&config.storage));
    let session = MerlinSession::connect(config, backend)
        .await
        .context("connecting to detector")?;
    let client = session.client();

    client.set_filename(file);
    if !no_arm {
        client.arm().await.context("arming detector")?;
    }
    let report = client.start(frames).await.context("acquiring")?;

    match report {
        Some(report) => {
            info!(?report, "Acquisition finished");
            println!(
                "acquired {}/{} frames ({:?})",
                report.acquired, report.requested, report.outcome
            );
        }
        None => println!("worker exited without reporting"),
    }

    let stats = session.stats();
    if stats.frames_lost() > 0 || stats.bytes_resynced > 0 {
        println!(
            "dropped {} frames, discarded {} bytes while resynchronizing",
            stats.frames_lost(),
            stats.bytes_resynced
        );
    }
    session.shutdown().await?;
    Ok(())
}
