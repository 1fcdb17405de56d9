//! fleetd: the fleet management-server daemon.
//!
//! One binary that assembles the control plane:
//! - Entity store (redb)
//! - Heartbeat membership
//! - Ownership partitioner
//! - Host supervisor
//!
//! # Usage
//!
//! ```text
//! fleetd init-config --msid 1 --output fleet.toml
//! fleetd run --config fleet.toml --simulate
//! fleetd run --msid 1 --msid 2 --simulate   # two management servers, one store
//! fleetd status --data-dir /var/lib/fleet
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleet_core::FleetConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetd", about = "fleet control-plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one or more management servers against a shared store.
    Run {
        /// Path to fleet.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Management-server id to run. Repeat to run several in-process.
        #[arg(long = "msid")]
        msids: Vec<u64>,

        /// Data directory; overrides `server.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Use the in-process simulated agent driver and seed a demo inventory.
        #[arg(long)]
        simulate: bool,
    },

    /// Write a default fleet.toml.
    InitConfig {
        #[arg(long, default_value = "1")]
        msid: u64,

        #[arg(long, default_value = "/var/lib/fleet")]
        data_dir: PathBuf,

        #[arg(long, default_value = "fleet.toml")]
        output: PathBuf,
    },

    /// Print management servers, cluster ownership, hosts and VMs as JSON.
    Status {
        #[arg(long, default_value = "/var/lib/fleet")]
        data_dir: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            msids,
            data_dir,
            simulate,
        } => {
            let mut config = match config {
                Some(path) => FleetConfig::from_file(&path)?,
                None => FleetConfig::default(),
            };
            if let Some(dir) = data_dir {
                config.server.data_dir = dir;
            }
            config.validate()?;
            let msids = if msids.is_empty() {
                vec![config.server.msid]
            } else {
                msids
            };
            daemon::run(config, msids, simulate).await
        }
        Command::InitConfig {
            msid,
            data_dir,
            output,
        } => {
            let config = FleetConfig::scaffold(msid, &data_dir);
            std::fs::write(&output, config.to_toml_string()?)?;
            info!(path = %output.display(), msid, "config written");
            Ok(())
        }
        Command::Status { data_dir } => {
            let report = daemon::status(&data_dir)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
