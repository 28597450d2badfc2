use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::Notify;

use tunnelbox_rs::config::Config;
use tunnelbox_rs::daemon::{run_daemon_with_shutdown, DaemonOptions};
use tunnelbox_rs::registry::{JsonFileStore, RegistryStore};
use tunnelbox_rs::transport_tcp::TcpFactory;

#[derive(Parser, Debug)]
#[command(name = "tunnelbox", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel daemon with the built-in plain TCP transport
    Daemon,
    /// Validate the configuration file and exit
    Check,
    /// List tunnels registered by all sibling processes
    Active,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    match cli.command {
        Commands::Daemon => {
            let shutdown = Arc::new(Notify::new());
            let sd = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    sd.notify_waiters();
                }
            });
            run_daemon_with_shutdown(
                cfg,
                Arc::new(TcpFactory),
                DaemonOptions::default(),
                shutdown,
            )
            .await?;
        }
        Commands::Check => {
            println!(
                "ok: {} servers, {} profiles, registry {}",
                cfg.servers.len(),
                cfg.profiles.len(),
                cfg.registry_path.display()
            );
        }
        Commands::Active => {
            let store = JsonFileStore::new(cfg.registry_path.clone());
            let entries = store.get_entries().await?;
            if entries.is_empty() {
                println!("no registered tunnels");
            }
            for entry in entries {
                println!(
                    "{}\t{}\t{}\tlocal:{}\tremote:{}:{}\tsession:{}",
                    entry.profile_id,
                    entry.topology,
                    entry.connection_mode,
                    entry.local_port,
                    entry.remote_host,
                    entry.remote_port,
                    entry.session_id
                );
            }
        }
    }

    Ok(())
}
