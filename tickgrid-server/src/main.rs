//! tickgrid-server
//!
//! Runs one tier of the replicated bitfield: the master that owns the
//! cells, or a relay that mirrors a master and fans its edits out to more
//! clients.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tickgrid_sync::server::{Role, ServerConfig, SyncServer};
use tickgrid_sync::storage::PersistenceConfig;
use tickgrid_sync::store::DEFAULT_CELLS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Master,
    Relay,
}

#[derive(Parser, Debug)]
#[command(name = "tickgrid-server")]
#[command(about = "Replicated bitfield over WebSocket", long_about = None)]
struct Cli {
    /// Which tier to run
    #[arg(long, value_enum, default_value = "master")]
    mode: Mode,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    listen: String,

    /// Master WebSocket URL (relay mode)
    #[arg(long, default_value = "ws://localhost:8080/ws")]
    master_url: String,

    /// Snapshot file (master mode)
    #[arg(long, default_value = "tickgrid_state.bin")]
    state_file: PathBuf,

    /// Seconds between snapshot saves; 0 disables persistence (master mode)
    #[arg(long, default_value_t = 300)]
    persist_every_secs: u64,

    /// Number of cells
    #[arg(long, default_value_t = DEFAULT_CELLS)]
    cells: usize,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let role = match self.mode {
            Mode::Master => Role::Master,
            Mode::Relay => Role::Relay {
                upstream_url: self.master_url,
            },
        };

        let persistence = (role == Role::Master && self.persist_every_secs > 0).then(|| {
            PersistenceConfig {
                path: self.state_file,
                interval: Duration::from_secs(self.persist_every_secs),
            }
        });

        ServerConfig {
            bind_addr: format!("{}:{}", self.listen, self.port),
            role,
            cells: self.cells,
            persistence,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    config.validate()?;
    info!(
        "Starting tickgrid {} on {}...",
        config.role.name(),
        config.bind_addr
    );

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => result.context("server stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Ctrl-C received");
        }
    }

    server.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_build_persistent_master() {
        let config = Cli::parse_from(["tickgrid-server"]).into_config();
        assert_eq!(config.role, Role::Master);
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.cells, DEFAULT_CELLS);

        let persistence = config.persistence.unwrap();
        assert_eq!(persistence.path, PathBuf::from("tickgrid_state.bin"));
        assert_eq!(persistence.interval, Duration::from_secs(300));
    }

    #[test]
    fn test_relay_flags() {
        let config = Cli::parse_from([
            "tickgrid-server",
            "--mode",
            "relay",
            "--port",
            "9000",
            "--master-url",
            "ws://10.0.0.1:8080/ws",
        ])
        .into_config();

        assert_eq!(
            config.role,
            Role::Relay {
                upstream_url: "ws://10.0.0.1:8080/ws".to_string()
            }
        );
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert!(config.persistence.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_persistence_can_be_disabled() {
        let config =
            Cli::parse_from(["tickgrid-server", "--persist-every-secs", "0"]).into_config();
        assert!(config.persistence.is_none());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Cli::try_parse_from(["tickgrid-server", "--mode", "replica"]).is_err());
    }
}
