//! # pylon
//!
//! Pylon frontend binary: loads settings, starts logging and serves client
//! connections until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pylon_server::handler::EchoHandler;
use pylon_server::logging::init_subscriber;
use pylon_server::settings::{ServerSettings, load_settings};
use pylon_server::{PylonServer, ShutdownCoordinator};

/// Pylon frontend server.
#[derive(Parser, Debug)]
#[command(name = "pylon", about = "Pylon frontend server")]
struct Cli {
    /// JSON settings file, merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn settings(&self) -> Result<ServerSettings> {
        let mut settings = load_settings(self.config.as_deref()).context("Failed to load settings")?;
        if let Some(host) = &self.host {
            settings.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings()?;
    init_subscriber(&settings.log_level, settings.log_json);

    let shutdown = ShutdownCoordinator::new();
    let server = PylonServer::bind(&settings, Arc::new(EchoHandler), shutdown.clone())
        .await
        .context("Failed to start server")?;
    tracing::info!(addr = %server.local_addr()?, "pylon started");
    let handle = tokio::spawn(server.serve());

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    shutdown.shutdown();
    handle
        .await
        .context("Server task panicked")?
        .context("Server failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_settings() {
        let cli = Cli::try_parse_from(["pylon"]).unwrap();
        assert!(cli.config.is_none());
        let settings = cli.settings().unwrap();
        assert_eq!(settings.port, ServerSettings::default().port);
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::try_parse_from(["pylon", "--host", "127.0.0.1", "--port", "0"]).unwrap();
        let settings = cli.settings().unwrap();
        assert_eq!(settings.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn cli_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pylon.json");
        std::fs::write(&path, r#"{"writeBacklog": 64, "routes": {"room.join": 1}}"#).unwrap();

        let cli = Cli::try_parse_from(["pylon", "--config", path.to_str().unwrap()]).unwrap();
        let settings = cli.settings().unwrap();
        assert_eq!(settings.write_backlog, 64);
        assert_eq!(settings.routes.get("room.join"), Some(&1));
    }

    #[test]
    fn cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["pylon", "--port", "70000"]).is_err());
    }
}
