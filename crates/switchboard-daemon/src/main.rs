//! # switchboard
//!
//! Gateway binary: loads settings, wires the session store into the
//! WebSocket server and runs until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use switchboard_core::logging::{LogFormat, init_subscriber};
use switchboard_server::auth::{MemorySessionStore, SessionStore, SqliteSessionStore};
use switchboard_server::metrics::install_recorder;
use switchboard_server::{ServerConfig, SwitchboardServer};
use switchboard_settings::{SessionStoreKind, SwitchboardSettings};

/// Switchboard WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Real-time WebSocket fan-out gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file (default `~/.switchboard/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Runtime server config: settings first, then CLI flags.
    fn server_config(&self, settings: &SwitchboardSettings) -> ServerConfig {
        let mut config = ServerConfig::from(settings);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

fn session_store(settings: &SwitchboardSettings) -> Result<Arc<dyn SessionStore>> {
    match settings.session.store {
        SessionStoreKind::Memory => {
            tracing::warn!("session.store is \"memory\"; upgrades authenticate only against sessions inserted in-process");
            Ok(Arc::new(MemorySessionStore::new()))
        }
        SessionStoreKind::Sqlite => {
            let path = settings.session.sqlite_path_or_default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
            let store = SqliteSessionStore::open(&path)
                .with_context(|| format!("Failed to open session database: {}", path.display()))?;
            tracing::info!(path = %path.display(), "using sqlite session store");
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(switchboard_settings::settings_path);
    let settings = switchboard_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    let level = args.log_level.as_deref().unwrap_or(&settings.logging.level);
    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(level, format);

    let metrics = install_recorder().context("Failed to install metrics recorder")?;
    let store = session_store(&settings)?;
    let config = args.server_config(&settings);

    let server = SwitchboardServer::new(config, store, Some(metrics));
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Switchboard listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
