//! # hubwire-chat
//!
//! Chat hub server binary: loads settings, installs logging and metrics,
//! and serves the chat hub over WebSocket until ctrl-c.

#![deny(unsafe_code)]

mod chat;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hubwire_server::{HubConnectionHandler, HubServer, SingletonActivator};
use hubwire_settings::HubSettings;

use crate::chat::Chat;

/// Time allowed for connections to close on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Chat hub server.
#[derive(Parser, Debug)]
#[command(name = "hubwire-chat", about = "Chat hub server")]
struct Cli {
    /// Settings file (defaults to `$HUBWIRE_SETTINGS` or `./hubwire.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Include exception detail in client-facing errors.
    #[arg(long)]
    detailed_errors: bool,
}

impl Cli {
    fn apply(&self, settings: &mut HubSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.detailed_errors {
            settings.hub.enable_detailed_errors = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings.clone().unwrap_or_else(hubwire_settings::settings_path);
    let mut settings = hubwire_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);

    hubwire_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = hubwire_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let methods = chat::methods().context("Failed to register chat methods")?;
    let method_count = methods.len();
    let builder = HubConnectionHandler::builder(methods, SingletonActivator::new(Chat::default()));
    let server = HubServer::new(settings, builder)
        .context("Failed to build hub server")?
        .with_metrics(metrics);

    let handle = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "hubwire chat listening on ws://{}{} ({method_count} hub methods registered)",
        handle.addr,
        server.settings().server.path
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown(handle, Some(SHUTDOWN_TIMEOUT)).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
