use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use relay_server::{BroadcastPolicy, ServerConfig};
use relay_settings::{ServerSettings, StoreBackend, StoreSettings};
use relay_store::{JsonFileStore, MemoryStore, PersistentStore, SqliteStore};
use relay_telemetry::TelemetryConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = relay_settings::load_settings().context("failed to load settings")?;

    let telemetry = TelemetryConfig::from_names(&settings.logging.level, settings.logging.format)
        .with_module_levels(
            settings
                .logging
                .modules
                .iter()
                .map(|(module, level)| (module.as_str(), level.as_str())),
        );
    relay_telemetry::init_telemetry(&telemetry);
    tracing::info!("starting relay");

    let store = open_store(&settings.store)?;
    let handle = relay_server::start(server_config(&settings.server), store)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port(), "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn open_store(settings: &StoreSettings) -> anyhow::Result<Arc<dyn PersistentStore>> {
    let path = Path::new(&settings.path);
    let store: Arc<dyn PersistentStore> = match settings.backend {
        StoreBackend::Json => Arc::new(
            JsonFileStore::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        StoreBackend::Sqlite => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        StoreBackend::Memory => {
            tracing::warn!("memory store selected, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

fn server_config(settings: &ServerSettings) -> ServerConfig {
    ServerConfig {
        host: settings.host.clone(),
        port: settings.port,
        max_send_queue: settings.max_send_queue,
        policy: BroadcastPolicy::from_echo(settings.echo_to_sender),
        admin_secret: settings.admin_secret.clone(),
        ..ServerConfig::default()
    }
}
