use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use relay_store::{PersistentStore, StoreError};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatcher::Dispatcher;
use crate::engine::{Command, Engine};
use crate::registry::{BroadcastPolicy, ConnectionRegistry};
use crate::session;
use crate::state::StateStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    /// Depth of the engine's command queue.
    pub command_queue: usize,
    pub policy: BroadcastPolicy,
    pub admin_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10_000,
            max_send_queue: 256,
            command_queue: 1024,
            policy: BroadcastPolicy::EchoToSender,
            admin_secret: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to load stored state: {0}")]
    Load(#[from] StoreError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<Mutex<StateStore>>,
    pub registry: Arc<ConnectionRegistry>,
    pub commands: mpsc::Sender<Command>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Load stored state, start the engine and bind the listener. Nothing is
/// served if the stored state cannot be read, so a bad file is never
/// overwritten by an empty commit.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn PersistentStore>,
) -> Result<ServerHandle, ServerError> {
    let loaded = store.load_all()?;
    tracing::info!(
        store = store.name(),
        comments = loaded.comments.len(),
        items = loaded.items.len(),
        "state loaded"
    );
    let state = Arc::new(Mutex::new(StateStore::from_snapshot(loaded)));
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));

    let engine = Engine::new(
        Arc::clone(&state),
        Dispatcher::new(config.admin_secret.clone()),
        Arc::clone(&registry),
        store,
        config.policy,
    );
    let (commands, engine_handle) = engine.spawn(config.command_queue);

    let router = build_router(AppState {
        state,
        registry,
        commands,
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(source) => {
            engine_handle.abort();
            return Err(ServerError::Bind { addr, source });
        }
    };
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::Bind { addr, source })?;

    tracing::info!(addr = %local_addr, "relay server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        shutdown_tx: Some(shutdown_tx),
        server,
        engine: engine_handle,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive until
/// `shutdown` or drop.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
    engine: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections, wait for the listener to wind down, then
    /// stop the engine.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.server)
            .await
            .is_err()
        {
            tracing::warn!("graceful shutdown timed out, aborting listener");
            self.server.abort();
        }
        self.engine.abort();
        tracing::info!("relay server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.server.abort();
        self.engine.abort();
    }
}

async fn root_handler() -> &'static str {
    "Server is live!"
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::handle_socket(socket, state.registry, state.commands))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
    comments: usize,
    items: usize,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (comments, items) = state.state.lock().counts();
    Json(Health {
        status: "ok",
        connections: state.registry.count(),
        comments,
        items,
    })
}
