//! Server module
//!
//! Wires the history store, connection hub and poll coordinator together and
//! serves the HTTP and WebSocket routes.

pub mod connect_info;
pub mod http;
pub mod metrics;
pub mod ws;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::history::{self, HistoryWriter};
use crate::polls::PollCoordinator;
use ws::{ConnectionHub, WsServerState};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Open the history store, build the coordinator and recover archived polls.
///
/// A store that cannot be opened is logged and skipped; polling still works
/// in memory.
pub async fn build_state(config: &Config) -> Arc<WsServerState> {
    let store = match history::open_store(&config.history).await {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(
                backend = ?config.history.backend,
                error = %e,
                "history store unavailable, continuing without archival"
            );
            None
        }
    };
    let backend = store.as_ref().map(|s| s.backend());
    let writer = store
        .clone()
        .map(HistoryWriter::spawn)
        .unwrap_or_else(HistoryWriter::disabled);

    let hub = Arc::new(ConnectionHub::new(config.server.connection_queue_size));
    let coordinator = PollCoordinator::new(config.polls.clone(), hub.clone(), writer.clone());

    if let Some(store) = &store {
        if let Err(e) = coordinator.recover(store.as_ref()).await {
            tracing::warn!(error = %e, "failed to recover poll history");
        }
    }

    Arc::new(WsServerState::new(coordinator, hub, writer, backend))
}

/// Serve on `listener` until `shutdown` resolves, then flush pending history
/// writes.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<WsServerState>,
    cors_origins: &[String],
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = http::build_router(state.clone(), cors_origins);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(ServerError::Serve)?;

    state.history.flush().await;
    tracing::info!("server stopped");
    Ok(())
}

/// Run the server until Ctrl-C.
pub async fn run(config: Config) -> Result<(), ServerError> {
    let state = build_state(&config).await;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local = listener.local_addr().map_err(ServerError::Serve)?;
    tracing::info!(
        addr = %local,
        history = state.history_backend.unwrap_or("none"),
        cors_origins = ?config.server.cors_origins,
        "pollroom listening"
    );

    serve(listener, state, &config.server.cors_origins, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
