//! HTTP server assembly and lifecycle

use crate::handlers;
use crate::registry::SessionRegistry;
use axum::routing::{delete, get, post};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws/:session_id", get(handlers::ws::handler))
        .route("/api/sessions", get(handlers::sessions::list))
        .route("/api/sessions/:id", delete(handlers::sessions::delete))
        .route(
            "/api/sessions/:id/replace",
            post(handlers::sessions::replace),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then tear down every session.
///
/// Upgraded WebSockets are not tracked by axum's graceful shutdown, so the
/// sessions are closed as part of the shutdown future. That sends every viewer
/// a close frame and kills every process before the listener stops.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let reaper = registry.spawn_reaper();
    let app = build_router(AppState {
        registry: registry.clone(),
    });

    let teardown = registry.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutdown requested");
            teardown.shutdown_all().await;
        })
        .await;

    reaper.abort();
    result
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
