//! Beach Pier: a rendezvous relay that lets WebRTC peers find each other by
//! name and exchange offers, answers and ICE candidates over one WebSocket.

pub mod cli;
pub mod config;
pub mod envelope;
mod handlers;
pub mod lifecycle;
pub mod peer;
pub mod registry;
pub mod router;
pub mod telemetry;

use std::{future::Future, net::SocketAddr};

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use config::RelayConfig;
pub use lifecycle::RelayState;
pub use registry::PeerRegistry;

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(lifecycle::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
