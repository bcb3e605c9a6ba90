//! Liveness server.
//!
//! Nothing here touches RabbitMQ, Redis or Postgres; the server only reports
//! that the process is up.

pub mod handlers;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use handlers::{alive, health, HealthResponse};

/// Routes served by `notifier-web`.
pub fn router() -> Router {
    Router::new()
        .route("/", get(alive))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
}
