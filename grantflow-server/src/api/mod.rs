use axum::Router;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use crate::ApiContextRef;

mod health;
mod routes;
mod ws;

pub fn router(context: ApiContextRef) -> Router {
    let api_routes = routes::router().nest("/health", health::router());

    Router::new()
        .nest("/api", api_routes)
        .nest("/ws", ws::router())
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::ERROR)))
        .with_state(context)
}
