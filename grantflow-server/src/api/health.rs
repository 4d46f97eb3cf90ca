use axum::{routing::get, Router};

use crate::ApiContextRef;

pub fn router() -> Router<ApiContextRef> {
    Router::new().route("/", get(health_check))
}

async fn health_check() -> &'static str {
    "OK"
}
