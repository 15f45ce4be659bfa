//! Proxy landing page and target listing.

use axum::{extract::State, response::Html, Json};
use serde_json::{json, Value};

use crate::state::ProxyContext;

const INDEX_HTML: &str = include_str!("../../web/index.html");

/// `GET /`: static operator console.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// `GET /api/targets`: configured target names, in configuration order.
pub async fn list(State(ctx): State<ProxyContext>) -> Json<Value> {
    Json(json!({ "targets": ctx.targets.names() }))
}
