//! Unauthenticated health-check endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::{AgentContext, ProxyContext};

/// `GET /api/health` on the agent: liveness probe with task occupancy.
pub async fn agent_health(State(ctx): State<AgentContext>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "role": "agent",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": ctx.start_time.elapsed().as_secs(),
        "tasks": ctx.registry.len().await,
        "max_tasks": ctx.registry.capacity(),
    }))
}

/// `GET /api/health` on the proxy.
pub async fn proxy_health(State(ctx): State<ProxyContext>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "role": "proxy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": ctx.start_time.elapsed().as_secs(),
        "targets": ctx.targets.len(),
    }))
}
