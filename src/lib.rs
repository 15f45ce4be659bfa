#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! cmder library: the agent and proxy roles as composable routers.
//!
//! - `tasks`: task registry, per-task state machine and replay buffer
//! - `ws`: task observer and script session WebSocket endpoints
//! - `forward`: target resolution, plain forwarding and WebSocket relay
//! - `auth`: security key, IP whitelist and access window middleware
//! - `config`: TOML/YAML configuration loading and validation
//! - `limiter`: admission control for background units
//! - `shell`: process spawning and line reading
//!
//! [`agent_router`] and [`proxy_router`] build the complete HTTP surface of
//! each role from its context.

pub mod auth;
pub mod config;
pub mod error;
pub mod forward;
pub mod limiter;
pub mod routes;
pub mod shell;
pub mod state;
pub mod tasks;
pub mod ws;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub use config::{AgentConfig, ConfigError, ProxyConfig};
pub use error::ApiError;
pub use state::{AgentContext, ProxyContext};

/// Agent routes.
///
/// | Method | Path               | Auth | Description                      |
/// |--------|--------------------|------|----------------------------------|
/// | GET    | `/api/health`      | No   | Liveness probe                   |
/// | POST   | `/api/cmd`         | Yes  | Submit a command as a task       |
/// | GET    | `/api/cmd/output`  | Yes  | WebSocket: observe a task        |
/// | GET    | `/api/cmd/ids`     | Yes  | List outstanding task ids        |
/// | GET    | `/api/cmd/script`  | Yes  | WebSocket: run a streamed script |
///
/// Auth is, outermost first: IP whitelist (403), access window (403),
/// `X-Security-Key` (401).
pub fn agent_router(ctx: AgentContext) -> Router {
    let policy = Arc::clone(&ctx.config);
    let read_timeout = ctx.config.server.read_timeout();

    let cmd_routes = Router::new()
        .route("/api/cmd", post(routes::cmd::submit))
        .route("/api/cmd/ids", get(routes::cmd::ids))
        .route("/api/cmd/output", get(ws::output::output_ws))
        .route("/api/cmd/script", get(ws::script::script_ws))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&policy),
            auth::require_security_key::<AgentConfig>,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&policy),
            auth::require_access_window::<AgentConfig>,
        ))
        .layer(middleware::from_fn_with_state(
            policy,
            auth::require_whitelisted_ip::<AgentConfig>,
        ));

    Router::new()
        .route("/api/health", get(routes::health::agent_health))
        .merge(cmd_routes)
        .layer(TimeoutLayer::new(read_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Proxy routes.
///
/// | Method | Path                   | Auth         | Description                 |
/// |--------|------------------------|--------------|-----------------------------|
/// | GET    | `/api/health`          | No           | Liveness probe              |
/// | GET    | `/`                    | IP           | Operator console            |
/// | GET    | `/api/targets`         | IP           | Configured target names     |
/// | any    | `/api/cmd[/...]?name=` | IP + window  | Forwarded to the target     |
///
/// The proxy does not check `X-Security-Key` itself; it injects its own key
/// into every forwarded request.
pub fn proxy_router(ctx: ProxyContext) -> Router {
    let policy = Arc::clone(&ctx.config);
    let read_timeout = ctx.config.server.read_timeout();

    let forwarded = Router::new()
        .route("/api/cmd", any(forward::forward))
        .route("/api/cmd/{*rest}", any(forward::forward))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&policy),
            auth::require_access_window::<ProxyConfig>,
        ));

    Router::new()
        .route("/", get(routes::targets::index))
        .route("/api/targets", get(routes::targets::list))
        .merge(forwarded)
        .layer(middleware::from_fn_with_state(
            policy,
            auth::require_whitelisted_ip::<ProxyConfig>,
        ))
        .route("/api/health", get(routes::health::proxy_health))
        .layer(TimeoutLayer::new(read_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
