//! Per-role context objects passed to every handler via Axum's `State` extractor.
//!
//! One context is built at startup for the role being served; nothing is held
//! in globals.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::config::{AgentConfig, ProxyConfig};
use crate::forward::Targets;
use crate::limiter::UnitLimiter;
use crate::tasks::TaskRegistry;

/// HTTP client used for the plain forwarding path. Speaks `http` and `https`.
pub type ForwardClient = Client<HttpsConnector<HttpConnector>, Body>;

fn forward_client() -> ForwardClient {
    let connector = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Shared state for the agent role.
#[derive(Clone)]
pub struct AgentContext {
    /// Immutable configuration loaded at startup.
    pub config: Arc<AgentConfig>,
    /// Outstanding tasks, bounded by `tasks.capacity`.
    pub registry: TaskRegistry,
    /// Admission for readers and script units.
    pub limiter: UnitLimiter,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Self {
        let registry = TaskRegistry::new(config.tasks.capacity);
        let limiter = UnitLimiter::new(config.unit_limit());
        Self {
            config: Arc::new(config),
            registry,
            limiter,
            start_time: Instant::now(),
        }
    }
}

/// Shared state for the proxy role.
#[derive(Clone)]
pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    /// Named backends, read-only at runtime.
    pub targets: Arc<Targets>,
    pub client: ForwardClient,
    /// Admission for relay loops.
    pub limiter: UnitLimiter,
    pub start_time: Instant,
}

impl ProxyContext {
    pub fn new(config: ProxyConfig) -> Self {
        let targets = Targets::from_config(&config.targets);
        let client = forward_client();
        let limiter = UnitLimiter::new(config.unit_limit());
        Self {
            config: Arc::new(config),
            targets: Arc::new(targets),
            client,
            limiter,
            start_time: Instant::now(),
        }
    }
}
