//! Access control: shared security key, IP whitelist and daily access window.
//!
//! The checks are pure predicates ([`authorize_key`], [`authorize_ip`],
//! [`authorize_time_window`]); the axum middleware functions below translate a
//! `false` into a short plain-text rejection. Each middleware is generic over
//! the capability trait it needs, so the agent and the proxy pass their own
//! configuration type.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Timelike;
use tracing::{debug, warn};

use crate::config::{AccessWindow, AgentConfig, ProxyConfig, SECURITY_KEY_HEADER};

/// Provides the expected shared secret.
pub trait KeyPolicy: Send + Sync + 'static {
    fn security_key(&self) -> &str;
}

/// Provides the IP whitelist entries (literal IPs or CIDR ranges).
pub trait WhitelistPolicy: Send + Sync + 'static {
    fn whitelist(&self) -> &[String];
}

/// Provides the optional daily access window.
pub trait AccessWindowPolicy: Send + Sync + 'static {
    fn access_window(&self) -> Option<AccessWindow>;
}

impl KeyPolicy for AgentConfig {
    fn security_key(&self) -> &str {
        &self.auth.security_key
    }
}

impl WhitelistPolicy for AgentConfig {
    fn whitelist(&self) -> &[String] {
        &self.auth.whitelist
    }
}

impl AccessWindowPolicy for AgentConfig {
    fn access_window(&self) -> Option<AccessWindow> {
        self.auth.access_window
    }
}

impl KeyPolicy for ProxyConfig {
    fn security_key(&self) -> &str {
        &self.auth.security_key
    }
}

impl WhitelistPolicy for ProxyConfig {
    fn whitelist(&self) -> &[String] {
        &self.auth.whitelist
    }
}

impl AccessWindowPolicy for ProxyConfig {
    fn access_window(&self) -> Option<AccessWindow> {
        self.auth.access_window
    }
}

/// Exact key match, compared in constant time.
pub fn authorize_key(provided: &str, expected: &str) -> bool {
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// `true` if `ip` matches any whitelist entry. Malformed entries are skipped.
pub fn authorize_ip(ip: IpAddr, whitelist: &[String]) -> bool {
    for raw in whitelist {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        if entry.contains('/') {
            match Cidr::parse(entry) {
                Some(cidr) => {
                    if cidr.contains(ip) {
                        debug!(%ip, entry, "whitelist hit (cidr)");
                        return true;
                    }
                }
                None => warn!(entry, "skipping malformed CIDR whitelist entry"),
            }
            continue;
        }
        match entry.parse::<IpAddr>() {
            Ok(allowed) if same_ip(allowed, ip) => {
                debug!(%ip, entry, "whitelist hit (ip)");
                return true;
            }
            Ok(_) => {}
            Err(_) => warn!(entry, "skipping malformed IP whitelist entry"),
        }
    }
    false
}

/// `start <= elapsed < end`, all measured from local midnight.
pub fn authorize_time_window(elapsed: Duration, start: Duration, end: Duration) -> bool {
    start <= elapsed && elapsed < end
}

/// Time elapsed since local midnight, used for window checks.
pub fn elapsed_since_local_midnight() -> Duration {
    let now = chrono::Local::now().time();
    Duration::from_secs(u64::from(now.num_seconds_from_midnight()))
        + Duration::from_nanos(u64::from(now.nanosecond() % 1_000_000_000))
}

/// Client IP with precedence `X-Forwarded-For` (first non-empty entry) →
/// `X-Real-IP` → transport peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|v| !v.is_empty());
    if let Some(candidate) = forwarded {
        return parse_host(candidate);
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(candidate) = real_ip {
        return parse_host(candidate);
    }

    peer.map(|addr| addr.ip())
}

/// Accepts a bare IP, `ip:port`, or `[v6]:port`.
fn parse_host(value: &str) -> Option<IpAddr> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    value.parse::<SocketAddr>().ok().map(|addr| addr.ip())
}

/// Compare two addresses, treating IPv4-mapped IPv6 as its IPv4 form.
fn same_ip(a: IpAddr, b: IpAddr) -> bool {
    canonical(a) == canonical(b)
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// A parsed CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parse `addr/prefix`. Returns `None` for anything malformed.
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let network: IpAddr = addr.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return None;
        }
        Some(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, canonical(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

// ─── Middleware ──────────────────────────────────────────────────────────────

/// Rejects requests whose `X-Security-Key` header does not match.
///
/// - `401 Unauthorized`: header missing or wrong
pub async fn require_security_key<P: KeyPolicy>(
    State(policy): State<Arc<P>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(SECURITY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !authorize_key(provided, policy.security_key()) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(request).await
}

/// Rejects requests whose client IP is not whitelisted.
///
/// - `403 Forbidden`: IP not resolvable or not whitelisted
pub async fn require_whitelisted_ip<P: WhitelistPolicy>(
    State(policy): State<Arc<P>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let allowed = match client_ip(request.headers(), peer) {
        Some(ip) => {
            debug!(%ip, "incoming request");
            authorize_ip(ip, policy.whitelist())
        }
        None => false,
    };
    if !allowed {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    next.run(request).await
}

/// Rejects requests outside the configured daily window (no-op when unset).
///
/// - `403 Forbidden`: outside the window
pub async fn require_access_window<P: AccessWindowPolicy>(
    State(policy): State<Arc<P>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(window) = policy.access_window() {
        if !window.contains(elapsed_since_local_midnight()) {
            return (StatusCode::FORBIDDEN, "Service unavailable at this time").into_response();
        }
    }
    next.run(request).await
}
