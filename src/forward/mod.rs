//! Proxy forwarding: resolve a named target and relay the request to it.
//!
//! `?name=<target>` selects the backend. The inbound path and query are
//! appended to the target's base address and the shared security key is
//! injected into the outbound request.
//!
//! - **Plain requests** go through the hyper client in [`ProxyContext`] with
//!   bodies streamed in both directions. `https` targets are reached over
//!   rustls with the webpki root set.
//! - **WebSocket upgrades** dial the backend first with `tokio-tungstenite`
//!   and only upgrade the client once the backend accepted, then hand both
//!   sockets to [`relay::relay`].

pub mod relay;

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{FromRequestParts, Query, Request, State, WebSocketUpgrade},
    http::{
        header::{CONNECTION, SEC_WEBSOCKET_PROTOCOL, UPGRADE},
        HeaderMap, HeaderName, HeaderValue, Uri,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{info, warn};

use crate::config::{TargetConfig, SECURITY_KEY_HEADER};
use crate::error::ApiError;
use crate::state::ProxyContext;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("missing target name")]
    MissingTargetName,
    #[error("unknown target {0:?}")]
    UnknownTarget(String),
    #[error("invalid target address: {0}")]
    InvalidTarget(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("backend handshake failed: {0}")]
    Handshake(String),
}

/// Named backends in configuration order.
#[derive(Debug, Default)]
pub struct Targets {
    names: Vec<String>,
    addresses: HashMap<String, String>,
}

impl Targets {
    pub fn from_config(targets: &[TargetConfig]) -> Self {
        let mut resolved = Self::default();
        for t in targets {
            if resolved
                .addresses
                .insert(t.name.clone(), t.address.clone())
                .is_none()
            {
                resolved.names.push(t.name.clone());
            }
        }
        resolved
    }

    /// Exact-match lookup of a target's base address.
    pub fn resolve(&self, name: &str) -> Result<&str, ForwardError> {
        self.addresses
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ForwardError::UnknownTarget(name.to_string()))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Join two path segments with exactly one `/` between them.
///
/// An empty suffix leaves the base unchanged.
pub fn single_join_path(base: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return base.to_string();
    }
    match (base.ends_with('/'), suffix.starts_with('/')) {
        (true, true) => format!("{base}{}", &suffix[1..]),
        (false, false) => format!("{base}/{suffix}"),
        _ => format!("{base}{suffix}"),
    }
}

/// Build the outbound URI for `path` and `query` under `base`.
///
/// With `websocket` the scheme becomes `ws`/`wss`, otherwise `http`/`https`.
/// A query on the base address is kept ahead of the inbound one.
pub fn target_uri(
    base: &str,
    path: &str,
    query: Option<&str>,
    websocket: bool,
) -> Result<Uri, ForwardError> {
    let base_uri: Uri = base
        .parse()
        .map_err(|e| ForwardError::InvalidTarget(format!("{base}: {e}")))?;
    let secure = match base_uri.scheme_str() {
        Some("http" | "ws") => false,
        Some("https" | "wss") => true,
        _ => return Err(ForwardError::InvalidTarget(format!("{base}: unsupported scheme"))),
    };
    let scheme = match (websocket, secure) {
        (true, true) => "wss",
        (true, false) => "ws",
        (false, true) => "https",
        (false, false) => "http",
    };
    let authority = base_uri
        .authority()
        .ok_or_else(|| ForwardError::InvalidTarget(format!("{base}: missing host")))?;

    let mut path_and_query = single_join_path(base_uri.path(), path);
    let query = match (base_uri.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(b), Some(q)) => Some(format!("{b}&{q}")),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    };
    if let Some(q) = query {
        path_and_query.push('?');
        path_and_query.push_str(&q);
    }

    Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ForwardError::InvalidTarget(format!("{base}: {e}")))
}

/// `Connection` carries the `upgrade` token and `Upgrade` is `websocket`.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

/// Headers owned by each HTTP hop rather than the end-to-end exchange.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
    )
}

/// Headers the WebSocket client builds itself during the backend handshake.
fn is_handshake_managed(name: &HeaderName) -> bool {
    is_hop_by_hop(name)
        || matches!(
            name.as_str(),
            "host"
                | "sec-websocket-key"
                | "sec-websocket-version"
                | "sec-websocket-extensions"
                | "sec-websocket-accept"
                | "sec-websocket-protocol"
        )
}

/// Copy every header from `src` into `dst` except those `skip` rejects.
fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap, skip: impl Fn(&HeaderName) -> bool) {
    for (name, value) in src {
        if !skip(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Sub-protocols offered by the client, in preference order.
pub fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn security_key_value(ctx: &ProxyContext) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&ctx.config.auth.security_key)
        .map_err(|_| ApiError::Internal("security key is not a valid header value".into()))
}

#[derive(Deserialize)]
pub struct ForwardQuery {
    pub name: Option<String>,
}

/// Any method on `/api/cmd` and `/api/cmd/*`: forward to `?name=<target>`.
///
/// - `400 Bad Request`: `name` missing
/// - `404 Not Found`: unknown target
/// - `500 Internal Server Error`: target address unusable
/// - `502 Bad Gateway`: backend unreachable or handshake refused
pub async fn forward(
    State(ctx): State<ProxyContext>,
    Query(query): Query<ForwardQuery>,
    request: Request,
) -> Result<Response, ApiError> {
    let name = query
        .name
        .filter(|n| !n.is_empty())
        .ok_or(ForwardError::MissingTargetName)?;
    let base = ctx.targets.resolve(&name)?.to_string();

    if is_websocket_request(request.headers()) {
        forward_duplex(ctx, name, &base, request).await
    } else {
        forward_plain(&ctx, &name, &base, request).await
    }
}

async fn forward_plain(
    ctx: &ProxyContext,
    name: &str,
    base: &str,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let uri = target_uri(base, parts.uri.path(), parts.uri.query(), false)?;

    let mut outbound = Request::new(body);
    *outbound.method_mut() = parts.method.clone();
    *outbound.uri_mut() = uri.clone();
    copy_headers(&parts.headers, outbound.headers_mut(), |h| {
        is_hop_by_hop(h) || h.as_str() == "host"
    });
    outbound
        .headers_mut()
        .insert(SECURITY_KEY_HEADER, security_key_value(ctx)?);

    let response = tokio::time::timeout(ctx.config.server.write_timeout(), ctx.client.request(outbound))
        .await
        .map_err(|_| ForwardError::Upstream(format!("{uri}: timed out")))?
        .map_err(|e| {
            warn!(target_name = %name, %uri, "forward failed: {e}");
            ForwardError::Upstream(format!("{uri}: {e}"))
        })?;

    let (mut resp_parts, incoming) = response.into_parts();
    let mut headers = HeaderMap::with_capacity(resp_parts.headers.len());
    copy_headers(&resp_parts.headers, &mut headers, is_hop_by_hop);
    resp_parts.headers = headers;
    Ok(Response::from_parts(resp_parts, Body::new(incoming)))
}

async fn forward_duplex(
    ctx: ProxyContext,
    name: String,
    base: &str,
    request: Request,
) -> Result<Response, ApiError> {
    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &ctx).await {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let uri = target_uri(base, parts.uri.path(), parts.uri.query(), true)?;
    let mut handshake = uri
        .to_string()
        .into_client_request()
        .map_err(|e| ForwardError::InvalidTarget(e.to_string()))?;
    copy_headers(&parts.headers, handshake.headers_mut(), is_handshake_managed);
    handshake
        .headers_mut()
        .insert(SECURITY_KEY_HEADER, security_key_value(&ctx)?);
    let protocols = requested_protocols(&parts.headers);
    if !protocols.is_empty() {
        let offered = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|_| ApiError::Validation("invalid Sec-WebSocket-Protocol".into()))?;
        handshake.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
    }

    let timeout = Duration::from_secs(ctx.config.relay.handshake_timeout_secs);
    let (backend, backend_response) =
        match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(handshake)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(target_name = %name, %uri, "backend handshake failed: {e}");
                return Err(ForwardError::Handshake(e.to_string()).into());
            }
            Err(_) => return Err(ForwardError::Handshake(format!("{uri}: timed out")).into()),
        };

    let chosen = backend_response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let ws = match chosen {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    info!(target_name = %name, %uri, "duplex session relayed");
    let limiter = ctx.limiter.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        match relay::relay(socket, backend, &limiter).await {
            Ok((direction, end)) => {
                info!(target_name = %name, ?direction, "duplex session ended: {end}");
            }
            Err(e) => warn!(target_name = %name, "duplex session not relayed: {e}"),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Targets {
        Targets::from_config(&[
            TargetConfig {
                name: "local".into(),
                address: "http://127.0.0.1:5544".into(),
            },
            TargetConfig {
                name: "edge".into(),
                address: "https://edge.example:8443/base/".into(),
            },
        ])
    }

    #[test]
    fn test_resolve_exact_match_only() {
        let t = targets();
        assert_eq!(t.resolve("local").unwrap(), "http://127.0.0.1:5544");
        assert!(matches!(t.resolve("unknown"), Err(ForwardError::UnknownTarget(_))));
        assert!(t.resolve("LOCAL").is_err());
        assert_eq!(t.names(), ["local".to_string(), "edge".to_string()]);
    }

    #[test]
    fn test_single_join_path() {
        assert_eq!(single_join_path("/a/", "/b"), "/a/b");
        assert_eq!(single_join_path("/a", ""), "/a");
        assert_eq!(single_join_path("/a", "b"), "/a/b");
        assert_eq!(single_join_path("/a/", "b"), "/a/b");
        assert_eq!(single_join_path("/", "/api/cmd"), "/api/cmd");
    }

    #[test]
    fn test_target_uri_plain_and_websocket() {
        let plain = target_uri("http://127.0.0.1:5544", "/api/cmd/ids", Some("name=local"), false).unwrap();
        assert_eq!(plain.to_string(), "http://127.0.0.1:5544/api/cmd/ids?name=local");

        let ws = target_uri("http://127.0.0.1:5544", "/api/cmd/output", Some("task_id=x"), true).unwrap();
        assert_eq!(ws.to_string(), "ws://127.0.0.1:5544/api/cmd/output?task_id=x");

        let secure = target_uri("https://edge.example:8443/base/?v=1", "/api/cmd", Some("a=b"), true).unwrap();
        assert_eq!(secure.to_string(), "wss://edge.example:8443/base/api/cmd?v=1&a=b");
    }

    #[test]
    fn test_target_uri_rejects_unusable_base() {
        assert!(matches!(
            target_uri("ftp://host", "/x", None, false),
            Err(ForwardError::InvalidTarget(_))
        ));
        assert!(matches!(
            target_uri("/relative/only", "/x", None, false),
            Err(ForwardError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_websocket_detection_is_token_based() {
        let mut h = HeaderMap::new();
        h.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        h.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_request(&h));

        h.insert(UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_request(&h));

        let mut h = HeaderMap::new();
        h.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_websocket_request(&h));
    }

    #[test]
    fn test_header_copy_strips_transport_headers() {
        let mut src = HeaderMap::new();
        src.insert("connection", HeaderValue::from_static("upgrade"));
        src.insert("sec-websocket-key", HeaderValue::from_static("abc"));
        src.insert("host", HeaderValue::from_static("proxy:5533"));
        src.insert("x-request-id", HeaderValue::from_static("42"));
        src.append("accept", HeaderValue::from_static("text/plain"));
        src.append("accept", HeaderValue::from_static("application/json"));

        let mut handshake = HeaderMap::new();
        copy_headers(&src, &mut handshake, is_handshake_managed);
        assert_eq!(handshake.len(), 3);
        assert_eq!(handshake.get_all("accept").iter().count(), 2);
        assert!(handshake.get("host").is_none());

        let mut plain = HeaderMap::new();
        copy_headers(&src, &mut plain, is_hop_by_hop);
        assert!(plain.get("sec-websocket-key").is_some());
        assert!(plain.get("connection").is_none());
    }

    #[test]
    fn test_requested_protocols_keeps_order() {
        let mut h = HeaderMap::new();
        h.append(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("v2.cmder, v1.cmder"));
        h.append(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("legacy"));
        assert_eq!(requested_protocols(&h), vec!["v2.cmder", "v1.cmder", "legacy"]);
        assert!(requested_protocols(&HeaderMap::new()).is_empty());
    }
}
