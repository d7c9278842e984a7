//! The Rewriting Reverse Proxy (§4.4): rewrites `Host`, injects an identity token, and
//! upgrades the scheme to HTTPS, then streams the upstream response straight back. No
//! retries; a connection-level failure surfaces as a plain 502.

use crate::config::RuntimeConfig;
use crate::{nameresolve, oracle};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Headers that describe per-hop framing and must never cross the proxy boundary,
/// since the proxy constructs its own framing on both legs (§4.4 "Hop-by-hop headers").
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// A WebSocket upgrade request carries `Connection: Upgrade` / `Upgrade: websocket`. Those
/// two headers are normally hop-by-hop and stripped, but stripping them here would make the
/// upgrade handshake impossible to complete on the upstream leg, defeating §4.4's requirement
/// that upgrades are supported on the listener. Leave both in place for this one request shape.
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
}

fn strip_hop_by_hop_preserving_upgrade(headers: &mut HeaderMap) {
    if is_upgrade_request(headers) {
        for name in HOP_BY_HOP.iter().filter(|n| !matches!(*n, &"connection" | &"upgrade")) {
            headers.remove(*name);
        }
    } else {
        strip_hop_by_hop(headers);
    }
}

pub struct ProxyState {
    pub config: Arc<RuntimeConfig>,
    pub client: reqwest::Client,
}

fn error_response(status: StatusCode, body: String) -> Response {
    (status, body).into_response()
}

#[instrument(skip_all, fields(method = %method, uri = %uri))]
pub async fn handle(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let host_header = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let bare_host = host_header.split(':').next().unwrap_or(host_header);

    let canonical_host = match nameresolve::resolve(
        &state.config.internal_zone,
        bare_host,
        &state.config.current_region,
        &state.config.project_hash,
    ) {
        Ok(host) => host,
        Err(e) => {
            warn!("name mapping failed for host {bare_host:?}: {e}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("cannot map internal host {bare_host:?}: {e}"),
            );
        }
    };

    let url = format!("https://{canonical_host}{uri}");

    let mut outbound_headers = headers.clone();
    strip_hop_by_hop_preserving_upgrade(&mut outbound_headers);
    outbound_headers.remove(axum::http::header::HOST);
    if let Ok(value) = HeaderValue::from_str(&canonical_host) {
        outbound_headers.insert(axum::http::header::HOST, value);
    }

    let has_auth = outbound_headers.contains_key(axum::http::header::AUTHORIZATION);
    if !has_auth {
        let audience = format!("https://{canonical_host}");
        match oracle::identity_token(&state.client, &audience).await {
            Ok(token) => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    outbound_headers.insert(axum::http::header::AUTHORIZATION, value);
                }
            }
            Err(e) => {
                warn!("identity token fetch failed for {canonical_host}: {e}");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to obtain identity token: {e}"),
                );
            }
        }
    }

    let tagged_agent = match outbound_headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        Some(original) => format!("runsd version={}; {original}", state.config.version),
        None => format!("runsd version={}", state.config.version),
    };
    if let Ok(value) = HeaderValue::from_str(&tagged_agent) {
        outbound_headers.insert(axum::http::header::USER_AGENT, value);
    }

    let body_stream = body.into_data_stream();
    let method_reqwest = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unsupported method".to_string()),
    };

    let outbound = state
        .client
        .request(method_reqwest, &url)
        .headers(convert_headers(&outbound_headers))
        .body(reqwest::Body::wrap_stream(body_stream));

    let upstream_response = match outbound.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("upstream request to {url} failed: {e}");
            return error_response(StatusCode::BAD_GATEWAY, format!("upstream request failed: {e}"));
        }
    };

    info!(status = %upstream_response.status(), "proxied request");

    let status =
        StatusCode::from_u16(upstream_response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = convert_headers_back(upstream_response.headers());
    strip_hop_by_hop_preserving_upgrade(&mut response_headers);

    let response_body = Body::from_stream(upstream_response.bytes_stream());
    let mut response = Response::new(response_body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

fn convert_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

fn convert_headers_back(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}
