use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use campus_relay_core::RelayError;
use uuid::Uuid;

use crate::error::{ApiError, insert_rate_limit_headers};
use crate::metrics;
use crate::server::AppState;

/// Paths never subject to admission control.
const UNLIMITED_PATHS: &[&str] = &["/", "/health", "/metrics"];

/// Correlation id assigned to every request at ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Assigns a fresh X-Request-ID, stores it in extensions and mirrors it on the response
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut res = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        res.headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    res
}

/// Sliding-window admission control keyed by client identifier.
///
/// Denied requests get a 429 with `Retry-After`; admitted ones carry the
/// remaining quota in `X-RateLimit-*`.
pub async fn admission(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if !state.admission.is_enabled() || UNLIMITED_PATHS.contains(&path.as_str()) {
        return next.run(req).await;
    }

    let client = client_identifier(&req);
    let decision = state.admission.check(&path, &client);

    if !decision.allowed {
        metrics::record_admission_denied(&path);
        tracing::warn!(client = %client, path = %path, "Rate limit exceeded");
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();
        return ApiError::new(
            RelayError::rate_limit("Too many requests. Please try again later."),
            request_id,
            state.config.is_production(),
        )
        .with_rate_limit(decision)
        .into_response();
    }

    let mut res = next.run(req).await;
    insert_rate_limit_headers(res.headers_mut(), &decision);
    res
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
pub fn client_identifier(req: &Request<Body>) -> String {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn record_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let res = next.run(req).await;
    metrics::record_http_request(
        method.as_str(),
        &path,
        res.status().as_u16(),
        started.elapsed(),
    );
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/data");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn forwarded_for_wins() {
        let req = request(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_identifier(&req), "203.0.113.7");
    }

    #[test]
    fn real_ip_then_peer_then_unknown() {
        assert_eq!(
            client_identifier(&request(&[("x-real-ip", "198.51.100.2")])),
            "198.51.100.2"
        );

        let mut req = request(&[]);
        assert_eq!(client_identifier(&req), "unknown");

        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 9], 4711))));
        assert_eq!(client_identifier(&req), "192.0.2.9");
    }
}
