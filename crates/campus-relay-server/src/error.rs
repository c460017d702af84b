//! HTTP rendering of [`RelayError`].

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use campus_relay_core::{RelayError, Timestamp, now_utc};
use serde::Serialize;
use serde_json::Value;

use crate::admission::AdmissionDecision;

/// Message returned in place of internal error text in production.
const GENERIC_MESSAGE: &str = "An internal error occurred. Please try again later.";

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
    request_id: String,
    timestamp: Timestamp,
}

/// A [`RelayError`] bound to the request that produced it.
#[derive(Debug)]
pub struct ApiError {
    pub error: RelayError,
    pub request_id: String,
    pub details: Option<Value>,
    pub rate_limit: Option<AdmissionDecision>,
    /// Hide non-client-safe messages.
    pub production: bool,
}

impl ApiError {
    pub fn new(error: RelayError, request_id: impl Into<String>, production: bool) -> Self {
        Self {
            error,
            request_id: request_id.into(),
            details: None,
            rate_limit: None,
            production,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_rate_limit(mut self, decision: AdmissionDecision) -> Self {
        self.rate_limit = Some(decision);
        self
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn public_message(&self) -> String {
        if self.production && !self.error.is_client_safe() {
            GENERIC_MESSAGE.to_string()
        } else {
            self.error.message().to_string()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(request_id = %self.request_id, error = %self.error, "Request failed");
        } else {
            tracing::info!(request_id = %self.request_id, error = %self.error, "Request rejected");
        }

        let body = ErrorBody {
            error: self.error.kind(),
            message: self.public_message(),
            // Details can carry internals too.
            details: if self.production && !self.error.is_client_safe() {
                None
            } else {
                self.details
            },
            request_id: self.request_id,
            timestamp: now_utc(),
        };

        let mut headers = HeaderMap::new();
        if let Some(decision) = &self.rate_limit {
            insert_rate_limit_headers(&mut headers, decision);
        }

        (status, headers, Json(body)).into_response()
    }
}

/// `X-RateLimit-*` headers, plus `Retry-After` on denial. Reset is a unix timestamp.
pub fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    let reset_at = now_utc().unix_timestamp() + decision.reset_after.as_secs().max(1) as i64;
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset_at));
    if let Some(retry_after) = decision.retry_after {
        headers.insert("retry-after", HeaderValue::from(retry_after.as_secs()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn every_kind_maps_to_its_status() {
        let cases = [
            (RelayError::authentication("x"), StatusCode::UNAUTHORIZED),
            (RelayError::validation("x"), StatusCode::UNPROCESSABLE_ENTITY),
            (RelayError::rate_limit("x"), StatusCode::TOO_MANY_REQUESTS),
            (RelayError::external_service("x"), StatusCode::SERVICE_UNAVAILABLE),
            (RelayError::scraping("x"), StatusCode::BAD_GATEWAY),
            (RelayError::data_processing("x"), StatusCode::INTERNAL_SERVER_ERROR),
            (RelayError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            let response = ApiError::new(error, "req", false).into_response();
            assert_eq!(response.status(), status);
        }
    }

    #[tokio::test]
    async fn body_carries_kind_message_and_request_id() {
        let response =
            ApiError::new(RelayError::validation("Missing credentials"), "req-7", true)
                .into_response();
        let body = body_json(response).await;
        assert_eq!(body["error"], "ValidationError");
        assert_eq!(body["message"], "Missing credentials");
        assert_eq!(body["request_id"], "req-7");
        assert!(body["timestamp"].is_string());
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn production_hides_internal_text() {
        let error = RelayError::scraping("Table 'DgResult' not found");
        let hidden = body_json(ApiError::new(error.clone(), "r", true).into_response()).await;
        assert_eq!(hidden["message"], GENERIC_MESSAGE);

        let shown = body_json(ApiError::new(error, "r", false).into_response()).await;
        assert_eq!(shown["message"], "Table 'DgResult' not found");
    }

    #[tokio::test]
    async fn denial_carries_rate_limit_headers() {
        let decision = AdmissionDecision {
            allowed: false,
            limit: 3,
            remaining: 0,
            reset_after: Duration::from_secs(42),
            retry_after: Some(Duration::from_secs(60)),
        };
        let response = ApiError::new(RelayError::rate_limit("Too many requests"), "r", true)
            .with_rate_limit(decision)
            .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-limit"], "3");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "60");
        let reset: i64 = headers["x-ratelimit-reset"].to_str().unwrap().parse().unwrap();
        assert!(reset > now_utc().unix_timestamp());
    }
}
