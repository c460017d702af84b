use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse,
};
use campus_relay_core::{
    CombinedResult, CredentialRequest, Domain, Identity, RelayError, Timestamp, extract_identity,
    now_utc,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::aggregate::AggregateSource;
use crate::error::ApiError;
use crate::feedback::FeedbackJob;
use crate::metrics;
use crate::middleware::RequestId;
use crate::server::AppState;

const DEPRECATION_NOTICE: &str = " (DEPRECATED: Use /data endpoint)";

/// Success envelope shared by every data endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    pub message: String,
    pub data: T,
    pub request_id: String,
    pub timestamp: Timestamp,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T, request_id: &RequestId) -> Self {
        Self {
            status: "success",
            message: message.into(),
            data,
            request_id: request_id.0.clone(),
            timestamp: now_utc(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    #[serde(flatten)]
    pub credentials: CredentialRequest,
    #[serde(default)]
    pub feedback_index: u32,
}

type Body<T> = Result<Json<T>, JsonRejection>;

impl AppState {
    fn api_error(&self, error: RelayError, request_id: &RequestId) -> ApiError {
        ApiError::new(error, request_id.as_str(), self.config.is_production())
    }

    /// Parse and validate credentials from a request body.
    fn identity(
        &self,
        request_id: &RequestId,
        credentials: &CredentialRequest,
    ) -> Result<Identity, ApiError> {
        extract_identity(credentials, self.decoder.as_ref())
            .map_err(|e| self.api_error(e, request_id))
    }
}

fn parse_body<T>(state: &AppState, request_id: &RequestId, body: Body<T>) -> Result<T, ApiError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        state
            .api_error(RelayError::validation("Invalid request body"), request_id)
            .with_details(json!({ "reason": rejection.body_text() }))
    })
}

pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let body = json!({
        "service": "campus-relay",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.server.environment,
        "endpoints": {
            "data": "/data",
            "attendance": "/attendance",
            "cgpa": "/cgpa",
            "internals": "/internals",
            "exam_schedule": "/exam-schedule",
            "user_info": "/user-info",
            "auto_feedback": "/auto-feedback",
            "health": "/health",
            "metrics": "/metrics",
        },
    });
    (StatusCode::OK, Json(body))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let body = json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.server.environment,
        "uptime": state.started_at.elapsed().as_secs(),
        "checks": {
            "cache": state.cache.mode(),
            "upstream": "configured",
        },
        "timestamp": now_utc(),
    });
    (StatusCode::OK, Json(body))
}

pub async fn metrics() -> impl IntoResponse {
    match metrics::render_metrics() {
        Some(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

async fn combined(
    state: &AppState,
    request_id: &RequestId,
    body: Body<CredentialRequest>,
) -> Result<ApiResponse<CombinedResult>, ApiError> {
    let credentials = parse_body(state, request_id, body)?;
    let identity = state.identity(request_id, &credentials)?;

    let aggregate = state
        .orchestrator
        .aggregate(&identity)
        .await
        .map_err(|e| state.api_error(e, request_id))?;

    tracing::info!(
        request_id = %request_id.as_str(),
        account = %identity.masked_account(),
        cached = aggregate.source == AggregateSource::Cache,
        failed_domains = aggregate.failed.len(),
        "Combined data served"
    );

    let message = match aggregate.source {
        AggregateSource::Cache => "Combined data retrieved successfully from cache",
        AggregateSource::Upstream => "Combined data retrieved successfully",
    };
    Ok(ApiResponse::success(message, aggregate.result, request_id))
}

pub async fn data(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Body<CredentialRequest>,
) -> Result<Json<ApiResponse<CombinedResult>>, ApiError> {
    combined(&state, &request_id, body).await.map(Json)
}

/// Legacy alias of `/data`.
pub async fn login(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Body<CredentialRequest>,
) -> Result<Json<ApiResponse<CombinedResult>>, ApiError> {
    let mut response = combined(&state, &request_id, body).await?;
    response.message.push_str(DEPRECATION_NOTICE);
    Ok(Json(response))
}

async fn single_domain(
    state: AppState,
    request_id: RequestId,
    body: Body<CredentialRequest>,
    domain: Domain,
    label: &str,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let credentials = parse_body(&state, &request_id, body)?;
    let identity = state.identity(&request_id, &credentials)?;

    let data = state
        .orchestrator
        .fetch_domain(&identity, domain)
        .await
        .map_err(|e| state.api_error(e, &request_id))?;

    Ok(Json(ApiResponse::success(
        format!("{label} retrieved successfully"),
        data,
        &request_id,
    )))
}

pub async fn attendance(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Body<CredentialRequest>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    single_domain(state, request_id, body, Domain::Attendance, "Attendance data").await
}

pub async fn cgpa(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Body<CredentialRequest>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    single_domain(state, request_id, body, Domain::GradeSummary, "CGPA data").await
}

pub async fn internals(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Body<CredentialRequest>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    single_domain(state, request_id, body, Domain::Assessments, "Internal marks").await
}

pub async fn exam_schedule(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Body<CredentialRequest>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    single_domain(state, request_id, body, Domain::ExamSchedule, "Exam schedule").await
}

pub async fn user_info(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Body<CredentialRequest>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    single_domain(state, request_id, body, Domain::Profile, "User info").await
}

/// Queue a feedback submission and return before it runs.
pub async fn auto_feedback(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Body<FeedbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = parse_body(&state, &request_id, body)?;
    let identity = state.identity(&request_id, &request.credentials)?;

    state
        .feedback
        .submit(FeedbackJob {
            identity,
            feedback_index: request.feedback_index,
            request_id: request_id.0.clone(),
        })
        .map_err(|e| state.api_error(e, &request_id))?;

    let body = json!({
        "status": "accepted",
        "message": "Feedback automation started in background",
        "request_id": request_id.0,
        "timestamp": now_utc(),
    });
    Ok((StatusCode::ACCEPTED, Json(body)))
}
