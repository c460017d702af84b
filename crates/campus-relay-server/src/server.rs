use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{get, post},
};
use campus_relay_core::{CredentialDecoder, ObfuscatedPayloadDecoder};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::admission::AdmissionController;
use crate::aggregate::{AggregationOrchestrator, OrchestratorSettings};
use crate::cache::CacheManager;
use crate::config::AppConfig;
use crate::feedback::{
    FEEDBACK_QUEUE_CAPACITY, FeedbackQueue, FeedbackSubmitter, PortalFeedbackSubmitter,
};
use crate::portal::{DomainFetcher, HttpPortal};
use crate::session::{PortalSessionFactory, SessionFactory};
use crate::{handlers, middleware as app_middleware};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub cache: Arc<CacheManager>,
    pub admission: Arc<AdmissionController>,
    pub orchestrator: Arc<AggregationOrchestrator>,
    pub decoder: Arc<dyn CredentialDecoder>,
    pub feedback: FeedbackQueue,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the collaborators together and start the feedback worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: AppConfig,
        cache: CacheManager,
        sessions: Arc<dyn SessionFactory>,
        fetcher: Arc<dyn DomainFetcher>,
        submitter: Arc<dyn FeedbackSubmitter>,
    ) -> Self {
        let cache = Arc::new(cache);
        let orchestrator = AggregationOrchestrator::new(
            sessions.clone(),
            fetcher,
            cache.clone(),
            OrchestratorSettings::from_config(&config),
        );
        let (feedback, _worker) = FeedbackQueue::spawn(FEEDBACK_QUEUE_CAPACITY, sessions, submitter);

        Self {
            admission: Arc::new(AdmissionController::new(&config.rate_limit)),
            decoder: Arc::new(ObfuscatedPayloadDecoder::new(
                config.credentials.payload_salt.clone(),
            )),
            orchestrator: Arc::new(orchestrator),
            config: Arc::new(config),
            cache,
            feedback,
            started_at: Instant::now(),
        }
    }

    /// State backed by the real portal.
    pub fn for_portal(config: AppConfig, cache: CacheManager) -> anyhow::Result<Self> {
        let sessions = Arc::new(PortalSessionFactory::new(&config.upstream)?);
        let fetcher = Arc::new(HttpPortal::new(&config.upstream));
        let submitter = Arc::new(PortalFeedbackSubmitter::new(&config.upstream.pages.feedback));
        Ok(Self::new(config, cache, sessions, fetcher, submitter))
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    Router::new()
        // Service endpoints
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Aggregated and per-domain data
        .route("/data", post(handlers::data))
        .route("/login", post(handlers::login))
        .route("/attendance", post(handlers::attendance))
        .route("/cgpa", post(handlers::cgpa))
        .route("/internals", post(handlers::internals))
        .route("/exam-schedule", post(handlers::exam_schedule))
        .route("/user-info", post(handlers::user_info))
        .route("/auto-feedback", post(handlers::auto_feedback))
        // Middleware stack, innermost first: body limit -> admission -> metrics
        // -> cors/compression -> trace -> request id
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::admission,
        ))
        .layer(middleware::from_fn(app_middleware::record_metrics))
        .layer(cors_layer(&state.config.server.cors_origins))
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let req_id = req
                        .extensions()
                        .get::<app_middleware::RequestId>()
                        .map(|id| id.as_str())
                        .unwrap_or("");
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = tracing::field::Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .with_state(state)
}

pub struct ServerBuilder {
    addr: SocketAddr,
    state: AppState,
}

impl ServerBuilder {
    pub fn new(state: AppState) -> Self {
        Self {
            addr: state.config.addr(),
            state,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn build(self) -> RelayServer {
        RelayServer {
            addr: self.addr,
            sweep_interval: Duration::from_secs(self.state.config.rate_limit.sweep_interval_secs),
            admission: self.state.admission.clone(),
            app: build_app(self.state),
        }
    }
}

pub struct RelayServer {
    addr: SocketAddr,
    sweep_interval: Duration,
    admission: Arc<AdmissionController>,
    app: Router,
}

impl RelayServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);

        let sweeper = tokio::spawn(sweep_windows(self.admission, self.sweep_interval));
        let served = axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;
        sweeper.abort();
        served?;
        Ok(())
    }
}

/// Periodically forget clients whose windows have emptied.
async fn sweep_windows(admission: Arc<AdmissionController>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let dropped = admission.sweep();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = admission.tracked(), "Swept idle rate windows");
        }
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
