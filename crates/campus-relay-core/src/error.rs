use thiserror::Error;

/// Error taxonomy shared by every layer of the gateway.
///
/// Each variant maps to exactly one HTTP status (see [`RelayError::status_code`]).
/// Only authentication, validation and rate-limit messages are safe to echo
/// verbatim to callers; everything else is logged and replaced with a generic
/// message in production.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("External service unavailable: {0}")]
    ExternalService(String),

    #[error("Upstream page format changed: {0}")]
    Scraping(String),

    #[error("Data processing failed: {0}")]
    DataProcessing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(message.into())
    }

    pub fn external_service(message: impl Into<String>) -> Self {
        Self::ExternalService(message.into())
    }

    pub fn scraping(message: impl Into<String>) -> Self {
        Self::Scraping(message.into())
    }

    pub fn data_processing(message: impl Into<String>) -> Self {
        Self::DataProcessing(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status code for this error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Authentication(_) => 401,
            Self::Validation(_) => 422,
            Self::RateLimit(_) => 429,
            Self::ExternalService(_) => 503,
            Self::Scraping(_) => 502,
            Self::DataProcessing(_) => 500,
            Self::Internal(_) => 500,
        }
    }

    /// Value of the `error` field in error response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "AuthenticationError",
            Self::Validation(_) => "ValidationError",
            Self::RateLimit(_) => "RateLimitError",
            Self::ExternalService(_) => "ExternalServiceError",
            Self::Scraping(_) => "ScrapingError",
            Self::DataProcessing(_) => "DataProcessingError",
            Self::Internal(_) => "InternalServerError",
        }
    }

    /// The bare message without the kind prefix added by `Display`.
    pub fn message(&self) -> &str {
        match self {
            Self::Authentication(m)
            | Self::Validation(m)
            | Self::RateLimit(m)
            | Self::ExternalService(m)
            | Self::Scraping(m)
            | Self::DataProcessing(m)
            | Self::Internal(m) => m,
        }
    }

    /// Whether the message may be returned to the caller verbatim.
    pub fn is_client_safe(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::Validation(_) | Self::RateLimit(_)
        )
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::DataProcessing(format!("JSON serialization error: {err}"))
    }
}

/// Convenience result type for gateway operations
pub type Result<T> = std::result::Result<T, RelayError>;
