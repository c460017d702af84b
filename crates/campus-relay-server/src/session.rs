//! Authenticated upstream sessions.
//!
//! A [`Session`] is a cookie-holding HTTP client that has passed one portal
//! login flow. Sessions are created per request and dropped with it; they are
//! never pooled or shared between requests, even for the same identity.

use std::fmt;

use async_trait::async_trait;
use campus_relay_core::{Identity, RelayError, Result};
use url::Url;

use crate::config::{LoginFlowConfig, UpstreamConfig};
use crate::portal::html;

/// Which portal login flow a session went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionScope {
    /// Main student area: attendance, exam schedule, assessments, profile
    Studzone,
    /// Results area, which needs its own login
    Grades,
}

impl fmt::Display for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionScope::Studzone => f.write_str("studzone"),
            SessionScope::Grades => f.write_str("grades"),
        }
    }
}

pub struct Session {
    scope: SessionScope,
    account: String,
    client: reqwest::Client,
    base_url: Url,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("scope", &self.scope)
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        scope: SessionScope,
        account: impl Into<String>,
        client: reqwest::Client,
        base_url: Url,
    ) -> Self {
        Self {
            scope,
            account: account.into(),
            client,
            base_url,
        }
    }

    pub fn scope(&self) -> SessionScope {
        self.scope
    }

    /// Normalized account id the session was opened for.
    pub fn account(&self) -> &str {
        &self.account
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RelayError::internal(format!("Invalid portal path '{path}': {e}")))
    }

    /// GET a portal page and return its body. Non-2xx is an external-service failure.
    pub async fn get_page(&self, path: &str) -> Result<String> {
        let response = self
            .client
            .get(self.url(path)?)
            .send()
            .await
            .map_err(upstream_error)?;
        read_body(path, response).await
    }

    /// POST an url-encoded form and return the resulting page.
    pub async fn post_form(&self, path: &str, form: &[(String, String)]) -> Result<String> {
        let response = self
            .client
            .post(self.url(path)?)
            .form(form)
            .send()
            .await
            .map_err(upstream_error)?;
        read_body(path, response).await
    }

    /// Lightweight liveness check: GET `path` and require a 2xx.
    pub async fn probe(&self, path: &str) -> bool {
        let Ok(url) = self.url(path) else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::warn!(scope = %self.scope, error = %err, "Session validation failed");
                false
            }
        }
    }
}

async fn read_body(path: &str, response: reqwest::Response) -> Result<String> {
    let status = response.status();
    if !status.is_success() {
        return Err(RelayError::external_service(format!(
            "Portal returned {status} for {path}"
        )));
    }
    response.text().await.map_err(upstream_error)
}

fn upstream_error(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::external_service("Portal request timed out")
    } else if err.is_connect() {
        RelayError::external_service("Portal is unreachable")
    } else {
        RelayError::external_service(format!("Portal request failed: {err}"))
    }
}

/// Produces authenticated sessions. The seam the orchestrator and feedback
/// worker are tested through.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Log in through the flow selected by `scope`. Rejected credentials are
    /// an authentication error.
    async fn create_session(&self, identity: &Identity, scope: SessionScope) -> Result<Session>;

    /// One network round trip; use sparingly.
    async fn validate_session(&self, session: &Session) -> bool;
}

/// Logs in against the real portal.
pub struct PortalSessionFactory {
    config: UpstreamConfig,
    base_url: Url,
}

impl PortalSessionFactory {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            RelayError::internal(format!("Invalid upstream base url '{}': {e}", config.base_url))
        })?;
        Ok(Self {
            config: config.clone(),
            base_url,
        })
    }

    fn flow(&self, scope: SessionScope) -> &LoginFlowConfig {
        match scope {
            SessionScope::Studzone => &self.config.studzone_login,
            SessionScope::Grades => &self.config.grades_login,
        }
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.config.request_timeout())
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| RelayError::internal(format!("HTTP client construction failed: {e}")))
    }
}

#[async_trait]
impl SessionFactory for PortalSessionFactory {
    async fn create_session(&self, identity: &Identity, scope: SessionScope) -> Result<Session> {
        let flow = self.flow(scope);
        let session = Session::new(
            scope,
            identity.account(),
            self.build_client()?,
            self.base_url.clone(),
        );

        let login_page = session.get_page(&flow.login_path).await?;
        let mut form = html::hidden_inputs(&login_page);
        form.push((flow.account_field.clone(), identity.account().to_string()));
        form.push((flow.secret_field.clone(), identity.secret().to_string()));

        let landing = session.post_form(&flow.login_path, &form).await?;
        let rejected = flow
            .failure_markers
            .iter()
            .any(|marker| landing.contains(marker.as_str()));
        let confirmed = match &flow.success_marker {
            Some(marker) => landing.contains(marker.as_str()),
            None => true,
        };
        if rejected || !confirmed {
            tracing::info!(account = %identity.masked_account(), %scope, "Portal rejected credentials");
            return Err(RelayError::authentication(format!(
                "Invalid credentials for {scope} portal"
            )));
        }

        tracing::debug!(account = %identity.masked_account(), %scope, "Portal session created");
        Ok(session)
    }

    async fn validate_session(&self, session: &Session) -> bool {
        session.probe(&self.config.probe_path).await
    }
}
