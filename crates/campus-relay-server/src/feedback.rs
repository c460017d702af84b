//! Fire-and-forget feedback submission.
//!
//! `/auto-feedback` only enqueues a job; one worker task drains the queue.
//! Each job runs inside its own error boundary and its outcome is only logged
//! and counted, never reported back to the caller.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use campus_relay_core::{Identity, RelayError, Result};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::config::PageConfig;
use crate::metrics;
use crate::portal::html;
use crate::session::{Session, SessionFactory, SessionScope};

/// Jobs waiting beyond this are refused rather than buffered.
pub const FEEDBACK_QUEUE_CAPACITY: usize = 32;

#[derive(Debug)]
pub struct FeedbackJob {
    pub identity: Identity,
    pub feedback_index: u32,
    pub request_id: String,
}

/// Fills in and submits one feedback form through an authenticated session.
#[async_trait]
pub trait FeedbackSubmitter: Send + Sync {
    async fn submit(&self, session: &Session, feedback_index: u32) -> Result<()>;
}

/// Posts the feedback page's form back with the selected entry.
pub struct PortalFeedbackSubmitter {
    page: PageConfig,
}

impl PortalFeedbackSubmitter {
    pub fn new(page: &PageConfig) -> Self {
        Self { page: page.clone() }
    }
}

#[async_trait]
impl FeedbackSubmitter for PortalFeedbackSubmitter {
    async fn submit(&self, session: &Session, feedback_index: u32) -> Result<()> {
        let body = session.get_page(&self.page.path).await?;
        let pending = html::table_rows(&body, &self.page.table_id).ok_or_else(|| {
            RelayError::scraping(format!("Table '{}' not found on feedback page", self.page.table_id))
        })?;

        if feedback_index as usize >= pending.len() {
            return Err(RelayError::validation(format!(
                "Feedback index {feedback_index} out of range ({} pending)",
                pending.len()
            )));
        }

        let mut form = html::hidden_inputs(&body);
        form.push(("feedback_index".to_string(), feedback_index.to_string()));
        session.post_form(&self.page.path, &form).await?;
        Ok(())
    }
}

/// Sending half of the feedback queue. Cheap to clone.
#[derive(Clone)]
pub struct FeedbackQueue {
    sender: mpsc::Sender<FeedbackJob>,
}

impl FeedbackQueue {
    /// Start the worker and return the queue feeding it.
    pub fn spawn(
        capacity: usize,
        sessions: Arc<dyn SessionFactory>,
        submitter: Arc<dyn FeedbackSubmitter>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(receiver, sessions, submitter));
        (Self { sender }, worker)
    }

    /// Enqueue without waiting. A full or stopped queue is an external-service error.
    pub fn submit(&self, job: FeedbackJob) -> Result<()> {
        self.sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => RelayError::external_service("Feedback queue is full"),
            TrySendError::Closed(_) => {
                RelayError::external_service("Feedback worker is not running")
            }
        })
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<FeedbackJob>,
    sessions: Arc<dyn SessionFactory>,
    submitter: Arc<dyn FeedbackSubmitter>,
) {
    while let Some(job) = receiver.recv().await {
        let outcome = AssertUnwindSafe(process(&job, sessions.as_ref(), submitter.as_ref()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                tracing::info!(
                    request_id = %job.request_id,
                    account = %job.identity.masked_account(),
                    feedback_index = job.feedback_index,
                    "Feedback submitted"
                );
                metrics::record_feedback_job("succeeded");
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    request_id = %job.request_id,
                    account = %job.identity.masked_account(),
                    error = %err,
                    "Feedback submission failed"
                );
                metrics::record_feedback_job("failed");
            }
            Err(_panic) => {
                tracing::error!(request_id = %job.request_id, "Feedback job panicked");
                metrics::record_feedback_job("panicked");
            }
        }
    }
    tracing::debug!("Feedback queue closed, worker exiting");
}

async fn process(
    job: &FeedbackJob,
    sessions: &dyn SessionFactory,
    submitter: &dyn FeedbackSubmitter,
) -> Result<()> {
    let session = sessions
        .create_session(&job.identity, SessionScope::Studzone)
        .await?;
    submitter.submit(&session, job.feedback_index).await
}
