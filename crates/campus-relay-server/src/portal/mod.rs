//! Domain fetches against the portal.
//!
//! Every fetch normalizes at this boundary: whatever the page looks like,
//! callers get a `Vec` of canonical records (or a [`Profile`]).

pub mod html;

use async_trait::async_trait;
use campus_relay_core::time::{now_local, offset_from_minutes, today};
use campus_relay_core::{
    AssessmentRecord, AttendanceRecord, Domain, ExamRecord, GradeRecord, Profile, RelayError,
    Result,
};
use time::UtcOffset;

use crate::config::{PageConfig, UpstreamConfig};
use crate::session::Session;

/// The five per-domain fetches.
#[async_trait]
pub trait DomainFetcher: Send + Sync {
    async fn attendance(&self, session: &Session) -> Result<Vec<AttendanceRecord>>;
    async fn grade_summary(&self, session: &Session) -> Result<Vec<GradeRecord>>;
    async fn exam_schedule(&self, session: &Session) -> Result<Vec<ExamRecord>>;
    async fn assessments(&self, session: &Session) -> Result<Vec<AssessmentRecord>>;
    async fn profile(&self, session: &Session) -> Result<Profile>;
}

/// Scrapes the configured portal pages.
pub struct HttpPortal {
    config: UpstreamConfig,
    offset: UtcOffset,
}

impl HttpPortal {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            config: config.clone(),
            offset: offset_from_minutes(config.utc_offset_minutes),
        }
    }

    async fn fetch_table(&self, session: &Session, page: &PageConfig) -> Result<Vec<Vec<String>>> {
        let body = session.get_page(&page.path).await?;
        html::table_rows(&body, &page.table_id).ok_or_else(|| {
            RelayError::scraping(format!(
                "Table '{}' not found on {}",
                page.table_id, page.path
            ))
        })
    }
}

/// Map rows, skipping (and logging) the ones that do not parse.
fn map_rows<T>(
    domain: Domain,
    rows: Vec<Vec<String>>,
    map: impl Fn(&[String]) -> Result<T>,
) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match map(row.as_slice()) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(%domain, error = %err, "Skipping unparseable row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl DomainFetcher for HttpPortal {
    async fn attendance(&self, session: &Session) -> Result<Vec<AttendanceRecord>> {
        let rows = self
            .fetch_table(session, &self.config.pages.attendance)
            .await?;
        let target = self.config.attendance_target_percent;
        Ok(map_rows(Domain::Attendance, rows, |row| {
            AttendanceRecord::from_row(row).map(|record| record.with_leave_budget(target))
        }))
    }

    async fn grade_summary(&self, session: &Session) -> Result<Vec<GradeRecord>> {
        let rows = self
            .fetch_table(session, &self.config.pages.grade_summary)
            .await?;
        Ok(map_rows(Domain::GradeSummary, rows, GradeRecord::from_row))
    }

    async fn exam_schedule(&self, session: &Session) -> Result<Vec<ExamRecord>> {
        let rows = self
            .fetch_table(session, &self.config.pages.exam_schedule)
            .await?;
        let now = now_local(self.offset);
        Ok(map_rows(Domain::ExamSchedule, rows, |row| {
            ExamRecord::from_row(row, now)
        }))
    }

    async fn assessments(&self, session: &Session) -> Result<Vec<AssessmentRecord>> {
        let rows = self
            .fetch_table(session, &self.config.pages.assessments)
            .await?;
        Ok(map_rows(Domain::Assessments, rows, AssessmentRecord::from_row))
    }

    /// Falls back to the account id when the page has no profile table.
    async fn profile(&self, session: &Session) -> Result<Profile> {
        let page = &self.config.pages.profile;
        let body = session.get_page(&page.path).await?;
        let profile = match html::table_rows(&body, &page.table_id) {
            Some(rows) => Profile::from_cells(&rows.concat(), session.account(), today(self.offset)),
            None => Profile::fallback(session.account()),
        };
        Ok(profile)
    }
}
