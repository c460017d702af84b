//! Concurrent fan-out over the five domains and fan-in into one result.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use campus_relay_core::time::{offset_from_minutes, today};
use campus_relay_core::{
    CombinedResult, Domain, DomainOutcomes, DomainResult, Identity, RelayError, Result,
};
use futures_util::FutureExt;
use serde_json::Value;
use time::UtcOffset;
use tokio::time::Instant;

use crate::cache::CacheManager;
use crate::config::AppConfig;
use crate::metrics;
use crate::portal::DomainFetcher;
use crate::session::{Session, SessionFactory, SessionScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateSource {
    Cache,
    Upstream,
}

/// A merged result plus where it came from and which slots degraded.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub result: CombinedResult,
    pub source: AggregateSource,
    pub failed: Vec<Domain>,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub combined_ttl: Duration,
    /// Fetches still running this long after fan-out starts are failed.
    pub deadline: Duration,
    pub utc_offset: UtcOffset,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            combined_ttl: config.cache.combined_ttl(),
            deadline: config.upstream.request_deadline(),
            utc_offset: offset_from_minutes(config.upstream.utc_offset_minutes),
        }
    }
}

/// Session scope each domain is fetched under.
pub fn scope_for(domain: Domain) -> SessionScope {
    match domain {
        Domain::GradeSummary => SessionScope::Grades,
        _ => SessionScope::Studzone,
    }
}

pub struct AggregationOrchestrator {
    sessions: Arc<dyn SessionFactory>,
    fetcher: Arc<dyn DomainFetcher>,
    cache: Arc<CacheManager>,
    settings: OrchestratorSettings,
}

impl AggregationOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        fetcher: Arc<dyn DomainFetcher>,
        cache: Arc<CacheManager>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            sessions,
            fetcher,
            cache,
            settings,
        }
    }

    /// Cache key of the merged result: account plus the current local date.
    pub fn combined_key(&self, identity: &Identity) -> String {
        let date = today(self.settings.utc_offset).to_string();
        self.cache.generate_key(
            "combined",
            &[("account", identity.account()), ("date", date.as_str())],
        )
    }

    /// All five domains for `identity`.
    ///
    /// A cache hit returns before any session is opened. Session failures
    /// abort the request; individual fetch failures only empty their slot.
    pub async fn aggregate(&self, identity: &Identity) -> Result<Aggregate> {
        let key = self.combined_key(identity);
        if let Some(result) = self.cache.get::<CombinedResult>(&key).await {
            tracing::info!(account = %identity.masked_account(), "Returning cached combined data");
            return Ok(Aggregate {
                result,
                source: AggregateSource::Cache,
                failed: Vec::new(),
            });
        }

        let (studzone, grades) = tokio::try_join!(
            self.sessions.create_session(identity, SessionScope::Studzone),
            self.sessions.create_session(identity, SessionScope::Grades),
        )?;

        let outcomes = self.fan_out(&studzone, &grades).await;
        let failed: Vec<Domain> = outcomes
            .failures()
            .into_iter()
            .map(|(domain, cause)| {
                tracing::warn!(
                    account = %identity.masked_account(),
                    %domain,
                    error = %cause,
                    "Domain fetch failed"
                );
                metrics::record_domain_failure(domain.slot());
                domain
            })
            .collect();

        let result = outcomes.merge();
        self.cache
            .set(&key, &result, Some(self.settings.combined_ttl))
            .await;

        Ok(Aggregate {
            result,
            source: AggregateSource::Upstream,
            failed,
        })
    }

    /// Run the five fetches concurrently and wait for all of them.
    pub async fn fan_out(&self, studzone: &Session, grades: &Session) -> DomainOutcomes {
        let deadline = Instant::now().checked_add(self.settings.deadline);
        let fetcher = self.fetcher.as_ref();

        let (attendance, grade_summary, exam_schedule, assessments, profile) = tokio::join!(
            guarded(deadline, Domain::Attendance, fetcher.attendance(studzone)),
            guarded(deadline, Domain::GradeSummary, fetcher.grade_summary(grades)),
            guarded(deadline, Domain::ExamSchedule, fetcher.exam_schedule(studzone)),
            guarded(deadline, Domain::Assessments, fetcher.assessments(studzone)),
            guarded(
                deadline,
                Domain::Profile,
                fetcher.profile(studzone).map(|profile| profile.map(Some)),
            ),
        );

        DomainOutcomes {
            attendance,
            grade_summary,
            exam_schedule,
            assessments,
            profile,
        }
    }

    /// One domain as JSON, cached per account for the default TTL.
    ///
    /// The session is only opened on a cache miss.
    pub async fn fetch_domain(&self, identity: &Identity, domain: Domain) -> Result<Value> {
        let key = self
            .cache
            .generate_key(domain.slot(), &[("account", identity.account())]);

        self.cache
            .get_or_populate(&key, None, move || async move {
                let session = self
                    .sessions
                    .create_session(identity, scope_for(domain))
                    .await?;
                let fetcher = self.fetcher.as_ref();
                let value = match domain {
                    Domain::Attendance => serde_json::to_value(fetcher.attendance(&session).await?)?,
                    Domain::GradeSummary => {
                        serde_json::to_value(fetcher.grade_summary(&session).await?)?
                    }
                    Domain::ExamSchedule => {
                        serde_json::to_value(fetcher.exam_schedule(&session).await?)?
                    }
                    Domain::Assessments => {
                        serde_json::to_value(fetcher.assessments(&session).await?)?
                    }
                    Domain::Profile => serde_json::to_value(fetcher.profile(&session).await?)?,
                };
                Ok::<_, RelayError>(value)
            })
            .await
    }
}

/// Error boundary of one fetch: errors, panics and the deadline all become
/// a failed slot. A deadline beyond the clock's range is no deadline.
async fn guarded<T>(
    deadline: Option<Instant>,
    domain: Domain,
    fetch: impl Future<Output = Result<T>>,
) -> DomainResult<T> {
    let fetch = AssertUnwindSafe(fetch).catch_unwind();
    let outcome = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fetch).await,
        None => Ok(fetch.await),
    };
    match outcome {
        Ok(Ok(result)) => result.into(),
        Ok(Err(_panic)) => {
            DomainResult::failed(RelayError::internal(format!("{domain} fetch panicked")))
        }
        Err(_elapsed) => DomainResult::failed(RelayError::external_service(format!(
            "{domain} fetch exceeded the request deadline"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use async_trait::async_trait;
    use campus_relay_core::{AssessmentRecord, AttendanceRecord, ExamRecord, GradeRecord, Profile};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    #[derive(Default)]
    struct CountingSessions {
        created: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl SessionFactory for CountingSessions {
        async fn create_session(&self, identity: &Identity, scope: SessionScope) -> Result<Session> {
            self.created.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(RelayError::authentication("Invalid credentials"));
            }
            Ok(Session::new(
                scope,
                identity.account(),
                reqwest::Client::new(),
                Url::parse("http://portal.invalid").unwrap(),
            ))
        }

        async fn validate_session(&self, _session: &Session) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct StubFetcher {
        calls: AtomicUsize,
        failing: HashSet<&'static str>,
        slow: bool,
        /// Serve attendance scraped from a row whose percentage cell is "NaN".
        unscored_attendance: bool,
    }

    impl StubFetcher {
        fn failing(domains: &[Domain]) -> Self {
            Self {
                failing: domains.iter().map(|d| d.slot()).collect(),
                ..Self::default()
            }
        }

        async fn answer<T>(&self, domain: Domain, value: T) -> Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.slow && domain == Domain::Attendance {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.failing.contains(domain.slot()) {
                return Err(RelayError::scraping(format!("{domain} table missing")));
            }
            Ok(value)
        }
    }

    fn attendance() -> AttendanceRecord {
        AttendanceRecord {
            course_code: "20XT61".into(),
            course_name: None,
            total_classes: 40,
            present: 36,
            absent: 4,
            percentage: 90.0,
            affordable_leaves: None,
        }
    }

    fn grade() -> GradeRecord {
        GradeRecord {
            semester: "Sem 1".into(),
            gpa: 8.4,
            credits: 22,
            courses: vec![],
        }
    }

    fn exam() -> ExamRecord {
        ExamRecord {
            course_code: "20XT61".into(),
            course_name: None,
            exam_date: "TBA".into(),
            duration: None,
            venue: None,
            priority: None,
        }
    }

    fn assessment() -> AssessmentRecord {
        AssessmentRecord {
            course_code: "20XT61".into(),
            assessment_type: "CA1".into(),
            marks_obtained: 40.0,
            total_marks: 50.0,
            percentage: Some(80.0),
        }
    }

    #[async_trait]
    impl DomainFetcher for StubFetcher {
        async fn attendance(&self, _s: &Session) -> Result<Vec<AttendanceRecord>> {
            let record = if self.unscored_attendance {
                let row: Vec<String> = ["C1 - New course", "0", "", "", "0", "", "NaN"]
                    .iter()
                    .map(|c| c.to_string())
                    .collect();
                AttendanceRecord::from_row(&row)?
            } else {
                attendance()
            };
            self.answer(Domain::Attendance, vec![record]).await
        }
        async fn grade_summary(&self, _s: &Session) -> Result<Vec<GradeRecord>> {
            self.answer(Domain::GradeSummary, vec![grade()]).await
        }
        async fn exam_schedule(&self, _s: &Session) -> Result<Vec<ExamRecord>> {
            self.answer(Domain::ExamSchedule, vec![exam()]).await
        }
        async fn assessments(&self, _s: &Session) -> Result<Vec<AssessmentRecord>> {
            self.answer(Domain::Assessments, vec![assessment()]).await
        }
        async fn profile(&self, s: &Session) -> Result<Profile> {
            self.answer(Domain::Profile, Profile::fallback(s.account()))
                .await
        }
    }

    fn settings(deadline: Duration) -> OrchestratorSettings {
        OrchestratorSettings {
            combined_ttl: Duration::from_secs(300),
            deadline,
            utc_offset: UtcOffset::UTC,
        }
    }

    fn orchestrator(
        sessions: Arc<CountingSessions>,
        fetcher: Arc<StubFetcher>,
        deadline: Duration,
    ) -> AggregationOrchestrator {
        AggregationOrchestrator::new(
            sessions,
            fetcher,
            Arc::new(CacheManager::local(&CacheConfig::default())),
            settings(deadline),
        )
    }

    fn identity() -> Identity {
        Identity::new("22z201", "hunter22").unwrap()
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_sessions_and_fetches() {
        let sessions = Arc::new(CountingSessions::default());
        let fetcher = Arc::new(StubFetcher::default());
        let relay = orchestrator(sessions.clone(), fetcher.clone(), Duration::from_secs(5));

        let first = relay.aggregate(&identity()).await.unwrap();
        assert_eq!(first.source, AggregateSource::Upstream);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);
        assert_eq!(sessions.created.load(Ordering::SeqCst), 2);

        let second = relay.aggregate(&identity()).await.unwrap();
        assert_eq!(second.source, AggregateSource::Cache);
        assert_eq!(second.result, first.result);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);
        assert_eq!(sessions.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unscored_attendance_row_still_hits_cache() {
        let fetcher = Arc::new(StubFetcher {
            unscored_attendance: true,
            ..StubFetcher::default()
        });
        let relay = orchestrator(
            Arc::new(CountingSessions::default()),
            fetcher.clone(),
            Duration::from_secs(5),
        );

        let first = relay.aggregate(&identity()).await.unwrap();
        assert_eq!(first.result.attendance[0].percentage, 0.0);
        let json = serde_json::to_value(&first.result).unwrap();
        assert_eq!(json["attendance"][0]["percentage"], 0.0);

        let second = relay.aggregate(&identity()).await.unwrap();
        assert_eq!(second.source, AggregateSource::Cache);
        assert_eq!(second.result, first.result);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn failing_attendance_only_empties_its_slot() {
        let fetcher = Arc::new(StubFetcher::failing(&[Domain::Attendance]));
        let relay = orchestrator(
            Arc::new(CountingSessions::default()),
            fetcher,
            Duration::from_secs(5),
        );

        let aggregate = relay.aggregate(&identity()).await.unwrap();
        assert_eq!(aggregate.failed, vec![Domain::Attendance]);
        let result = aggregate.result;
        assert!(result.attendance.is_empty());
        assert_eq!(result.cgpa, vec![grade()]);
        assert_eq!(result.timetable, vec![exam()]);
        assert_eq!(result.internals, vec![assessment()]);
        assert_eq!(result.user_info, Some(Profile::fallback("22z201")));
    }

    #[tokio::test]
    async fn total_failure_still_yields_five_slots() {
        let fetcher = Arc::new(StubFetcher::failing(&Domain::ALL));
        let relay = orchestrator(
            Arc::new(CountingSessions::default()),
            fetcher,
            Duration::from_secs(5),
        );

        let aggregate = relay.aggregate(&identity()).await.unwrap();
        assert_eq!(aggregate.failed, Domain::ALL.to_vec());
        assert_eq!(aggregate.result, CombinedResult::default());

        let json = serde_json::to_value(&aggregate.result).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn slow_fetch_is_cut_at_the_deadline() {
        let fetcher = Arc::new(StubFetcher {
            slow: true,
            ..StubFetcher::default()
        });
        let relay = orchestrator(
            Arc::new(CountingSessions::default()),
            fetcher,
            Duration::from_millis(100),
        );

        let started = std::time::Instant::now();
        let aggregate = relay.aggregate(&identity()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(aggregate.failed, vec![Domain::Attendance]);
        assert_eq!(aggregate.result.cgpa, vec![grade()]);
    }

    #[tokio::test]
    async fn unbounded_deadline_does_not_overflow() {
        let relay = orchestrator(
            Arc::new(CountingSessions::default()),
            Arc::new(StubFetcher::default()),
            Duration::MAX,
        );
        let aggregate = relay.aggregate(&identity()).await.unwrap();
        assert!(aggregate.failed.is_empty());
    }

    #[tokio::test]
    async fn rejected_login_aborts_before_any_fetch() {
        let sessions = Arc::new(CountingSessions {
            reject: true,
            ..CountingSessions::default()
        });
        let fetcher = Arc::new(StubFetcher::default());
        let relay = orchestrator(sessions, fetcher.clone(), Duration::from_secs(5));

        let err = relay.aggregate(&identity()).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_domain_is_cached_per_account() {
        let sessions = Arc::new(CountingSessions::default());
        let fetcher = Arc::new(StubFetcher::default());
        let relay = orchestrator(sessions.clone(), fetcher.clone(), Duration::from_secs(5));

        let first = relay
            .fetch_domain(&identity(), Domain::GradeSummary)
            .await
            .unwrap();
        let second = relay
            .fetch_domain(&identity(), Domain::GradeSummary)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0]["semester"], "Sem 1");
        assert_eq!(sessions.created.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
