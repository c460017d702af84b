//! Fan-in shapes: per-domain outcomes and the fixed five-slot aggregate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::records::{AssessmentRecord, AttendanceRecord, ExamRecord, GradeRecord, Profile};

/// The five upstream data domains the gateway aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Attendance,
    GradeSummary,
    ExamSchedule,
    Assessments,
    Profile,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Attendance,
        Domain::GradeSummary,
        Domain::ExamSchedule,
        Domain::Assessments,
        Domain::Profile,
    ];

    /// Slot name in [`CombinedResult`] and cache-key prefix for the domain.
    pub fn slot(&self) -> &'static str {
        match self {
            Domain::Attendance => "attendance",
            Domain::GradeSummary => "cgpa",
            Domain::ExamSchedule => "timetable",
            Domain::Assessments => "internals",
            Domain::Profile => "user_info",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slot())
    }
}

/// Tagged outcome of one fan-out fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainResult<T> {
    Ok(T),
    Failed { cause: RelayError },
}

impl<T> DomainResult<T> {
    pub fn failed(cause: RelayError) -> Self {
        Self::Failed { cause }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn failure(&self) -> Option<&RelayError> {
        match self {
            Self::Ok(_) => None,
            Self::Failed { cause } => Some(cause),
        }
    }
}

impl<T: Default> DomainResult<T> {
    /// The fetched value, or the domain's empty default when the fetch failed.
    pub fn into_value(self) -> T {
        match self {
            Self::Ok(value) => value,
            Self::Failed { .. } => T::default(),
        }
    }
}

impl<T> From<Result<T>> for DomainResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(cause) => Self::Failed { cause },
        }
    }
}

/// Outcomes of one complete fan-out, one field per domain.
#[derive(Debug, Clone)]
pub struct DomainOutcomes {
    pub attendance: DomainResult<Vec<AttendanceRecord>>,
    pub grade_summary: DomainResult<Vec<GradeRecord>>,
    pub exam_schedule: DomainResult<Vec<ExamRecord>>,
    pub assessments: DomainResult<Vec<AssessmentRecord>>,
    pub profile: DomainResult<Option<Profile>>,
}

impl DomainOutcomes {
    /// Domains whose fetch failed, in slot order, with their causes.
    pub fn failures(&self) -> Vec<(Domain, &RelayError)> {
        let slots = [
            (Domain::Attendance, self.attendance.failure()),
            (Domain::GradeSummary, self.grade_summary.failure()),
            (Domain::ExamSchedule, self.exam_schedule.failure()),
            (Domain::Assessments, self.assessments.failure()),
            (Domain::Profile, self.profile.failure()),
        ];
        slots
            .into_iter()
            .filter_map(|(domain, cause)| cause.map(|c| (domain, c)))
            .collect()
    }

    /// Merge by slot name. Failed slots degrade to their empty default.
    pub fn merge(self) -> CombinedResult {
        CombinedResult {
            attendance: self.attendance.into_value(),
            cgpa: self.grade_summary.into_value(),
            timetable: self.exam_schedule.into_value(),
            internals: self.assessments.into_value(),
            user_info: self.profile.into_value(),
        }
    }
}

/// Merged response body of `/data`. Always carries all five slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub attendance: Vec<AttendanceRecord>,
    pub cgpa: Vec<GradeRecord>,
    pub timetable: Vec<ExamRecord>,
    pub internals: Vec<AssessmentRecord>,
    pub user_info: Option<Profile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grade() -> GradeRecord {
        GradeRecord {
            semester: "Sem 1".into(),
            gpa: 8.1,
            credits: 21,
            courses: vec![],
        }
    }

    #[test]
    fn failed_slots_degrade_to_defaults() {
        let outcomes = DomainOutcomes {
            attendance: DomainResult::failed(RelayError::scraping("table missing")),
            grade_summary: DomainResult::Ok(vec![grade()]),
            exam_schedule: DomainResult::Ok(vec![]),
            assessments: DomainResult::failed(RelayError::external_service("timeout")),
            profile: DomainResult::Ok(Some(Profile::fallback("22z201"))),
        };

        let failures: Vec<Domain> = outcomes.failures().into_iter().map(|(d, _)| d).collect();
        assert_eq!(failures, vec![Domain::Attendance, Domain::Assessments]);

        let merged = outcomes.merge();
        assert!(merged.attendance.is_empty());
        assert_eq!(merged.cgpa, vec![grade()]);
        assert_eq!(merged.user_info, Some(Profile::fallback("22z201")));
    }

    #[test]
    fn combined_result_always_serializes_five_slots() {
        let value = serde_json::to_value(CombinedResult::default()).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 5);
        for domain in Domain::ALL {
            assert!(object.contains_key(domain.slot()), "missing {domain}");
        }
    }

    #[test]
    fn result_conversion_tags_errors() {
        let ok: DomainResult<Vec<u8>> = Ok(vec![1]).into();
        assert!(!ok.is_failed());
        let failed: DomainResult<Vec<u8>> = Err(RelayError::internal("boom")).into();
        assert_eq!(failed.failure(), Some(&RelayError::internal("boom")));
        assert!(failed.into_value().is_empty());
    }
}
