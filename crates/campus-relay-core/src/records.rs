//! Canonical record shapes for the five upstream domains.
//!
//! Scraping hands rows over as plain cell strings; the `from_row`
//! constructors here are the single place those rows become typed records.
//! A row that cannot be interpreted yields `RelayError::DataProcessing` and
//! the caller decides whether to skip it.

use serde::{Deserialize, Serialize};
use time::{Date, PrimitiveDateTime};

use crate::error::{RelayError, Result};
use crate::time::{parse_day_month_year, parse_portal_datetime};

/// Bound on the leave-budget search so pathological inputs terminate.
const MAX_LEAVE_ITERATIONS: i64 = 1000;

fn cell(row: &[String], idx: usize) -> Option<&str> {
    row.get(idx).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_count(raw: Option<&str>, column: &str) -> Result<u32> {
    match raw {
        None => Ok(0),
        Some(value) => value.parse::<u32>().map_err(|_| {
            RelayError::data_processing(format!("Invalid {column} value '{value}'"))
        }),
    }
}

/// Finite floats only. `"NaN"` and `"inf"` parse as `f64` but cannot be
/// written back as JSON numbers.
fn parse_finite(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Attendance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub course_code: String,
    pub course_name: Option<String>,
    pub total_classes: u32,
    pub present: u32,
    pub absent: u32,
    pub percentage: f64,
    /// Classes that may still be skipped at the configured target, see
    /// [`AttendanceRecord::affordable_leaves`].
    #[serde(default)]
    pub affordable_leaves: Option<i64>,
}

impl AttendanceRecord {
    /// Columns: `code - name`, total, _, _, present, _, percentage.
    pub fn from_row(row: &[String]) -> Result<Self> {
        let course = cell(row, 0)
            .map(collapse_whitespace)
            .ok_or_else(|| RelayError::data_processing("Attendance row has no course"))?;
        let (course_code, course_name) = match course.split_once(" - ") {
            Some((code, name)) => (code.trim().to_string(), Some(name.trim().to_string())),
            None => (course, None),
        };

        let total_classes = parse_count(cell(row, 1), "total classes")?;
        let present = parse_count(cell(row, 4), "present")?;
        let absent = total_classes.checked_sub(present).ok_or_else(|| {
            RelayError::data_processing(format!(
                "{course_code}: present ({present}) exceeds total ({total_classes})"
            ))
        })?;

        let percentage = cell(row, 6)
            .or_else(|| cell(row, 5))
            .and_then(|raw| parse_finite(raw.trim_end_matches('%')))
            .unwrap_or(0.0);

        Ok(Self {
            course_code,
            course_name,
            total_classes,
            present,
            absent,
            percentage,
            affordable_leaves: None,
        })
    }

    /// Attach the leave budget for `target` percent.
    pub fn with_leave_budget(mut self, target: f64) -> Self {
        self.affordable_leaves = Some(self.affordable_leaves(target));
        self
    }

    /// Classes that can still be skipped while staying at `target` percent.
    ///
    /// Negative values are the number of consecutive classes that must be
    /// attended to climb back above the target.
    pub fn affordable_leaves(&self, target: f64) -> i64 {
        if self.total_classes == 0 {
            return 0;
        }
        let present = f64::from(self.present);
        let total = f64::from(self.total_classes);
        let current = present / total * 100.0;

        if target >= 100.0 {
            return if current >= 100.0 {
                0
            } else {
                -i64::from(self.absent)
            };
        }

        let mut leaves = 0i64;
        let mut extra = 1.0;
        if current < target {
            while (present + extra) / (total + extra) * 100.0 <= target
                && -leaves < MAX_LEAVE_ITERATIONS
            {
                leaves -= 1;
                extra += 1.0;
            }
        } else {
            while present / (total + extra) * 100.0 >= target && leaves < MAX_LEAVE_ITERATIONS {
                leaves += 1;
                extra += 1.0;
            }
        }
        leaves
    }
}

// ---------------------------------------------------------------------------
// Grade summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub semester: String,
    pub gpa: f64,
    pub credits: u32,
    #[serde(default)]
    pub courses: Vec<String>,
}

impl GradeRecord {
    /// Columns: semester, gpa, credits, comma-separated course codes.
    pub fn from_row(row: &[String]) -> Result<Self> {
        let semester = cell(row, 0)
            .ok_or_else(|| RelayError::data_processing("Grade row has no semester"))?
            .to_string();
        let gpa = cell(row, 1)
            .and_then(parse_finite)
            .ok_or_else(|| RelayError::data_processing(format!("{semester}: missing GPA")))?;
        if !(0.0..=10.0).contains(&gpa) {
            return Err(RelayError::data_processing(format!(
                "{semester}: GPA {gpa} out of range"
            )));
        }
        let credits = parse_count(cell(row, 2), "credits")?;
        let courses = cell(row, 3)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            semester,
            gpa,
            credits,
            courses,
        })
    }
}

// ---------------------------------------------------------------------------
// Exam schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamPriority {
    Urgent,
    Soon,
    Upcoming,
}

impl ExamPriority {
    /// Priority of an exam relative to `now`; `None` once the exam is past.
    ///
    /// Dates the portal renders in an unknown format count as upcoming.
    pub fn for_date(raw: &str, now: PrimitiveDateTime) -> Option<Self> {
        let Some(exam_at) = parse_portal_datetime(raw) else {
            return Some(Self::Upcoming);
        };
        let until = exam_at - now;
        if until.is_negative() {
            return None;
        }
        Some(match until.whole_days() {
            0..=3 => Self::Urgent,
            4..=7 => Self::Soon,
            _ => Self::Upcoming,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamRecord {
    pub course_code: String,
    pub course_name: Option<String>,
    pub exam_date: String,
    pub duration: Option<String>,
    pub venue: Option<String>,
    pub priority: Option<ExamPriority>,
}

impl ExamRecord {
    /// Columns: course code, course name, date, duration, venue.
    pub fn from_row(row: &[String], now: PrimitiveDateTime) -> Result<Self> {
        let course_code = cell(row, 0)
            .ok_or_else(|| RelayError::data_processing("Exam row has no course code"))?
            .to_string();
        let exam_date = cell(row, 2).unwrap_or_default().to_string();
        let priority = ExamPriority::for_date(&exam_date, now);

        Ok(Self {
            course_code,
            course_name: cell(row, 1).map(str::to_string),
            exam_date,
            duration: cell(row, 3).map(str::to_string),
            venue: cell(row, 4).map(str::to_string),
            priority,
        })
    }
}

// ---------------------------------------------------------------------------
// Assessments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub course_code: String,
    pub assessment_type: String,
    pub marks_obtained: f64,
    pub total_marks: f64,
    pub percentage: Option<f64>,
}

impl AssessmentRecord {
    /// Columns: course code, assessment type, marks obtained, total marks.
    pub fn from_row(row: &[String]) -> Result<Self> {
        let course_code = cell(row, 0)
            .ok_or_else(|| RelayError::data_processing("Assessment row has no course code"))?
            .to_string();
        let assessment_type = cell(row, 1).unwrap_or("Unknown").to_string();
        let marks_obtained = cell(row, 2).map(parse_mark).unwrap_or(0.0);
        let total_marks = cell(row, 3).map(parse_mark).unwrap_or(100.0);
        let percentage = (total_marks > 0.0)
            .then(|| round2(marks_obtained / total_marks * 100.0))
            .filter(|value| value.is_finite());

        Ok(Self {
            course_code,
            assessment_type,
            marks_obtained,
            total_marks,
            percentage,
        })
    }
}

/// Lenient mark parsing: `"85"`, `"85%"`, `"1,200"`, `"17/20"` (as a
/// percentage) and `"80-85"` (midpoint). Anything else, non-finite values
/// included, is `0.0`.
pub fn parse_mark(raw: &str) -> f64 {
    let cleaned = raw.replace(['%', ','], "");
    let cleaned = cleaned.trim();

    let mark = if let Some((num, den)) = cleaned.split_once('/') {
        match (parse_finite(num), parse_finite(den)) {
            (Some(n), Some(d)) if d != 0.0 => Some(n / d * 100.0),
            _ => None,
        }
    } else if cleaned.matches('-').count() == 1 && !cleaned.starts_with('-') {
        cleaned
            .split_once('-')
            .and_then(|(low, high)| Some((parse_finite(low)? + parse_finite(high)?) / 2.0))
    } else {
        parse_finite(cleaned)
    };
    mark.filter(|value| value.is_finite()).unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    pub roll_number: Option<String>,
    pub is_birthday: bool,
}

impl Profile {
    /// Profile used when the portal yields nothing better: the account id as name.
    pub fn fallback(account: &str) -> Self {
        Self {
            username: account.to_string(),
            roll_number: Some(account.to_string()),
            is_birthday: false,
        }
    }

    /// Cells: display name, _, date of birth (`dd/mm/yyyy`).
    pub fn from_cells(cells: &[String], account: &str, today: Date) -> Self {
        let mut profile = Self::fallback(account);
        if let Some(name) = cell(cells, 0) {
            profile.username = name.to_string();
        }
        if let Some(born) = cell(cells, 2).and_then(parse_day_month_year) {
            profile.is_birthday = born.month() == today.month() && born.day() == today.day();
        }
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn attendance_row_splits_course_and_derives_absent() {
        let record = AttendanceRecord::from_row(&row(&[
            "20XT61   -   Data Mining",
            "40",
            "",
            "",
            "34",
            "",
            "85.00%",
        ]))
        .unwrap();
        assert_eq!(record.course_code, "20XT61");
        assert_eq!(record.course_name.as_deref(), Some("Data Mining"));
        assert_eq!(record.total_classes, 40);
        assert_eq!(record.present, 34);
        assert_eq!(record.absent, 6);
        assert_eq!(record.percentage, 85.0);
    }

    #[test]
    fn attendance_row_rejects_impossible_counts() {
        let err = AttendanceRecord::from_row(&row(&["20XT61", "10", "", "", "12"])).unwrap_err();
        assert!(matches!(err, RelayError::DataProcessing(_)));
        assert!(AttendanceRecord::from_row(&row(&["20XT61", "ten"])).is_err());
    }

    #[test]
    fn non_finite_attendance_percentage_falls_back_to_zero() {
        for raw in ["NaN", "inf", "-infinity%"] {
            let record =
                AttendanceRecord::from_row(&row(&["C1 - New course", "0", "", "", "0", "", raw]))
                    .unwrap();
            assert_eq!(record.percentage, 0.0, "{raw}");

            let json = serde_json::to_string(&record).unwrap();
            let back: AttendanceRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(back, record);
        }
    }

    #[test]
    fn leave_budget_is_attached_on_request() {
        let record = AttendanceRecord::from_row(&row(&["C1", "40", "", "", "40"])).unwrap();
        assert_eq!(record.affordable_leaves, None);
        assert_eq!(record.with_leave_budget(75.0).affordable_leaves, Some(13));
    }

    #[test]
    fn affordable_leaves_both_directions() {
        let full = AttendanceRecord::from_row(&row(&["C1", "40", "", "", "40"])).unwrap();
        assert_eq!(full.affordable_leaves(75.0), 13);

        let borderline = AttendanceRecord::from_row(&row(&["C1", "40", "", "", "30"])).unwrap();
        assert_eq!(borderline.affordable_leaves(75.0), 0);

        let behind = AttendanceRecord::from_row(&row(&["C1", "40", "", "", "20"])).unwrap();
        assert_eq!(behind.affordable_leaves(75.0), -40);

        assert_eq!(behind.affordable_leaves(100.0), -20);
        assert_eq!(full.affordable_leaves(100.0), 0);
    }

    #[test]
    fn grade_row_parses_courses_and_bounds_gpa() {
        let record = GradeRecord::from_row(&row(&["Sem 3", "8.42", "22", "20XT31, 20XT32"])).unwrap();
        assert_eq!(record.courses, vec!["20XT31", "20XT32"]);
        assert_eq!(record.credits, 22);
        assert!(GradeRecord::from_row(&row(&["Sem 3", "11.2", "22"])).is_err());
        assert!(GradeRecord::from_row(&row(&["Sem 3", "NaN", "22"])).is_err());
    }

    #[test]
    fn exam_priority_windows() {
        let now = datetime!(2025-04-01 09:00:00);
        assert_eq!(
            ExamPriority::for_date("2025-04-03", now),
            Some(ExamPriority::Urgent)
        );
        assert_eq!(
            ExamPriority::for_date("07/04/2025 10:00", now),
            Some(ExamPriority::Soon)
        );
        assert_eq!(
            ExamPriority::for_date("2025-05-01", now),
            Some(ExamPriority::Upcoming)
        );
        assert_eq!(ExamPriority::for_date("2025-03-20", now), None);
        assert_eq!(
            ExamPriority::for_date("TBA", now),
            Some(ExamPriority::Upcoming)
        );
    }

    #[test]
    fn exam_row_maps_optional_columns() {
        let now = datetime!(2025-04-01 09:00:00);
        let record =
            ExamRecord::from_row(&row(&["20XT61", "Data Mining", "2025-04-02", "", "J201"]), now)
                .unwrap();
        assert_eq!(record.duration, None);
        assert_eq!(record.venue.as_deref(), Some("J201"));
        assert_eq!(record.priority, Some(ExamPriority::Urgent));
    }

    #[test]
    fn mark_parsing_variants() {
        assert_eq!(parse_mark("42"), 42.0);
        assert_eq!(parse_mark("85%"), 85.0);
        assert_eq!(parse_mark("1,200"), 1200.0);
        assert_eq!(parse_mark("17/20"), 85.0);
        assert_eq!(parse_mark("80-84"), 82.0);
        assert_eq!(parse_mark("AB"), 0.0);
        assert_eq!(parse_mark("NaN"), 0.0);
        assert_eq!(parse_mark("inf"), 0.0);
        assert_eq!(parse_mark("inf/2"), 0.0);
        assert_eq!(parse_mark("1e308-1e308"), 0.0);
    }

    #[test]
    fn assessment_percentage_is_derived() {
        let record = AssessmentRecord::from_row(&row(&["20XT61", "CA1", "33", "50"])).unwrap();
        assert_eq!(record.percentage, Some(66.0));
        let zero = AssessmentRecord::from_row(&row(&["20XT61", "CA1", "33", "0"])).unwrap();
        assert_eq!(zero.percentage, None);
    }

    #[test]
    fn profile_birthday_in_given_date() {
        let cells = row(&["Asha K", "", "01/04/2004"]);
        let profile = Profile::from_cells(&cells, "22z201", date!(2025 - 04 - 01));
        assert_eq!(profile.username, "Asha K");
        assert!(profile.is_birthday);

        let blank = Profile::from_cells(&[], "22z201", date!(2025 - 04 - 01));
        assert_eq!(blank, Profile::fallback("22z201"));
    }
}
