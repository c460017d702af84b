use crate::error::{RelayError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

/// Wall-clock instant rendered as RFC 3339 in response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub OffsetDateTime);

impl Timestamp {
    pub fn new(datetime: OffsetDateTime) -> Self {
        Self(datetime)
    }

    pub fn inner(&self) -> &OffsetDateTime {
        &self.0
    }

    pub fn unix_timestamp(&self) -> i64 {
        self.0.unix_timestamp()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self.0.format(&Rfc3339).map_err(|_| fmt::Error)?;
        write!(f, "{formatted}")
    }
}

impl FromStr for Timestamp {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let datetime = OffsetDateTime::parse(s, &Rfc3339).map_err(|e| {
            RelayError::data_processing(format!("Failed to parse timestamp '{s}': {e}"))
        })?;
        Ok(Timestamp(datetime))
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted = self.0.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Timestamp::from_str(&s).map_err(serde::de::Error::custom)
    }
}

pub fn now_utc() -> Timestamp {
    Timestamp(OffsetDateTime::now_utc())
}

/// Build a fixed UTC offset from whole minutes, falling back to UTC when out of range.
pub fn offset_from_minutes(minutes: i32) -> UtcOffset {
    UtcOffset::from_whole_seconds(minutes.saturating_mul(60)).unwrap_or(UtcOffset::UTC)
}

/// Current calendar date at the given offset.
pub fn today(offset: UtcOffset) -> Date {
    OffsetDateTime::now_utc().to_offset(offset).date()
}

/// Current wall-clock time at the given offset, without the offset attached.
pub fn now_local(offset: UtcOffset) -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc().to_offset(offset);
    PrimitiveDateTime::new(now.date(), now.time())
}

const DATETIME_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[day]/[month]/[year] [hour]:[minute]"),
    format_description!("[day]-[month]-[year] [hour]:[minute]"),
    format_description!("[year]/[month]/[day] [hour]:[minute]"),
];

const DATE_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day]"),
    format_description!("[day]/[month]/[year]"),
    format_description!("[day]-[month]-[year]"),
    format_description!("[year]/[month]/[day]"),
];

/// Parse the date formats the upstream portal is known to emit.
///
/// Date-only values resolve to midnight. Returns `None` when nothing matches.
pub fn parse_portal_datetime(raw: &str) -> Option<PrimitiveDateTime> {
    let raw = raw.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| PrimitiveDateTime::parse(raw, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| Date::parse(raw, fmt).ok())
                .map(|date| PrimitiveDateTime::new(date, Time::MIDNIGHT))
        })
}

/// Parse a `dd/mm/yyyy` date such as a date of birth.
pub fn parse_day_month_year(raw: &str) -> Option<Date> {
    Date::parse(raw.trim(), format_description!("[day]/[month]/[year]")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn timestamp_round_trips_through_json() {
        let ts = Timestamp(datetime!(2025-03-01 10:15:00 UTC));
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2025-03-01T10:15:00Z\"");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn portal_dates_in_known_formats() {
        assert_eq!(
            parse_portal_datetime("2025-04-10 09:30:00"),
            Some(datetime!(2025-04-10 09:30:00))
        );
        assert_eq!(
            parse_portal_datetime("10/04/2025 14:00"),
            Some(datetime!(2025-04-10 14:00:00))
        );
        assert_eq!(
            parse_portal_datetime(" 10-04-2025 "),
            Some(datetime!(2025-04-10 00:00:00))
        );
        assert_eq!(
            parse_portal_datetime("2025/04/10"),
            Some(datetime!(2025-04-10 00:00:00))
        );
        assert_eq!(parse_portal_datetime("next tuesday"), None);
    }

    #[test]
    fn date_of_birth_parsing() {
        assert_eq!(parse_day_month_year("07/11/2004"), Some(date!(2004-11-07)));
        assert_eq!(parse_day_month_year("2004-11-07"), None);
    }

    #[test]
    fn out_of_range_offset_falls_back_to_utc() {
        assert_eq!(offset_from_minutes(330).whole_minutes(), 330);
        assert_eq!(offset_from_minutes(100_000), UtcOffset::UTC);
    }
}
