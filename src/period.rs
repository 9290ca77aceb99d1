//! Period selection and the eligibility predicate
//!
//! Resolves an explicit date range, an ISO week, or a calendar month into an
//! inclusive `[start, end]` window (end normalized to 23:59:59.999) and a
//! stable `PeriodKey`. The same `EligibilityFilter` drives both the batch sent
//! to the clustering capability and the coverage reconciliation, so both see
//! exactly one definition of "eligible".

use crate::error::{EngineError, Result};
use crate::types::{
    FeedbackRecord, FeedbackStatus, ProcessStatus, RiskLevel, Scope, TimeWindow,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Feedback statuses that still count as an open issue
pub const OPEN_STATUSES: [FeedbackStatus; 3] = [
    FeedbackStatus::New,
    FeedbackStatus::Confirmed,
    FeedbackStatus::InProgress,
];

/// Risk levels considered for clustering
pub const ELIGIBLE_RISK_LEVELS: [RiskLevel; 2] = [RiskLevel::High, RiskLevel::Medium];

/// Granularity of a numbered period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Week,
    Month,
}

/// Caller's period selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeriodSpec {
    /// Explicit inclusive date range
    Range { start: NaiveDate, end: NaiveDate },
    /// ISO-8601 week of an ISO week-based year
    Week { year: i32, week: u32 },
    /// Calendar month
    Month { year: i32, month: u32 },
    /// Calendar month containing "now"
    #[default]
    CurrentMonth,
}

/// A resolved period: its window and the key its generation is stored under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub window: TimeWindow,
    pub key: PeriodKey,
}

/// Stable identifier of a clustering period
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PeriodKey {
    Week { year: i32, week: u32 },
    Month { year: i32, month: u32 },
    Range { start: NaiveDate, end: NaiveDate },
}

impl PeriodSpec {
    /// Build a spec from a period number and granularity; `year` defaults to
    /// the year of `now`.
    pub fn numbered(
        granularity: Granularity,
        number: u32,
        year: Option<i32>,
        now: DateTime<Utc>,
    ) -> Self {
        let year = year.unwrap_or_else(|| now.year());
        match granularity {
            Granularity::Week => PeriodSpec::Week { year, week: number },
            Granularity::Month => PeriodSpec::Month {
                year,
                month: number,
            },
        }
    }

    /// Resolve to a concrete window and key
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<Period> {
        match *self {
            PeriodSpec::Range { start, end } => {
                if end < start {
                    return Err(EngineError::Validation(format!(
                        "Period end {} is before start {}",
                        end, start
                    )));
                }
                Ok(Period {
                    window: TimeWindow::new(start_of_day(start), end_of_day(end)),
                    key: PeriodKey::Range { start, end },
                })
            }
            PeriodSpec::Week { year, week } => {
                let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
                    .ok_or_else(|| {
                        EngineError::Validation(format!("Invalid ISO week {}-W{:02}", year, week))
                    })?;
                let sunday = monday + Duration::days(6);
                Ok(Period {
                    window: TimeWindow::new(start_of_day(monday), end_of_day(sunday)),
                    key: PeriodKey::Week { year, week },
                })
            }
            PeriodSpec::Month { year, month } => {
                let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
                    EngineError::Validation(format!("Invalid month {}-{:02}", year, month))
                })?;
                let (next_year, next_month) = if month == 12 {
                    (year + 1, 1)
                } else {
                    (year, month + 1)
                };
                let next_first = NaiveDate::from_ymd_opt(next_year, next_month, 1)
                    .ok_or_else(|| {
                        EngineError::Validation(format!("Invalid month {}-{:02}", year, month))
                    })?;
                Ok(Period {
                    window: TimeWindow::new(
                        start_of_day(first),
                        start_of_day(next_first) - Duration::milliseconds(1),
                    ),
                    key: PeriodKey::Month { year, month },
                })
            }
            PeriodSpec::CurrentMonth => PeriodSpec::Month {
                year: now.year(),
                month: now.month(),
            }
            .resolve(now),
        }
    }
}

/// 00:00:00.000 UTC on `date`
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&NaiveDateTime::new(date, NaiveTime::default()))
}

/// 23:59:59.999 UTC on `date`
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    start_of_day(date) + Duration::days(1) - Duration::milliseconds(1)
}

impl PeriodKey {
    pub fn month(year: i32, month: u32) -> Self {
        PeriodKey::Month { year, month }
    }

    pub fn week(year: i32, week: u32) -> Self {
        PeriodKey::Week { year, week }
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeriodKey::Week { year, week } => write!(f, "{}-W{:02}", year, week),
            PeriodKey::Month { year, month } => write!(f, "{}-{:02}", year, month),
            PeriodKey::Range { start, end } => write!(f, "{}..{}", start, end),
        }
    }
}

impl FromStr for PeriodKey {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || EngineError::Validation(format!("Invalid period key: {}", s));

        if let Some((start, end)) = s.split_once("..") {
            let start = NaiveDate::parse_from_str(start, "%Y-%m-%d").map_err(|_| invalid())?;
            let end = NaiveDate::parse_from_str(end, "%Y-%m-%d").map_err(|_| invalid())?;
            return Ok(PeriodKey::Range { start, end });
        }

        if let Some((year, week)) = s.split_once("-W") {
            let year = year.parse::<i32>().map_err(|_| invalid())?;
            let week = week.parse::<u32>().map_err(|_| invalid())?;
            return Ok(PeriodKey::Week { year, week });
        }

        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }
        Ok(PeriodKey::Month { year, month })
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = EngineError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Returns true if `status` is one of [`OPEN_STATUSES`]
pub fn is_open_status(status: FeedbackStatus) -> bool {
    OPEN_STATUSES.contains(&status)
}

/// The eligibility predicate for one (app, scope, window) unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityFilter {
    pub app_id: String,
    pub scope: Scope,
    pub window: TimeWindow,
}

impl EligibilityFilter {
    pub fn new(app_id: impl Into<String>, scope: Scope, window: TimeWindow) -> Self {
        Self {
            app_id: app_id.into(),
            scope,
            window,
        }
    }

    /// In-memory form of the predicate; the SQL adapter mirrors it using the
    /// same constants.
    pub fn matches(&self, record: &FeedbackRecord) -> bool {
        record.app_id == self.app_id
            && record.process_status == ProcessStatus::Analyzed
            && ELIGIBLE_RISK_LEVELS.contains(&record.risk_level)
            && is_open_status(record.status)
            && self.scope.includes(&record.category)
            && self.window.contains(record.created_at)
    }
}
