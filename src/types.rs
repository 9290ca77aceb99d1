//! Core data types for the triage loop engine
//!
//! This module defines the feedback records the engine reads, the review
//! groups it produces, and the verification configs/results that track
//! whether a shipped fix changed how often an issue is reported.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

use crate::period::PeriodKey;

/// Identifier of a feedback record in the external feedback store
pub type FeedbackId = i64;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an ID from a string
            pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a review group (cluster)
    GroupId
);
uuid_id!(
    /// Unique identifier for a verification config
    ConfigId
);
uuid_id!(
    /// Unique identifier for a verification result row
    ResultId
);

/// Risk level assigned to feedback during upstream analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::High => "High",
            RiskLevel::Medium => "Medium",
            RiskLevel::Low => "Low",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "High" | "high" => Ok(RiskLevel::High),
            "Medium" | "medium" => Ok(RiskLevel::Medium),
            "Low" | "low" => Ok(RiskLevel::Low),
            other => Err(EngineError::Validation(format!(
                "Unknown risk level: {}",
                other
            ))),
        }
    }
}

/// Workflow status of a feedback record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    New,
    Confirmed,
    InProgress,
    Resolved,
    Closed,
    Ignored,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackStatus::New => "new",
            FeedbackStatus::Confirmed => "confirmed",
            FeedbackStatus::InProgress => "in_progress",
            FeedbackStatus::Resolved => "resolved",
            FeedbackStatus::Closed => "closed",
            FeedbackStatus::Ignored => "ignored",
        }
    }
}

impl FromStr for FeedbackStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(FeedbackStatus::New),
            "confirmed" => Ok(FeedbackStatus::Confirmed),
            "in_progress" => Ok(FeedbackStatus::InProgress),
            "resolved" => Ok(FeedbackStatus::Resolved),
            "closed" => Ok(FeedbackStatus::Closed),
            "ignored" => Ok(FeedbackStatus::Ignored),
            other => Err(EngineError::Validation(format!(
                "Unknown feedback status: {}",
                other
            ))),
        }
    }
}

/// Upstream analysis state of a feedback record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Pending,
    Analyzed,
    Failed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Analyzed => "analyzed",
            ProcessStatus::Failed => "failed",
        }
    }
}

impl FromStr for ProcessStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessStatus::Pending),
            "analyzed" => Ok(ProcessStatus::Analyzed),
            "failed" => Ok(ProcessStatus::Failed),
            other => Err(EngineError::Validation(format!(
                "Unknown process status: {}",
                other
            ))),
        }
    }
}

/// A single piece of user feedback, owned by the feedback store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: FeedbackId,
    pub app_id: String,
    pub category: String,
    pub risk_level: RiskLevel,
    pub status: FeedbackStatus,
    pub process_status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    /// One-line summary produced by upstream analysis
    pub summary: String,
    pub root_cause: Option<String>,
    /// Original text as written by the user
    pub content: String,
    pub translated_content: Option<String>,
}

impl FeedbackRecord {
    /// Text fields searched by keyword issues
    pub fn searchable_text(&self) -> impl Iterator<Item = &str> {
        [
            Some(self.summary.as_str()),
            Some(self.content.as_str()),
            self.translated_content.as_deref(),
            self.root_cause.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}

/// Inclusive time window `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Clustering scope: a single category, or every category
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Scope {
    All,
    Category(String),
}

impl Scope {
    /// Whether feedback in `category` belongs to this scope
    pub fn includes(&self, category: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Category(c) => c == category,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::Category(c) => write!(f, "{}", c),
        }
    }
}

impl FromStr for Scope {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Validation("Scope cannot be empty".to_string()));
        }
        if trimmed.eq_ignore_ascii_case("all") {
            Ok(Scope::All)
        } else {
            Ok(Scope::Category(trimmed.to_string()))
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for Scope {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How a review group came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Produced by the semantic clustering capability
    Clustered,
    /// Synthetic bucket of ids the capability left unassigned
    Residual,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Clustered => "clustered",
            ProcessingStatus::Residual => "residual",
        }
    }
}

impl FromStr for ProcessingStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clustered" => Ok(ProcessingStatus::Clustered),
            "residual" => Ok(ProcessingStatus::Residual),
            other => Err(EngineError::Validation(format!(
                "Unknown processing status: {}",
                other
            ))),
        }
    }
}

/// One representative issue within a clustering generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewGroup {
    pub id: GroupId,
    pub app_id: String,
    pub scope: Scope,
    pub period_key: PeriodKey,
    pub title: String,
    /// 1-based, ascending = more important
    pub rank: u32,
    pub review_count: usize,
    /// Share of the eligible population, in percent
    pub percentage: f64,
    pub review_ids: BTreeSet<FeedbackId>,
    pub root_cause_summary: String,
    pub action_suggestion: String,
    /// At most three representative quotes
    pub sample_quotes: Vec<String>,
    pub processing_status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
}

/// What a verification config tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Category,
    Keyword,
    Cluster,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Category => "category",
            IssueType::Keyword => "keyword",
            IssueType::Cluster => "cluster",
        }
    }
}

impl FromStr for IssueType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "category" => Ok(IssueType::Category),
            "keyword" => Ok(IssueType::Keyword),
            "cluster" => Ok(IssueType::Cluster),
            other => Err(EngineError::Validation(format!(
                "Issue type must be one of category, keyword, cluster (got '{}')",
                other
            ))),
        }
    }
}

/// Outcome of one verification run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Resolved,
    Improved,
    NoChange,
    Worsened,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Resolved => "resolved",
            Conclusion::Improved => "improved",
            Conclusion::NoChange => "no_change",
            Conclusion::Worsened => "worsened",
        }
    }

    /// Human label shown on dashboards
    pub fn label(&self) -> &'static str {
        match self {
            Conclusion::Resolved => "Resolved",
            Conclusion::Improved => "Improved",
            Conclusion::NoChange => "No significant change",
            Conclusion::Worsened => "Worsened",
        }
    }
}

impl FromStr for Conclusion {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resolved" => Ok(Conclusion::Resolved),
            "improved" => Ok(Conclusion::Improved),
            "no_change" => Ok(Conclusion::NoChange),
            "worsened" => Ok(Conclusion::Worsened),
            other => Err(EngineError::Validation(format!(
                "Unknown conclusion: {}",
                other
            ))),
        }
    }
}

/// Current status of a verification config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Created, never run
    Monitoring,
    Resolved,
    Improved,
    NoChange,
    Worsened,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Monitoring => "monitoring",
            VerificationStatus::Resolved => "resolved",
            VerificationStatus::Improved => "improved",
            VerificationStatus::NoChange => "no_change",
            VerificationStatus::Worsened => "worsened",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VerificationStatus::Monitoring => "Monitoring",
            VerificationStatus::Resolved => Conclusion::Resolved.label(),
            VerificationStatus::Improved => Conclusion::Improved.label(),
            VerificationStatus::NoChange => Conclusion::NoChange.label(),
            VerificationStatus::Worsened => Conclusion::Worsened.label(),
        }
    }
}

impl From<Conclusion> for VerificationStatus {
    fn from(conclusion: Conclusion) -> Self {
        match conclusion {
            Conclusion::Resolved => VerificationStatus::Resolved,
            Conclusion::Improved => VerificationStatus::Improved,
            Conclusion::NoChange => VerificationStatus::NoChange,
            Conclusion::Worsened => VerificationStatus::Worsened,
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "monitoring" {
            return Ok(VerificationStatus::Monitoring);
        }
        Conclusion::from_str(s).map(VerificationStatus::from)
    }
}

/// A tracked issue with its baseline and verification windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    pub id: ConfigId,
    pub app_id: String,
    pub issue_type: IssueType,
    pub issue_value: String,
    /// Review ids of the referenced group, captured when the config was created
    pub cluster_snapshot: Option<BTreeSet<FeedbackId>>,
    pub baseline_start: DateTime<Utc>,
    pub baseline_end: DateTime<Utc>,
    pub verify_start: DateTime<Utc>,
    /// `None` means "to date"
    pub verify_end: Option<DateTime<Utc>>,
    pub optimization_desc: String,
    /// Expected drop in percent (0-100)
    pub expected_reduction: Option<f64>,
    pub status: VerificationStatus,
    pub created_at: DateTime<Utc>,
}

impl VerificationConfig {
    pub fn baseline_window(&self) -> TimeWindow {
        TimeWindow::new(self.baseline_start, self.baseline_end)
    }

    /// Verification window with an open end resolved to `now`
    pub fn verify_window(&self, now: DateTime<Utc>) -> TimeWindow {
        TimeWindow::new(self.verify_start, self.verify_end.unwrap_or(now))
    }

    /// What counts as an occurrence of this config's issue
    pub fn issue_match(&self) -> IssueMatch {
        match self.issue_type {
            IssueType::Category => IssueMatch::Category(self.issue_value.clone()),
            IssueType::Keyword => IssueMatch::Keyword(self.issue_value.clone()),
            IssueType::Cluster => {
                IssueMatch::Members(self.cluster_snapshot.clone().unwrap_or_default())
            }
        }
    }
}

/// Occurrence rule of a tracked issue
///
/// Keyword matching folds ASCII case only, the same folding SQLite's
/// `lower()` applies, so the storage adapter can count matches in SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueMatch {
    /// Exact category
    Category(String),
    /// Substring of summary, content, translation or root cause
    Keyword(String),
    /// Membership in a captured id set
    Members(BTreeSet<FeedbackId>),
}

impl IssueMatch {
    pub fn matches(&self, record: &FeedbackRecord) -> bool {
        match self {
            IssueMatch::Category(category) => &record.category == category,
            IssueMatch::Keyword(keyword) => {
                let needle = keyword.to_ascii_lowercase();
                record
                    .searchable_text()
                    .any(|text| text.to_ascii_lowercase().contains(&needle))
            }
            IssueMatch::Members(ids) => ids.contains(&record.id),
        }
    }
}

/// One run of a verification config; append-only history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub id: ResultId,
    pub config_id: ConfigId,
    pub verify_date: DateTime<Utc>,
    pub baseline_count: usize,
    pub baseline_total: usize,
    pub verify_count: usize,
    pub verify_total: usize,
    pub baseline_ratio: f64,
    pub verify_ratio: f64,
    pub change_percent: f64,
    pub conclusion: Conclusion,
    pub summary: String,
}
