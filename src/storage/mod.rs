//! Storage layer for the triage loop engine
//!
//! Provides the traits the engine depends on (feedback reads, cluster
//! generations, verification history, run markers) and the libsql backend
//! implementing all of them.

pub mod libsql;
pub mod locks;

use crate::error::Result;
use crate::period::{EligibilityFilter, PeriodKey};
use crate::types::{
    ConfigId, FeedbackId, FeedbackRecord, GroupId, IssueMatch, ReviewGroup, Scope, TimeWindow,
    VerificationConfig, VerificationResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

pub use self::libsql::LibsqlStorage;
pub use locks::KeyedLocks;

/// Read access to the external feedback store
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    /// Eligible records for a unit, newest first, optionally bounded
    async fn eligible_feedback(
        &self,
        filter: &EligibilityFilter,
        limit: Option<usize>,
    ) -> Result<Vec<FeedbackRecord>>;

    /// The complete eligible id set for a unit (never bounded)
    async fn eligible_ids(&self, filter: &EligibilityFilter) -> Result<BTreeSet<FeedbackId>>;

    /// Eligible records of an app in a window (every category) and how many
    /// of them match `issue`, read in a single statement
    async fn issue_counts(
        &self,
        app_id: &str,
        window: &TimeWindow,
        issue: &IssueMatch,
    ) -> Result<IssueCounts>;

    /// Every app with at least one feedback record
    async fn list_apps(&self) -> Result<Vec<String>>;
}

/// Issue occurrences within one window's eligible population
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueCounts {
    pub matching: usize,
    pub total: usize,
}

/// Filter for reading review groups; `None` fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupFilter {
    pub app_id: Option<String>,
    pub scope: Option<Scope>,
    pub period_key: Option<PeriodKey>,
}

impl GroupFilter {
    pub fn for_key(app_id: &str, scope: &Scope, period_key: &PeriodKey) -> Self {
        Self {
            app_id: Some(app_id.to_string()),
            scope: Some(scope.clone()),
            period_key: Some(period_key.clone()),
        }
    }
}

/// Persistence of clustering generations
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Atomically replace the generation stored for `(app_id, scope, period_key)`.
    ///
    /// The previous generation is deleted and `groups` inserted in a single
    /// transaction. On failure the transaction is rolled back, the previous
    /// generation stays intact, and `EngineError::Persistence` is returned.
    async fn replace_period_clusters(
        &self,
        app_id: &str,
        scope: &Scope,
        period_key: &PeriodKey,
        groups: &[ReviewGroup],
    ) -> Result<()>;

    /// Groups matching the filter, ordered by rank ascending
    async fn list_groups(&self, filter: &GroupFilter) -> Result<Vec<ReviewGroup>>;

    async fn get_group(&self, id: GroupId) -> Result<ReviewGroup>;
}

/// Persistence of verification configs and their append-only results
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn insert_config(&self, config: &VerificationConfig) -> Result<()>;

    async fn get_config(&self, id: ConfigId) -> Result<VerificationConfig>;

    /// Configs ordered by creation time
    async fn list_configs(&self, app_id: Option<&str>) -> Result<Vec<VerificationConfig>>;

    /// Append a result and set the config's status to its conclusion, atomically
    async fn append_result(&self, result: &VerificationResult) -> Result<()>;

    /// Results for a config, most recently appended first
    async fn list_results(&self, config_id: ConfigId) -> Result<Vec<VerificationResult>>;

    /// The most recently appended result, whose conclusion is the config's status
    async fn latest_result(&self, config_id: ConfigId) -> Result<Option<VerificationResult>> {
        Ok(self.list_results(config_id).await?.into_iter().next())
    }
}

/// Kind of unit a run marker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Clustering,
    Verification,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Clustering => "clustering",
            RunKind::Verification => "verification",
        }
    }
}

impl FromStr for RunKind {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "clustering" => Ok(RunKind::Clustering),
            "verification" => Ok(RunKind::Verification),
            other => Err(crate::error::EngineError::Database(format!(
                "Unknown run kind: {}",
                other
            ))),
        }
    }
}

/// Terminal state of one unit run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    InsufficientData,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::InsufficientData => "insufficient_data",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "insufficient_data" => Ok(RunStatus::InsufficientData),
            "failed" => Ok(RunStatus::Failed),
            other => Err(crate::error::EngineError::Database(format!(
                "Unknown run status: {}",
                other
            ))),
        }
    }
}

/// Persisted marker of a unit run, so "never run", "skipped" and "failed"
/// stay distinguishable after the fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRun {
    pub kind: RunKind,
    pub unit_key: String,
    pub status: RunStatus,
    /// Eligible population, when known
    pub observed_count: Option<usize>,
    /// Failure reason or short result note
    pub detail: Option<String>,
    pub ran_at: DateTime<Utc>,
}

/// Append-only log of unit runs
#[async_trait]
pub trait RunLog: Send + Sync {
    async fn record_run(&self, run: &UnitRun) -> Result<()>;

    async fn latest_run(&self, kind: RunKind, unit_key: &str) -> Result<Option<UnitRun>>;
}

/// Unit key of a clustering run
pub fn clustering_unit_key(app_id: &str, scope: &Scope, period_key: &PeriodKey) -> String {
    format!("{}|{}|{}", app_id, scope, period_key)
}
