//! Verification config creation and lookup

use crate::config::VerificationSettings;
use crate::error::{EngineError, Result};
use crate::period::{end_of_day, start_of_day};
use crate::storage::{ClusterStore, VerificationStore};
use crate::types::{
    ConfigId, FeedbackId, GroupId, IssueType, VerificationConfig, VerificationStatus,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Issue description shared by quick and advanced creation
#[derive(Debug, Clone, PartialEq)]
pub struct NewIssue {
    pub app_id: String,
    /// One of `category`, `keyword`, `cluster`
    pub issue_type: String,
    /// Category name, keyword, or review group id
    pub issue_value: String,
    pub optimization_desc: String,
    /// Expected drop in percent (0-100)
    pub expected_reduction: Option<f64>,
}

pub struct ConfigManager {
    store: Arc<dyn VerificationStore>,
    clusters: Arc<dyn ClusterStore>,
    settings: VerificationSettings,
}

impl ConfigManager {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        clusters: Arc<dyn ClusterStore>,
        settings: VerificationSettings,
    ) -> Self {
        Self {
            store,
            clusters,
            settings,
        }
    }

    /// Create a config from a go-live date
    ///
    /// Baseline covers the `quick_baseline_days` whole days before `go_live`;
    /// verification starts at `go_live` 00:00 and stays open-ended.
    pub async fn create_quick(
        &self,
        issue: NewIssue,
        go_live: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<VerificationConfig> {
        let days = self.settings.quick_baseline_days;
        let baseline_start = start_of_day(go_live - Duration::days(days));
        let baseline_end = end_of_day(go_live - Duration::days(1));
        let verify_start = start_of_day(go_live);

        self.create_advanced(issue, baseline_start, baseline_end, verify_start, None, now)
            .await
    }

    /// Create a config with explicit windows
    pub async fn create_advanced(
        &self,
        issue: NewIssue,
        baseline_start: DateTime<Utc>,
        baseline_end: DateTime<Utc>,
        verify_start: DateTime<Utc>,
        verify_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<VerificationConfig> {
        let issue_type: IssueType = issue.issue_type.parse()?;
        let issue_value = issue.issue_value.trim().to_string();

        if issue.app_id.trim().is_empty() {
            return Err(EngineError::Validation("App id cannot be empty".to_string()));
        }
        if issue_value.is_empty() {
            return Err(EngineError::Validation("Issue value cannot be empty".to_string()));
        }
        validate_windows(baseline_start, baseline_end, verify_start, verify_end)?;
        if let Some(expected) = issue.expected_reduction {
            if !(0.0..=100.0).contains(&expected) {
                return Err(EngineError::Validation(format!(
                    "Expected reduction must be between 0 and 100, got {}",
                    expected
                )));
            }
        }

        let cluster_snapshot = match issue_type {
            IssueType::Cluster => Some(self.snapshot_group(&issue.app_id, &issue_value).await?),
            IssueType::Category | IssueType::Keyword => None,
        };

        let config = VerificationConfig {
            id: ConfigId::new(),
            app_id: issue.app_id,
            issue_type,
            issue_value,
            cluster_snapshot,
            baseline_start,
            baseline_end,
            verify_start,
            verify_end,
            optimization_desc: issue.optimization_desc,
            expected_reduction: issue.expected_reduction,
            status: VerificationStatus::Monitoring,
            created_at: now,
        };

        self.store.insert_config(&config).await?;
        info!(
            "Created verification config {} ({} '{}') for {}",
            config.id,
            config.issue_type.as_str(),
            config.issue_value,
            config.app_id
        );
        Ok(config)
    }

    async fn snapshot_group(
        &self,
        app_id: &str,
        group_ref: &str,
    ) -> Result<BTreeSet<FeedbackId>> {
        let unknown = || EngineError::Validation(format!("Unknown review group '{}'", group_ref));

        let group_id = GroupId::from_string(group_ref).map_err(|_| unknown())?;
        let group = match self.clusters.get_group(group_id).await {
            Ok(group) => group,
            Err(EngineError::NotFound(_)) => return Err(unknown()),
            Err(e) => return Err(e),
        };

        if group.app_id != app_id {
            return Err(EngineError::Validation(format!(
                "Review group '{}' belongs to app '{}', not '{}'",
                group_ref, group.app_id, app_id
            )));
        }

        Ok(group.review_ids)
    }

    pub async fn get(&self, id: ConfigId) -> Result<VerificationConfig> {
        self.store.get_config(id).await
    }

    pub async fn list(&self, app_id: Option<&str>) -> Result<Vec<VerificationConfig>> {
        self.store.list_configs(app_id).await
    }
}

/// Baseline must be well-formed and end strictly before verification starts
pub fn validate_windows(
    baseline_start: DateTime<Utc>,
    baseline_end: DateTime<Utc>,
    verify_start: DateTime<Utc>,
    verify_end: Option<DateTime<Utc>>,
) -> Result<()> {
    if baseline_start > baseline_end {
        return Err(EngineError::Validation(
            "Baseline start must not be after baseline end".to_string(),
        ));
    }
    if baseline_end >= verify_start {
        return Err(EngineError::Validation(
            "Baseline end must be before verification start".to_string(),
        ));
    }
    if let Some(end) = verify_end {
        if end < verify_start {
            return Err(EngineError::Validation(
                "Verification end must not be before verification start".to_string(),
            ));
        }
    }
    Ok(())
}
