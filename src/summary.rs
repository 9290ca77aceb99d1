//! Dashboard read models
//!
//! Aggregates stored generations, verification history and run markers
//! into the views operators look at: top issues per scope for a month,
//! verification status per config, and why a unit has no groups.

use crate::error::Result;
use crate::period::PeriodKey;
use crate::storage::{
    clustering_unit_key, ClusterStore, GroupFilter, RunKind, RunLog, RunStatus,
    VerificationStore,
};
use crate::types::{ReviewGroup, Scope, VerificationConfig, VerificationResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Latest clustering state of one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClusteringStatus {
    NeverRun,
    Succeeded,
    InsufficientData { count: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSummary {
    pub scope: Scope,
    pub status: ClusteringStatus,
    /// Reviews covered by the stored generation
    pub total_reviews: usize,
    pub top_groups: Vec<ReviewGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub app_id: String,
    pub period_key: PeriodKey,
    pub scopes: Vec<ScopeSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub config: VerificationConfig,
    pub latest: Option<VerificationResult>,
    pub label: String,
}

pub struct SummaryAggregator {
    clusters: Arc<dyn ClusterStore>,
    verification: Arc<dyn VerificationStore>,
    run_log: Arc<dyn RunLog>,
    /// Scopes always reported, even with no stored generation
    scopes: Vec<Scope>,
}

impl SummaryAggregator {
    pub fn new(
        clusters: Arc<dyn ClusterStore>,
        verification: Arc<dyn VerificationStore>,
        run_log: Arc<dyn RunLog>,
        scopes: Vec<Scope>,
    ) -> Self {
        Self {
            clusters,
            verification,
            run_log,
            scopes,
        }
    }

    /// Top `top_k` groups per scope for an app's calendar month
    pub async fn cluster_summary(
        &self,
        app_id: &str,
        year: i32,
        month: u32,
        top_k: usize,
    ) -> Result<ClusterSummary> {
        let period_key = PeriodKey::month(year, month);
        let groups = self
            .clusters
            .list_groups(&GroupFilter {
                app_id: Some(app_id.to_string()),
                scope: None,
                period_key: Some(period_key.clone()),
            })
            .await?;

        let mut by_scope: BTreeMap<Scope, Vec<ReviewGroup>> = self
            .scopes
            .iter()
            .map(|s| (s.clone(), Vec::new()))
            .collect();
        for group in groups {
            by_scope.entry(group.scope.clone()).or_default().push(group);
        }

        let mut scopes = Vec::with_capacity(by_scope.len());
        for (scope, mut groups) in by_scope {
            groups.sort_by_key(|g| g.rank);
            let total_reviews = groups.iter().map(|g| g.review_count).sum();
            groups.truncate(top_k);
            let status = self.clustering_status(app_id, &scope, &period_key).await?;

            scopes.push(ScopeSummary {
                scope,
                status,
                total_reviews,
                top_groups: groups,
            });
        }

        Ok(ClusterSummary {
            app_id: app_id.to_string(),
            period_key,
            scopes,
        })
    }

    /// Latest run outcome of a clustering unit
    pub async fn clustering_status(
        &self,
        app_id: &str,
        scope: &Scope,
        period_key: &PeriodKey,
    ) -> Result<ClusteringStatus> {
        let key = clustering_unit_key(app_id, scope, period_key);
        let status = match self.run_log.latest_run(RunKind::Clustering, &key).await? {
            None => ClusteringStatus::NeverRun,
            Some(run) => match run.status {
                RunStatus::Success => ClusteringStatus::Succeeded,
                RunStatus::InsufficientData => ClusteringStatus::InsufficientData {
                    count: run.observed_count.unwrap_or(0),
                },
                RunStatus::Failed => ClusteringStatus::Failed {
                    reason: run.detail.unwrap_or_default(),
                },
            },
        };
        Ok(status)
    }

    /// Every config of an app with its latest result and status label
    pub async fn verification_summary(&self, app_id: &str) -> Result<Vec<VerificationSummary>> {
        let configs = self.verification.list_configs(Some(app_id)).await?;

        let mut summaries = Vec::with_capacity(configs.len());
        for config in configs {
            let latest = self.verification.latest_result(config.id).await?;
            let label = config.status.label().to_string();
            summaries.push(VerificationSummary {
                config,
                latest,
                label,
            });
        }
        Ok(summaries)
    }
}
