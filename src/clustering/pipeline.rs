//! Clustering entry points
//!
//! `run_unit` clusters one (app, scope, period) unit and replaces its stored
//! generation; `run_all` does that for every app and configured scope. Each
//! unit run leaves a marker in the run log, whatever its outcome.

use super::orchestrator::{build_batch, request_clusters};
use super::reconciler::reconcile;
use super::{ClusterUnit, ClusteringCapability};
use crate::batch::BatchReport;
use crate::config::ClusteringConfig;
use crate::error::{EngineError, Result};
use crate::period::{EligibilityFilter, PeriodSpec};
use crate::storage::{ClusterStore, FeedbackSource, RunKind, RunLog, RunStatus, UnitRun};
use crate::types::{ReviewGroup, Scope, TimeWindow};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of a successful unit run
#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub unit: ClusterUnit,
    /// Eligible records when the run started
    pub population: usize,
    /// Records actually sent to the capability
    pub submitted: usize,
    pub groups: Vec<ReviewGroup>,
}

pub struct ClusterPipeline {
    feedback: Arc<dyn FeedbackSource>,
    store: Arc<dyn ClusterStore>,
    run_log: Arc<dyn RunLog>,
    capability: Arc<dyn ClusteringCapability>,
    config: ClusteringConfig,
}

impl ClusterPipeline {
    pub fn new(
        feedback: Arc<dyn FeedbackSource>,
        store: Arc<dyn ClusterStore>,
        run_log: Arc<dyn RunLog>,
        capability: Arc<dyn ClusteringCapability>,
        config: ClusteringConfig,
    ) -> Self {
        Self {
            feedback,
            store,
            run_log,
            capability,
            config,
        }
    }

    /// Scopes the batch job covers for every app
    pub fn scopes(&self) -> Result<Vec<Scope>> {
        self.config.scopes.iter().map(|s| s.parse()).collect()
    }

    /// Cluster one unit and replace its generation
    ///
    /// Returns `EngineError::InsufficientData` when the eligible population is
    /// below `min_cluster_size`; the stored generation is left untouched.
    pub async fn run_unit(
        &self,
        app_id: &str,
        scope: &Scope,
        period: &PeriodSpec,
        now: DateTime<Utc>,
    ) -> Result<ClusterOutcome> {
        let period = period.resolve(now)?;
        let unit = ClusterUnit::new(app_id, scope.clone(), period.key);

        info!("Clustering unit {}", unit.key());
        let result = self.cluster_unit(&unit, &period.window, now).await;
        self.mark(&unit, &result, now).await;
        result
    }

    async fn cluster_unit(
        &self,
        unit: &ClusterUnit,
        window: &TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<ClusterOutcome> {
        let filter = EligibilityFilter::new(&unit.app_id, unit.scope.clone(), *window);
        let minimum = self.config.min_cluster_size;

        let population = self.feedback.eligible_ids(&filter).await?.len();
        if population < minimum {
            info!(
                "Skipping {}: {} eligible records, minimum is {}",
                unit.key(),
                population,
                minimum
            );
            return Err(EngineError::InsufficientData {
                count: population,
                minimum,
            });
        }

        let records = self
            .feedback
            .eligible_feedback(&filter, Some(self.config.max_reviews))
            .await?;
        let items = build_batch(&records, self.config.snippet_chars);

        let response = request_clusters(
            self.capability.as_ref(),
            &items,
            minimum,
            self.config.capability_timeout,
        )
        .await?;

        // Eligibility may have shifted during the capability call
        let all_ids = self.feedback.eligible_ids(&filter).await?;
        let groups = reconcile(&all_ids, response.clusters, unit, now);

        self.store
            .replace_period_clusters(&unit.app_id, &unit.scope, &unit.period_key, &groups)
            .await?;

        info!(
            "Clustered {}: {} records into {} groups ({} submitted)",
            unit.key(),
            all_ids.len(),
            groups.len(),
            items.len()
        );

        Ok(ClusterOutcome {
            unit: unit.clone(),
            population,
            submitted: items.len(),
            groups,
        })
    }

    async fn mark(&self, unit: &ClusterUnit, result: &Result<ClusterOutcome>, now: DateTime<Utc>) {
        let (status, observed_count, detail) = match result {
            Ok(outcome) => (
                RunStatus::Success,
                Some(outcome.population),
                Some(format!("{} groups", outcome.groups.len())),
            ),
            Err(EngineError::InsufficientData { count, .. }) => {
                (RunStatus::InsufficientData, Some(*count), None)
            }
            Err(e) => (RunStatus::Failed, None, Some(e.to_string())),
        };

        let run = UnitRun {
            kind: RunKind::Clustering,
            unit_key: unit.key(),
            status,
            observed_count,
            detail,
            ran_at: now,
        };

        if let Err(e) = self.run_log.record_run(&run).await {
            warn!("Failed to record run marker for {}: {}", unit.key(), e);
        }
    }

    /// Cluster every app × configured scope for one period
    ///
    /// Units run sequentially; a failing unit is tallied and the batch moves
    /// on. Errors only when the unit list cannot be built.
    pub async fn run_all(&self, period: &PeriodSpec, now: DateTime<Utc>) -> Result<BatchReport> {
        let resolved = period.resolve(now)?;
        let scopes = self.scopes()?;
        let apps = self.feedback.list_apps().await?;

        info!(
            "Starting clustering batch for {}: {} apps × {} scopes",
            resolved.key,
            apps.len(),
            scopes.len()
        );

        let mut report = BatchReport::new();
        for app_id in &apps {
            for scope in &scopes {
                let unit_key = ClusterUnit::new(app_id, scope.clone(), resolved.key.clone()).key();
                let result = self
                    .run_unit(app_id, scope, period, now)
                    .await
                    .map(|o| format!("{} groups from {} records", o.groups.len(), o.population));

                if let Err(e) = &result {
                    if !matches!(e, EngineError::InsufficientData { .. }) {
                        error!("Clustering unit {} failed: {}", unit_key, e);
                    }
                }
                report.record(unit_key, result);
            }
        }

        info!(
            "Clustering batch finished: {} succeeded, {} skipped, {} failed",
            report.success, report.skipped, report.failed
        );
        Ok(report)
    }
}
