//! Verification runs
//!
//! Counts the tracked issue in the baseline and verification windows,
//! compares its share of the eligible feedback, classifies the change, and
//! appends the result. Appending also moves the config's status to the new
//! conclusion in the same transaction.

use crate::batch::BatchReport;
use crate::clustering::reconciler::round2;
use crate::error::Result;
use crate::storage::{
    FeedbackSource, IssueCounts, RunKind, RunLog, RunStatus, UnitRun, VerificationStore,
};
use crate::types::{
    Conclusion, ConfigId, ResultId, TimeWindow, VerificationConfig, VerificationResult,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// `count / total`, or 0 when `total` is 0
pub fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

/// Float noise tolerated at the classification boundaries
const BOUNDARY_EPSILON: f64 = 1e-9;

/// Relative change of the verification ratio against the baseline, in percent
///
/// With a zero baseline the change is 0 when the issue is still absent and
/// +100 as soon as it appears.
pub fn change_percent(baseline_ratio: f64, verify_ratio: f64) -> f64 {
    if baseline_ratio > 0.0 {
        (verify_ratio - baseline_ratio) / baseline_ratio * 100.0
    } else if verify_ratio == 0.0 {
        0.0
    } else {
        100.0
    }
}

/// ≤ −50 resolved, (−50, −20] improved, (−20, 20) no change, ≥ 20 worsened
///
/// Takes the unrounded change; only float noise at a boundary is absorbed.
pub fn classify(change_percent: f64) -> Conclusion {
    if change_percent <= -50.0 + BOUNDARY_EPSILON {
        Conclusion::Resolved
    } else if change_percent <= -20.0 + BOUNDARY_EPSILON {
        Conclusion::Improved
    } else if change_percent < 20.0 - BOUNDARY_EPSILON {
        Conclusion::NoChange
    } else {
        Conclusion::Worsened
    }
}

fn summarize(config: &VerificationConfig, result: &VerificationResult) -> String {
    let mut summary = format!(
        "Baseline: {}/{} ({:.2}%); verification: {}/{} ({:.2}%); change {:+.2}%. Conclusion: {}.",
        result.baseline_count,
        result.baseline_total,
        result.baseline_ratio * 100.0,
        result.verify_count,
        result.verify_total,
        result.verify_ratio * 100.0,
        result.change_percent,
        result.conclusion.label()
    );

    if let Some(expected) = config.expected_reduction {
        let met = -result.change_percent >= expected;
        summary.push_str(&format!(
            " Expected reduction of {}% {}.",
            expected,
            if met { "met" } else { "not met" }
        ));
    }

    summary
}

pub struct VerificationRunner {
    feedback: Arc<dyn FeedbackSource>,
    store: Arc<dyn VerificationStore>,
    run_log: Arc<dyn RunLog>,
}

impl VerificationRunner {
    pub fn new(
        feedback: Arc<dyn FeedbackSource>,
        store: Arc<dyn VerificationStore>,
        run_log: Arc<dyn RunLog>,
    ) -> Self {
        Self {
            feedback,
            store,
            run_log,
        }
    }

    /// Run one config and append its result
    pub async fn run_config(&self, id: ConfigId, now: DateTime<Utc>) -> Result<VerificationResult> {
        let config = self.store.get_config(id).await?;
        self.run_loaded(&config, now).await
    }

    async fn run_loaded(
        &self,
        config: &VerificationConfig,
        now: DateTime<Utc>,
    ) -> Result<VerificationResult> {
        debug!("Verifying config {}", config.id);
        let result = self.verify(config, now).await;
        self.mark(config.id, &result, now).await;
        result
    }

    async fn count_issue(
        &self,
        config: &VerificationConfig,
        window: &TimeWindow,
    ) -> Result<IssueCounts> {
        self.feedback
            .issue_counts(&config.app_id, window, &config.issue_match())
            .await
    }

    async fn verify(
        &self,
        config: &VerificationConfig,
        now: DateTime<Utc>,
    ) -> Result<VerificationResult> {
        let baseline = self.count_issue(config, &config.baseline_window()).await?;
        let verification = self.count_issue(config, &config.verify_window(now)).await?;

        let baseline_ratio = ratio(baseline.matching, baseline.total);
        let verify_ratio = ratio(verification.matching, verification.total);
        let raw_change = change_percent(baseline_ratio, verify_ratio);
        let conclusion = classify(raw_change);
        let change = round2(raw_change);

        let mut result = VerificationResult {
            id: ResultId::new(),
            config_id: config.id,
            verify_date: now,
            baseline_count: baseline.matching,
            baseline_total: baseline.total,
            verify_count: verification.matching,
            verify_total: verification.total,
            baseline_ratio,
            verify_ratio,
            change_percent: change,
            conclusion,
            summary: String::new(),
        };
        result.summary = summarize(config, &result);

        self.store.append_result(&result).await?;
        info!(
            "Verified config {}: {:+.2}% ({})",
            config.id,
            change,
            conclusion.as_str()
        );
        Ok(result)
    }

    async fn mark(&self, id: ConfigId, result: &Result<VerificationResult>, now: DateTime<Utc>) {
        let run = match result {
            Ok(r) => UnitRun {
                kind: RunKind::Verification,
                unit_key: id.to_string(),
                status: RunStatus::Success,
                observed_count: Some(r.verify_total),
                detail: Some(r.conclusion.as_str().to_string()),
                ran_at: now,
            },
            Err(e) => UnitRun {
                kind: RunKind::Verification,
                unit_key: id.to_string(),
                status: RunStatus::Failed,
                observed_count: None,
                detail: Some(e.to_string()),
                ran_at: now,
            },
        };

        if let Err(e) = self.run_log.record_run(&run).await {
            warn!("Failed to record run marker for config {}: {}", id, e);
        }
    }

    /// Run every config (optionally for one app), oldest first
    pub async fn run_all(&self, app_id: Option<&str>, now: DateTime<Utc>) -> Result<BatchReport> {
        let configs = self.store.list_configs(app_id).await?;
        info!("Starting verification batch: {} configs", configs.len());

        let mut report = BatchReport::new();
        for config in &configs {
            let result = self
                .run_loaded(config, now)
                .await
                .map(|r| r.conclusion.as_str().to_string());

            if let Err(e) = &result {
                error!("Verification of config {} failed: {}", config.id, e);
            }
            report.record(config.id.to_string(), result);
        }

        info!(
            "Verification batch finished: {} succeeded, {} failed",
            report.success, report.failed
        );
        Ok(report)
    }
}
