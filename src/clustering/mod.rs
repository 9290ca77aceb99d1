//! Issue clustering
//!
//! Turns the eligible feedback of one (app, scope, period) unit into a
//! ranked generation of review groups:
//! - `orchestrator`: builds the bounded batch and calls the capability
//! - `schema`: strict validation of the capability's JSON reply
//! - `reconciler`: normalizes groups and appends the residual group
//! - `pipeline`: single-unit and batch entry points, with run markers

pub mod orchestrator;
pub mod pipeline;
pub mod reconciler;
pub mod schema;

pub use orchestrator::{build_batch, request_clusters, snippet};
pub use pipeline::{ClusterOutcome, ClusterPipeline};
pub use reconciler::{reconcile, RESIDUAL_TITLE};
pub use schema::{parse_response, ClusteringResponse, ProposedGroup};

use crate::error::Result;
use crate::period::PeriodKey;
use crate::storage::clustering_unit_key;
use crate::types::{FeedbackId, RiskLevel, Scope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One feedback record as submitted to the clustering capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterItem {
    pub id: FeedbackId,
    pub summary: String,
    pub root_cause: Option<String>,
    /// Truncated feedback text, translation preferred
    pub snippet: String,
    pub category: String,
    pub risk_level: RiskLevel,
}

/// Semantic grouping of a feedback batch
///
/// Implementations return the raw reply text; the engine parses and
/// validates it before anything is persisted.
#[async_trait]
pub trait ClusteringCapability: Send + Sync {
    /// Capability name (for logging)
    fn name(&self) -> &str;

    async fn cluster(&self, items: &[ClusterItem], min_group_size: usize) -> Result<String>;
}

/// Identity of one clustering unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterUnit {
    pub app_id: String,
    pub scope: Scope,
    pub period_key: PeriodKey,
}

impl ClusterUnit {
    pub fn new(app_id: impl Into<String>, scope: Scope, period_key: PeriodKey) -> Self {
        Self {
            app_id: app_id.into(),
            scope,
            period_key,
        }
    }

    pub fn key(&self) -> String {
        clustering_unit_key(&self.app_id, &self.scope, &self.period_key)
    }
}
