//! Clustering response contract
//!
//! The capability's reply must decode into [`ClusteringResponse`] and pass
//! [`ClusteringResponse::validate`]; anything else is an
//! `EngineError::ExternalCapability` and nothing is persisted.

use crate::error::{EngineError, Result};
use crate::types::FeedbackId;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Maximum number of sample quotes per group
pub const MAX_SAMPLE_QUOTES: usize = 3;

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").expect("Valid fenced block regex")
});

/// Decoded capability reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringResponse {
    pub clusters: Vec<ProposedGroup>,
    /// Records the capability left unassigned (informational; recomputed locally)
    pub uncategorized: u64,
}

/// One group as proposed by the capability, before reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedGroup {
    pub rank: u32,
    pub title: String,
    pub count: u64,
    pub percentage: f64,
    pub review_ids: Vec<FeedbackId>,
    pub root_cause_summary: String,
    pub action_suggestion: String,
    pub sample_quotes: Vec<String>,
}

impl ClusteringResponse {
    /// Reject replies that cannot be trusted as-is
    pub fn validate(&self, submitted: &BTreeSet<FeedbackId>) -> Result<()> {
        for group in &self.clusters {
            if group.title.trim().is_empty() {
                return Err(invalid(format!("group ranked {} has an empty title", group.rank)));
            }

            if group.sample_quotes.len() > MAX_SAMPLE_QUOTES {
                return Err(invalid(format!(
                    "group '{}' has {} sample quotes, at most {} allowed",
                    group.title,
                    group.sample_quotes.len(),
                    MAX_SAMPLE_QUOTES
                )));
            }

            if !group.percentage.is_finite() || group.percentage < 0.0 {
                return Err(invalid(format!(
                    "group '{}' has invalid percentage {}",
                    group.title, group.percentage
                )));
            }

            if let Some(unknown) = group.review_ids.iter().find(|id| !submitted.contains(id)) {
                return Err(invalid(format!(
                    "group '{}' references review {} which was not submitted",
                    group.title, unknown
                )));
            }
        }

        Ok(())
    }
}

fn invalid(reason: String) -> EngineError {
    EngineError::ExternalCapability(format!("Invalid clustering response: {}", reason))
}

/// Locate the JSON object in a reply, tolerating a fenced code block or
/// surrounding prose
pub fn extract_json(reply: &str) -> Option<&str> {
    if let Some(body) = FENCED_JSON.captures(reply).and_then(|c| c.get(1)) {
        return Some(body.as_str());
    }

    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

/// Decode a raw reply; does not validate ids
pub fn parse_response(reply: &str) -> Result<ClusteringResponse> {
    let body = extract_json(reply)
        .ok_or_else(|| invalid("reply contains no JSON object".to_string()))?;

    serde_json::from_str(body).map_err(|e| invalid(e.to_string()))
}
