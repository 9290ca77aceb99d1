//! Batch construction and the capability call

use super::schema::{parse_response, ClusteringResponse};
use super::{ClusterItem, ClusteringCapability};
use crate::error::{EngineError, Result};
use crate::types::{FeedbackId, FeedbackRecord};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// First `max_chars` characters of `text`, never splitting a character
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

impl ClusterItem {
    pub fn from_record(record: &FeedbackRecord, snippet_chars: usize) -> Self {
        let text = record
            .translated_content
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&record.content);

        Self {
            id: record.id,
            summary: record.summary.clone(),
            root_cause: record.root_cause.clone(),
            snippet: snippet(text, snippet_chars),
            category: record.category.clone(),
            risk_level: record.risk_level,
        }
    }
}

/// Reduce records to capability items
pub fn build_batch(records: &[FeedbackRecord], snippet_chars: usize) -> Vec<ClusterItem> {
    records
        .iter()
        .map(|r| ClusterItem::from_record(r, snippet_chars))
        .collect()
}

/// Call the capability under `limit` and return its validated reply
pub async fn request_clusters(
    capability: &dyn ClusteringCapability,
    items: &[ClusterItem],
    min_group_size: usize,
    limit: Duration,
) -> Result<ClusteringResponse> {
    debug!(
        "Requesting clusters from {} for {} items",
        capability.name(),
        items.len()
    );

    let reply = match timeout(limit, capability.cluster(items, min_group_size)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(EngineError::ExternalCapability(reason))) => {
            return Err(EngineError::ExternalCapability(reason))
        }
        Ok(Err(e)) => return Err(EngineError::ExternalCapability(e.to_string())),
        Err(_) => {
            warn!("{} timed out after {:?}", capability.name(), limit);
            return Err(EngineError::ExternalCapability(format!(
                "Clustering timed out after {:?}",
                limit
            )));
        }
    };

    let response = parse_response(&reply)?;
    let submitted: BTreeSet<FeedbackId> = items.iter().map(|i| i.id).collect();
    response.validate(&submitted)?;
    Ok(response)
}
