//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use triage_loop_core::config::ClusteringConfig;
use triage_loop_core::{
    ClusterItem, ClusterPipeline, ClusteringCapability, EngineError, FeedbackRecord,
    FeedbackStatus, LibsqlStorage, ProcessStatus, Result, RiskLevel,
};

/// Create an on-disk LibSQL storage in a temp dir
///
/// Keep the returned `TempDir` alive for the duration of the test.
pub async fn create_test_storage() -> (Arc<LibsqlStorage>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let storage = LibsqlStorage::open(temp_dir.path().join("triage_test.db"), true)
        .await
        .expect("Failed to create test storage");
    (Arc::new(storage), temp_dir)
}

/// Fixed "now" used across tests: 2024-10-20 12:00 UTC
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 20, 12, 0, 0).unwrap()
}

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

/// An eligible (analyzed, High, New) record created in early October 2024
pub fn feedback(id: i64, app_id: &str, category: &str) -> FeedbackRecord {
    FeedbackRecord {
        id,
        app_id: app_id.to_string(),
        category: category.to_string(),
        risk_level: RiskLevel::High,
        status: FeedbackStatus::New,
        process_status: ProcessStatus::Analyzed,
        created_at: at(2024, 10, 2) + Duration::minutes(id),
        summary: format!("Issue report {}", id),
        root_cause: Some("unknown".to_string()),
        content: format!("Something broke ({})", id),
        translated_content: None,
    }
}

pub fn feedback_at(id: i64, app_id: &str, category: &str, created_at: DateTime<Utc>) -> FeedbackRecord {
    FeedbackRecord {
        created_at,
        ..feedback(id, app_id, category)
    }
}

/// Seed `ids` as eligible feedback for `app_id`
pub async fn seed(storage: &LibsqlStorage, app_id: &str, ids: impl IntoIterator<Item = i64>) {
    let records: Vec<FeedbackRecord> = ids
        .into_iter()
        .map(|id| feedback(id, app_id, "Tech_Bug"))
        .collect();
    storage.ingest_feedback(&records).await.unwrap();
}

/// A well-formed capability reply with the given groups, ranked in order
pub fn reply(groups: &[(&str, Vec<i64>)]) -> String {
    let clusters: Vec<serde_json::Value> = groups
        .iter()
        .enumerate()
        .map(|(i, (title, ids))| {
            json!({
                "rank": i + 1,
                "title": title,
                "count": ids.len(),
                "percentage": 0.0,
                "reviewIds": ids,
                "rootCauseSummary": format!("{} root cause", title),
                "actionSuggestion": format!("fix {}", title),
                "sampleQuotes": ["it broke"]
            })
        })
        .collect();

    json!({ "clusters": clusters, "uncategorized": 0 }).to_string()
}

/// Returns the same reply on every call and remembers batch sizes
pub struct FixedCapability {
    reply: String,
    pub batch_sizes: Mutex<Vec<usize>>,
}

impl FixedCapability {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ClusteringCapability for FixedCapability {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn cluster(&self, items: &[ClusterItem], _min_group_size: usize) -> Result<String> {
        self.batch_sizes.lock().unwrap().push(items.len());
        Ok(self.reply.clone())
    }
}

/// Groups submitted ids (ascending) into chunks of `chunk`, leaving a
/// trailing partial chunk unassigned; optionally fails on one call (1-based)
pub struct ChunkingCapability {
    chunk: usize,
    fail_on_call: Option<usize>,
    calls: AtomicUsize,
}

impl ChunkingCapability {
    pub fn new(chunk: usize) -> Self {
        Self {
            chunk,
            fail_on_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on_call(chunk: usize, call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new(chunk)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusteringCapability for ChunkingCapability {
    fn name(&self) -> &str {
        "chunking"
    }

    async fn cluster(&self, items: &[ClusterItem], _min_group_size: usize) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(EngineError::ExternalCapability(format!(
                "upstream unavailable on call {}",
                call
            )));
        }

        let mut ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        ids.sort_unstable();
        let groups: Vec<(String, Vec<i64>)> = ids
            .chunks(self.chunk)
            .filter(|c| c.len() == self.chunk)
            .enumerate()
            .map(|(i, c)| (format!("issue {}", i + 1), c.to_vec()))
            .collect();
        let borrowed: Vec<(&str, Vec<i64>)> = groups
            .iter()
            .map(|(t, ids)| (t.as_str(), ids.clone()))
            .collect();
        Ok(reply(&borrowed))
    }
}

pub fn clustering_config() -> ClusteringConfig {
    ClusteringConfig {
        scopes: vec!["all".to_string()],
        ..ClusteringConfig::default()
    }
}

pub fn pipeline(
    storage: &Arc<LibsqlStorage>,
    capability: Arc<dyn ClusteringCapability>,
    config: ClusteringConfig,
) -> ClusterPipeline {
    ClusterPipeline::new(
        storage.clone(),
        storage.clone(),
        storage.clone(),
        capability,
        config,
    )
}
