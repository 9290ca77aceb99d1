//! Triage Loop - Feedback Clustering and Fix Verification Engine
//!
//! Closes the loop between user feedback and shipped fixes:
//! - Groups a period's open, high/medium-risk feedback into ranked issues
//! - Guarantees every eligible record lands in exactly one group
//! - Tracks whether an issue's share of feedback dropped after a fix
//! - Summarizes both for dashboards, including why a unit has no groups
//!
//! # Architecture
//!
//! - **Period**: period selection and the single eligibility predicate
//! - **Clustering**: capability call, strict response validation, coverage reconciliation
//! - **Verification**: config windows, ratio comparison and classification
//! - **Storage**: traits plus the libsql backend
//! - **Services**: LLM-backed clustering capability
//!
//! # Example
//!
//! ```ignore
//! use triage_loop_core::{ClusterPipeline, EngineConfig, LibsqlStorage, LlmService, PeriodSpec};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_file("triage.toml".as_ref())?;
//!     let storage = Arc::new(LibsqlStorage::open(&config.database.path, true).await?);
//!     let llm = Arc::new(LlmService::with_default()?);
//!
//!     let pipeline = ClusterPipeline::new(
//!         storage.clone(),
//!         storage.clone(),
//!         storage.clone(),
//!         llm,
//!         config.clustering.clone(),
//!     );
//!     let report = pipeline.run_all(&PeriodSpec::CurrentMonth, chrono::Utc::now()).await?;
//!     println!("{} units clustered", report.success);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod clustering;
pub mod config;
pub mod error;
pub mod period;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod summary;
pub mod types;
pub mod verification;

// Re-export commonly used types
pub use batch::{BatchReport, UnitOutcome, UnitReport};
pub use clustering::{ClusterItem, ClusterOutcome, ClusterPipeline, ClusterUnit, ClusteringCapability};
pub use config::{EngineConfig, ConfigError};
pub use error::{EngineError, Result};
pub use period::{EligibilityFilter, Granularity, Period, PeriodKey, PeriodSpec, OPEN_STATUSES};
pub use scheduler::{ClusteringJob, Scheduler, VerificationJob};
pub use services::{LlmConfig, LlmService};
pub use storage::{
    ClusterStore, FeedbackSource, GroupFilter, IssueCounts, LibsqlStorage, RunKind, RunLog,
    RunStatus, UnitRun, VerificationStore,
};
pub use summary::{ClusterSummary, ClusteringStatus, SummaryAggregator, VerificationSummary};
pub use types::{
    Conclusion, ConfigId, FeedbackId, FeedbackRecord, FeedbackStatus, GroupId, IssueMatch,
    IssueType, ProcessStatus, ProcessingStatus, ResultId, ReviewGroup, RiskLevel, Scope,
    TimeWindow, VerificationConfig, VerificationResult, VerificationStatus,
};
pub use verification::{ConfigManager, NewIssue, VerificationRunner};
