//! Batch tallies
//!
//! Batch jobs run units one after another; a unit's failure is recorded
//! here and never aborts the batch.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Outcome of one unit within a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Success { detail: String },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit_key: String,
    #[serde(flatten)]
    pub outcome: UnitOutcome,
}

/// Result of a batch run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    pub units: Vec<UnitReport>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally a unit result; `InsufficientData` counts as skipped
    pub fn record(&mut self, unit_key: impl Into<String>, result: Result<String>) {
        let outcome = match result {
            Ok(detail) => {
                self.success += 1;
                UnitOutcome::Success { detail }
            }
            Err(e @ EngineError::InsufficientData { .. }) => {
                self.skipped += 1;
                UnitOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                self.failed += 1;
                UnitOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        self.units.push(UnitReport {
            unit_key: unit_key.into(),
            outcome,
        });
    }

    /// Fold another batch's units into this one
    pub fn merge(&mut self, other: BatchReport) {
        self.success += other.success;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.units.extend(other.units);
    }

    pub fn total(&self) -> usize {
        self.units.len()
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}
