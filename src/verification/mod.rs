//! Closed-loop verification
//!
//! A verification config names an issue (category, keyword, or a snapshot
//! of a review group) and a baseline window before a fix shipped. Each run
//! compares the issue's share of feedback after go-live against that
//! baseline and classifies the change.

pub mod config_manager;
pub mod runner;

pub use config_manager::{ConfigManager, NewIssue};
pub use runner::{change_percent, classify, ratio, VerificationRunner};
