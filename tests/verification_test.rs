//! Verification configs and runs against a real libsql database

mod common;

use chrono::Duration;
use common::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_test::assert_ok;
use triage_loop_core::config::VerificationSettings;
use triage_loop_core::period::end_of_day;
use triage_loop_core::{
    ClusterStore, Conclusion, ConfigManager, EngineError, FeedbackRecord, FeedbackStatus,
    GroupFilter, GroupId, IssueType, LibsqlStorage, NewIssue, PeriodKey, PeriodSpec, RiskLevel,
    Scope, SummaryAggregator, VerificationRunner, VerificationStatus, VerificationStore,
};

fn manager(storage: &Arc<LibsqlStorage>) -> ConfigManager {
    ConfigManager::new(
        storage.clone(),
        storage.clone(),
        VerificationSettings::default(),
    )
}

fn runner(storage: &Arc<LibsqlStorage>) -> VerificationRunner {
    VerificationRunner::new(storage.clone(), storage.clone(), storage.clone())
}

fn issue(app_id: &str, issue_type: &str, value: &str) -> NewIssue {
    NewIssue {
        app_id: app_id.to_string(),
        issue_type: issue_type.to_string(),
        issue_value: value.to_string(),
        optimization_desc: "Retry payment callback".to_string(),
        expected_reduction: Some(50.0),
    }
}

/// 500 records before go-live (50 Payment) and 500 after (20 Payment)
async fn seed_payment_history(storage: &LibsqlStorage) {
    let mut records: Vec<FeedbackRecord> = Vec::new();
    for i in 0..500i64 {
        let category = if i < 50 { "Payment" } else { "Other" };
        records.push(feedback_at(
            1 + i,
            "appV",
            category,
            at(2024, 9, 17) + Duration::minutes(i),
        ));
    }
    for i in 0..500i64 {
        let category = if i < 20 { "Payment" } else { "Other" };
        records.push(feedback_at(
            1001 + i,
            "appV",
            category,
            at(2024, 10, 2) + Duration::minutes(i),
        ));
    }
    // After "now": outside the open-ended verification window
    records.push(feedback_at(5000, "appV", "Payment", at(2024, 10, 25)));
    storage.ingest_feedback(&records).await.unwrap();
}

#[tokio::test]
async fn test_quick_config_resolves_after_sixty_percent_drop() {
    let (storage, _temp) = create_test_storage().await;
    seed_payment_history(&storage).await;

    let go_live = at(2024, 10, 1).date_naive();
    let config = assert_ok!(
        manager(&storage)
            .create_quick(issue("appV", "category", "Payment"), go_live, now())
            .await
    );
    assert_eq!(config.baseline_start, at(2024, 9, 17));
    assert_eq!(config.baseline_end, end_of_day(at(2024, 9, 30).date_naive()));
    assert_eq!(config.verify_start, at(2024, 10, 1));
    assert_eq!(config.verify_end, None);
    assert_eq!(config.status, VerificationStatus::Monitoring);

    let result = runner(&storage).run_config(config.id, now()).await.unwrap();
    assert_eq!((result.baseline_count, result.baseline_total), (50, 500));
    assert_eq!((result.verify_count, result.verify_total), (20, 500));
    assert_eq!(result.change_percent, -60.0);
    assert_eq!(result.conclusion, Conclusion::Resolved);
    assert!(result.summary.contains("Expected reduction of 50% met"));

    let stored = storage.get_config(config.id).await.unwrap();
    assert_eq!(stored.status, VerificationStatus::Resolved);
    assert_eq!(
        storage.latest_result(config.id).await.unwrap().unwrap().id,
        result.id
    );
}

#[tokio::test]
async fn test_totals_count_only_eligible_feedback() {
    let (storage, _temp) = create_test_storage().await;
    let mut low = feedback_at(3, "appE", "Payment", at(2024, 9, 22));
    low.risk_level = RiskLevel::Low;
    let mut closed = feedback_at(4, "appE", "Other", at(2024, 9, 23));
    closed.status = FeedbackStatus::Closed;
    let mut resolved = feedback_at(5, "appE", "Payment", at(2024, 9, 24));
    resolved.status = FeedbackStatus::Resolved;
    storage
        .ingest_feedback(&[
            feedback_at(1, "appE", "Payment", at(2024, 9, 20)),
            feedback_at(2, "appE", "Other", at(2024, 9, 21)),
            low,
            closed,
            resolved,
            feedback_at(6, "appE", "Other", at(2024, 10, 3)),
            feedback_at(7, "appE", "Other", at(2024, 10, 4)),
        ])
        .await
        .unwrap();

    let config = manager(&storage)
        .create_quick(
            issue("appE", "category", "Payment"),
            at(2024, 10, 1).date_naive(),
            now(),
        )
        .await
        .unwrap();
    let result = runner(&storage).run_config(config.id, now()).await.unwrap();

    assert_eq!((result.baseline_count, result.baseline_total), (1, 2));
    assert_eq!(result.baseline_ratio, 0.5);
    assert_eq!((result.verify_count, result.verify_total), (0, 2));
    assert_eq!(result.conclusion, Conclusion::Resolved);
}

#[tokio::test]
async fn test_backfilled_run_still_sets_latest_status() {
    let (storage, _temp) = create_test_storage().await;
    let records: Vec<FeedbackRecord> = [
        (1, "Payment", at(2024, 9, 20)),
        (2, "Payment", at(2024, 9, 21)),
        (3, "Other", at(2024, 9, 22)),
        (4, "Other", at(2024, 9, 23)),
        (5, "Payment", at(2024, 10, 2)),
        (6, "Payment", at(2024, 10, 3)),
        (7, "Other", at(2024, 10, 4)),
        (8, "Other", at(2024, 10, 5)),
    ]
    .into_iter()
    .map(|(id, category, created_at)| feedback_at(id, "appB", category, created_at))
    .collect();
    storage.ingest_feedback(&records).await.unwrap();

    let config = manager(&storage)
        .create_quick(
            issue("appB", "category", "Payment"),
            at(2024, 10, 1).date_naive(),
            now(),
        )
        .await
        .unwrap();
    let runner = runner(&storage);

    let later = runner
        .run_config(config.id, now() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(later.conclusion, Conclusion::NoChange);

    let more: Vec<FeedbackRecord> = (9..=14)
        .map(|id| feedback_at(id, "appB", "Other", at(2024, 10, 6)))
        .collect();
    storage.ingest_feedback(&more).await.unwrap();

    // Earlier verify date, appended last
    let backfill = runner.run_config(config.id, now()).await.unwrap();
    assert_eq!(backfill.conclusion, Conclusion::Resolved);

    let stored = storage.get_config(config.id).await.unwrap();
    let latest = storage.latest_result(config.id).await.unwrap().unwrap();
    assert_eq!(latest.id, backfill.id);
    assert_eq!(stored.status, VerificationStatus::from(latest.conclusion));

    let summary = SummaryAggregator::new(
        storage.clone(),
        storage.clone(),
        storage.clone(),
        vec![Scope::All],
    )
    .verification_summary("appB")
    .await
    .unwrap()
    .remove(0);
    assert_eq!(summary.label, summary.latest.unwrap().conclusion.label());
}

#[tokio::test]
async fn test_keyword_issue_matches_any_text_field() {
    let (storage, _temp) = create_test_storage().await;
    let mut baseline = feedback_at(1, "appK", "Other", at(2024, 9, 20));
    baseline.translated_content = Some("The CHECKOUT button does nothing".to_string());
    let quiet = feedback_at(2, "appK", "Other", at(2024, 9, 21));
    let mut after = feedback_at(3, "appK", "Other", at(2024, 10, 3));
    after.root_cause = Some("checkout retries exhausted".to_string());
    let quiet_after = feedback_at(4, "appK", "Other", at(2024, 10, 4));
    storage
        .ingest_feedback(&[baseline, quiet, after, quiet_after])
        .await
        .unwrap();

    let config = manager(&storage)
        .create_quick(
            issue("appK", "keyword", "Checkout"),
            at(2024, 10, 1).date_naive(),
            now(),
        )
        .await
        .unwrap();
    let result = runner(&storage).run_config(config.id, now()).await.unwrap();

    assert_eq!((result.baseline_count, result.baseline_total), (1, 2));
    assert_eq!((result.verify_count, result.verify_total), (1, 2));
    assert_eq!(result.conclusion, Conclusion::NoChange);
}

#[tokio::test]
async fn test_rejected_configs_persist_nothing() {
    let (storage, _temp) = create_test_storage().await;
    let manager = manager(&storage);

    let overlapping = manager
        .create_advanced(
            issue("appV", "category", "Payment"),
            at(2024, 9, 1),
            at(2024, 10, 5),
            at(2024, 10, 1),
            None,
            now(),
        )
        .await;
    assert!(matches!(overlapping, Err(EngineError::Validation(_))));

    let equal_bounds = manager
        .create_advanced(
            issue("appV", "category", "Payment"),
            at(2024, 9, 1),
            at(2024, 10, 1),
            at(2024, 10, 1),
            None,
            now(),
        )
        .await;
    assert!(matches!(equal_bounds, Err(EngineError::Validation(_))));

    for bad in [
        issue("appV", "sentiment", "Payment"),
        issue("appV", "category", "   "),
        NewIssue {
            expected_reduction: Some(150.0),
            ..issue("appV", "category", "Payment")
        },
    ] {
        let result = manager
            .create_quick(bad, at(2024, 10, 1).date_naive(), now())
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    assert!(manager.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cluster_issue_uses_snapshot_after_regeneration() {
    let (storage, _temp) = create_test_storage().await;
    seed(&storage, "appA", 1..=6).await;
    let october = PeriodSpec::Month {
        year: 2024,
        month: 10,
    };
    let filter = GroupFilter::for_key("appA", &Scope::All, &PeriodKey::month(2024, 10));

    let pipeline = pipeline(
        &storage,
        Arc::new(ChunkingCapability::new(3)),
        clustering_config(),
    );
    pipeline
        .run_unit("appA", &Scope::All, &october, now())
        .await
        .unwrap();
    let group = storage.list_groups(&filter).await.unwrap().remove(0);

    let config = manager(&storage)
        .create_advanced(
            issue("appA", "cluster", &group.id.to_string()),
            at(2024, 9, 1),
            end_of_day(at(2024, 9, 30).date_naive()),
            at(2024, 10, 1),
            Some(end_of_day(at(2024, 10, 31).date_naive())),
            now(),
        )
        .await
        .unwrap();
    assert_eq!(config.issue_type, IssueType::Cluster);
    assert_eq!(config.cluster_snapshot, Some(BTreeSet::from([1, 2, 3])));

    // Regenerating replaces the referenced group
    pipeline
        .run_unit("appA", &Scope::All, &october, now())
        .await
        .unwrap();
    assert!(matches!(
        storage.get_group(group.id).await,
        Err(EngineError::NotFound(_))
    ));

    let result = runner(&storage).run_config(config.id, now()).await.unwrap();
    assert_eq!(result.verify_count, 3);
    assert_eq!(result.verify_total, 6);
    // No baseline occurrences but some now: +100%
    assert_eq!(result.change_percent, 100.0);
    assert_eq!(result.conclusion, Conclusion::Worsened);
}

#[tokio::test]
async fn test_cluster_issue_requires_known_group() {
    let (storage, _temp) = create_test_storage().await;
    let manager = manager(&storage);

    for value in [GroupId::new().to_string(), "not-a-group".to_string()] {
        let result = manager
            .create_quick(
                issue("appA", "cluster", &value),
                at(2024, 10, 1).date_naive(),
                now(),
            )
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}

#[tokio::test]
async fn test_empty_windows_yield_no_change() {
    let (storage, _temp) = create_test_storage().await;
    let config = manager(&storage)
        .create_quick(
            issue("appEmpty", "category", "Payment"),
            at(2024, 10, 1).date_naive(),
            now(),
        )
        .await
        .unwrap();

    let result = runner(&storage).run_config(config.id, now()).await.unwrap();
    assert_eq!(result.baseline_ratio, 0.0);
    assert_eq!(result.verify_ratio, 0.0);
    assert_eq!(result.change_percent, 0.0);
    assert_eq!(result.conclusion, Conclusion::NoChange);
}

#[tokio::test]
async fn test_run_all_appends_history_per_config() {
    let (storage, _temp) = create_test_storage().await;
    seed_payment_history(&storage).await;
    let manager = manager(&storage);
    let go_live = at(2024, 10, 1).date_naive();

    let payment = manager
        .create_quick(issue("appV", "category", "Payment"), go_live, now())
        .await
        .unwrap();
    manager
        .create_quick(issue("appV", "category", "Other"), go_live, now())
        .await
        .unwrap();

    let runner = runner(&storage);
    let report = runner.run_all(Some("appV"), now()).await.unwrap();
    assert_eq!((report.success, report.failed), (2, 0));

    runner
        .run_all(None, now() + Duration::days(1))
        .await
        .unwrap();
    let history = storage.list_results(payment.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].verify_date, now() + Duration::days(1));

    let other_app = runner.run_all(Some("appZ"), now()).await.unwrap();
    assert_eq!(other_app.total(), 0);
}

#[tokio::test]
async fn test_unknown_config_is_not_found() {
    let (storage, _temp) = create_test_storage().await;
    let result = runner(&storage)
        .run_config(triage_loop_core::ConfigId::new(), now())
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}
