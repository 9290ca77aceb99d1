//! LibSQL storage backend implementation
//!
//! Persists review group generations, verification configs/results and run
//! markers, and serves feedback reads for eligibility and verification
//! counts. Array-valued fields are JSON text columns; that encoding never
//! leaves this module.

use crate::error::{EngineError, Result};
use crate::period::{EligibilityFilter, PeriodKey, ELIGIBLE_RISK_LEVELS, OPEN_STATUSES};
use crate::storage::{
    clustering_unit_key, ClusterStore, FeedbackSource, GroupFilter, IssueCounts, KeyedLocks,
    RunKind, RunLog, UnitRun, VerificationStore,
};
use crate::types::{
    ConfigId, FeedbackId, FeedbackRecord, GroupId, IssueMatch, ProcessStatus, ResultId,
    ReviewGroup, Scope, TimeWindow, VerificationConfig, VerificationResult,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{params, Builder, Connection, Database, TransactionBehavior, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Embedded migrations, applied in order and recorded in `_migrations_applied`
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema.sql",
    include_str!("../../migrations/001_initial_schema.sql"),
)];

const FEEDBACK_COLUMNS: &str = "id, app_id, category, risk_level, status, process_status, \
     created_at, summary, root_cause, content, translated_content";

const GROUP_COLUMNS: &str = "id, app_id, scope, period_key, title, rank, review_count, \
     percentage, review_ids, root_cause_summary, action_suggestion, sample_quotes, \
     processing_status, created_at";

const CONFIG_COLUMNS: &str = "id, app_id, issue_type, issue_value, cluster_snapshot, \
     baseline_start, baseline_end, verify_start, verify_end, optimization_desc, \
     expected_reduction, status, created_at";

const RESULT_COLUMNS: &str = "id, config_id, verify_date, baseline_count, baseline_total, \
     verify_count, verify_total, baseline_ratio, verify_ratio, change_percent, conclusion, summary";

/// LibSQL storage backend
pub struct LibsqlStorage {
    db: Database,
    path: PathBuf,
    write_locks: KeyedLocks,
}

impl LibsqlStorage {
    /// Open a local database file and apply pending migrations
    ///
    /// # Arguments
    /// * `path` - Path to the database file
    /// * `create_if_missing` - If false, a missing file is an error instead of being created
    ///
    /// # Example
    /// ```ignore
    /// let storage = LibsqlStorage::open("triage.db", true).await?;
    /// ```
    pub async fn open(path: impl AsRef<Path>, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!(
            "Opening libsql database: {} (create_if_missing: {})",
            path.display(),
            create_if_missing
        );

        if !path.exists() {
            if !create_if_missing {
                return Err(EngineError::Database(format!(
                    "Database file not found at '{}'. Run 'triage-loop init' first or check database.path.",
                    path.display()
                )));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::Database(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let db = Builder::new_local(&path)
            .build()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        let storage = Self {
            db,
            path,
            write_locks: KeyedLocks::new(),
        };

        let conn = storage.conn().await?;
        conn.query("PRAGMA journal_mode=WAL", ()).await?;
        storage.run_migrations().await?;

        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run embedded migrations that have not been applied yet
    pub async fn run_migrations(&self) -> Result<()> {
        let conn = self.conn().await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations_applied (
                migration_name TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
            (),
        )
        .await?;

        for (name, sql) in MIGRATIONS {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?",
                    params![*name],
                )
                .await?;
            let applied = match rows.next().await? {
                Some(row) => row.get::<i64>(0)? > 0,
                None => false,
            };

            if applied {
                debug!("Skipping already applied migration: {}", name);
                continue;
            }

            conn.execute_batch(sql).await.map_err(|e| {
                EngineError::Database(format!("Failed to apply migration {}: {}", name, e))
            })?;
            conn.execute(
                "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?, ?)",
                params![*name, Utc::now().timestamp()],
            )
            .await?;

            info!("Executed migration: {}", name);
        }

        Ok(())
    }

    /// Get a configured connection from the database
    async fn conn(&self) -> Result<Connection> {
        let conn = self
            .db
            .connect()
            .map_err(|e| EngineError::Database(format!("Failed to get connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ()).await?;
        conn.execute("PRAGMA foreign_keys = ON", ()).await?;
        Ok(conn)
    }

    /// Insert or overwrite feedback records (seeding and tests; production
    /// feedback arrives through the ingestion pipeline)
    pub async fn ingest_feedback(&self, records: &[FeedbackRecord]) -> Result<usize> {
        let conn = self.conn().await?;
        let tx = conn.transaction().await?;

        for record in records {
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO feedback ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    FEEDBACK_COLUMNS
                ),
                params![
                    record.id,
                    record.app_id.clone(),
                    record.category.clone(),
                    record.risk_level.as_str(),
                    record.status.as_str(),
                    record.process_status.as_str(),
                    ts(&record.created_at),
                    record.summary.clone(),
                    record.root_cause.clone(),
                    record.content.clone(),
                    record.translated_content.clone(),
                ],
            )
            .await?;
        }

        tx.commit().await?;
        debug!("Ingested {} feedback records", records.len());
        Ok(records.len())
    }

    async fn query_feedback(&self, clause: &str, values: Vec<Value>) -> Result<Vec<FeedbackRecord>> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {} FROM feedback WHERE {}", FEEDBACK_COLUMNS, clause);
        let mut rows = conn.query(&sql, Params::Positional(values)).await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_feedback(&row)?);
        }
        Ok(records)
    }

    async fn write_generation(
        conn: &Connection,
        app_id: &str,
        scope: &Scope,
        period_key: &PeriodKey,
        groups: &[ReviewGroup],
    ) -> Result<u64> {
        let deleted = conn
            .execute(
                "DELETE FROM review_groups WHERE app_id = ? AND scope = ? AND period_key = ?",
                params![app_id, scope.to_string(), period_key.to_string()],
            )
            .await?;

        for group in groups {
            conn.execute(
                &format!(
                    "INSERT INTO review_groups ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    GROUP_COLUMNS
                ),
                params![
                    group.id.to_string(),
                    group.app_id.clone(),
                    group.scope.to_string(),
                    group.period_key.to_string(),
                    group.title.clone(),
                    group.rank as i64,
                    group.review_count as i64,
                    group.percentage,
                    serde_json::to_string(&group.review_ids)?,
                    group.root_cause_summary.clone(),
                    group.action_suggestion.clone(),
                    serde_json::to_string(&group.sample_quotes)?,
                    group.processing_status.as_str(),
                    ts(&group.created_at),
                ],
            )
            .await?;
        }

        Ok(deleted)
    }

    async fn write_result(conn: &Connection, result: &VerificationResult) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO verification_results ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                RESULT_COLUMNS
            ),
            params![
                result.id.to_string(),
                result.config_id.to_string(),
                ts(&result.verify_date),
                result.baseline_count as i64,
                result.baseline_total as i64,
                result.verify_count as i64,
                result.verify_total as i64,
                result.baseline_ratio,
                result.verify_ratio,
                result.change_percent,
                result.conclusion.as_str(),
                result.summary.clone(),
            ],
        )
        .await?;

        let updated = conn
            .execute(
                "UPDATE verification_configs SET status = ? WHERE id = ?",
                params![result.conclusion.as_str(), result.config_id.to_string()],
            )
            .await?;

        if updated == 0 {
            return Err(EngineError::NotFound(format!(
                "verification config {}",
                result.config_id
            )));
        }
        Ok(())
    }
}

/// Canonical timestamp text; fixed width so SQL string comparison orders correctly
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Database(format!("Invalid timestamp '{}': {}", value, e)))
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn into_persistence(err: EngineError) -> EngineError {
    match err {
        EngineError::Persistence(_) | EngineError::NotFound(_) => err,
        other => EngineError::Persistence(other.to_string()),
    }
}

/// SQL form of [`EligibilityFilter::matches`], built from the same constants
fn eligibility_clause(filter: &EligibilityFilter) -> (String, Vec<Value>) {
    let mut clause = String::from(
        "app_id = ? AND process_status = ? AND created_at >= ? AND created_at <= ?",
    );
    let mut values = vec![
        text(&filter.app_id),
        text(ProcessStatus::Analyzed.as_str()),
        text(&ts(&filter.window.start)),
        text(&ts(&filter.window.end)),
    ];

    clause.push_str(&format!(
        " AND risk_level IN ({})",
        placeholders(ELIGIBLE_RISK_LEVELS.len())
    ));
    values.extend(ELIGIBLE_RISK_LEVELS.iter().map(|r| text(r.as_str())));

    clause.push_str(&format!(" AND status IN ({})", placeholders(OPEN_STATUSES.len())));
    values.extend(OPEN_STATUSES.iter().map(|s| text(s.as_str())));

    if let Scope::Category(category) = &filter.scope {
        clause.push_str(" AND category = ?");
        values.push(text(category));
    }

    (clause, values)
}

/// Text columns a keyword can occur in
const KEYWORD_COLUMNS: [&str; 4] = ["summary", "content", "translated_content", "root_cause"];

/// SQL form of [`IssueMatch::matches`]; `lower()` folds ASCII like the in-memory rule
fn issue_clause(issue: &IssueMatch) -> Result<(String, Vec<Value>)> {
    match issue {
        IssueMatch::Category(category) => Ok(("category = ?".to_string(), vec![text(category)])),
        IssueMatch::Keyword(keyword) => {
            let needle = keyword.to_ascii_lowercase();
            let clause = KEYWORD_COLUMNS
                .iter()
                .map(|column| format!("instr(lower(COALESCE({}, '')), ?) > 0", column))
                .collect::<Vec<_>>()
                .join(" OR ");
            let values = KEYWORD_COLUMNS.iter().map(|_| text(&needle)).collect();
            Ok((format!("({})", clause), values))
        }
        IssueMatch::Members(ids) => Ok((
            "id IN (SELECT value FROM json_each(?))".to_string(),
            vec![Value::Text(serde_json::to_string(ids)?)],
        )),
    }
}

fn row_to_feedback(row: &libsql::Row) -> Result<FeedbackRecord> {
    let risk_level: String = row.get(3)?;
    let status: String = row.get(4)?;
    let process_status: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(FeedbackRecord {
        id: row.get(0)?,
        app_id: row.get(1)?,
        category: row.get(2)?,
        risk_level: risk_level.parse()?,
        status: status.parse()?,
        process_status: process_status.parse()?,
        created_at: parse_ts(&created_at)?,
        summary: row.get(7)?,
        root_cause: row.get(8)?,
        content: row.get(9)?,
        translated_content: row.get(10)?,
    })
}

fn row_to_group(row: &libsql::Row) -> Result<ReviewGroup> {
    let id: String = row.get(0)?;
    let scope: String = row.get(2)?;
    let period_key: String = row.get(3)?;
    let rank: i64 = row.get(5)?;
    let review_count: i64 = row.get(6)?;
    let review_ids: String = row.get(8)?;
    let sample_quotes: String = row.get(11)?;
    let processing_status: String = row.get(12)?;
    let created_at: String = row.get(13)?;

    Ok(ReviewGroup {
        id: GroupId::from_string(&id)
            .map_err(|e| EngineError::Database(format!("Invalid group id '{}': {}", id, e)))?,
        app_id: row.get(1)?,
        scope: scope.parse()?,
        period_key: period_key.parse()?,
        title: row.get(4)?,
        rank: rank as u32,
        review_count: review_count as usize,
        percentage: row.get(7)?,
        review_ids: serde_json::from_str(&review_ids)?,
        root_cause_summary: row.get(9)?,
        action_suggestion: row.get(10)?,
        sample_quotes: serde_json::from_str(&sample_quotes)?,
        processing_status: processing_status.parse()?,
        created_at: parse_ts(&created_at)?,
    })
}

fn row_to_config(row: &libsql::Row) -> Result<VerificationConfig> {
    let id: String = row.get(0)?;
    let issue_type: String = row.get(2)?;
    let cluster_snapshot: Option<String> = row.get(4)?;
    let baseline_start: String = row.get(5)?;
    let baseline_end: String = row.get(6)?;
    let verify_start: String = row.get(7)?;
    let verify_end: Option<String> = row.get(8)?;
    let status: String = row.get(11)?;
    let created_at: String = row.get(12)?;

    Ok(VerificationConfig {
        id: ConfigId::from_string(&id)
            .map_err(|e| EngineError::Database(format!("Invalid config id '{}': {}", id, e)))?,
        app_id: row.get(1)?,
        issue_type: issue_type.parse()?,
        issue_value: row.get(3)?,
        cluster_snapshot: cluster_snapshot
            .map(|s| serde_json::from_str::<BTreeSet<FeedbackId>>(&s))
            .transpose()?,
        baseline_start: parse_ts(&baseline_start)?,
        baseline_end: parse_ts(&baseline_end)?,
        verify_start: parse_ts(&verify_start)?,
        verify_end: verify_end.as_deref().map(parse_ts).transpose()?,
        optimization_desc: row.get(9)?,
        expected_reduction: row.get(10)?,
        status: status.parse()?,
        created_at: parse_ts(&created_at)?,
    })
}

fn row_to_result(row: &libsql::Row) -> Result<VerificationResult> {
    let id: String = row.get(0)?;
    let config_id: String = row.get(1)?;
    let verify_date: String = row.get(2)?;
    let conclusion: String = row.get(10)?;

    Ok(VerificationResult {
        id: ResultId::from_string(&id)
            .map_err(|e| EngineError::Database(format!("Invalid result id '{}': {}", id, e)))?,
        config_id: ConfigId::from_string(&config_id).map_err(|e| {
            EngineError::Database(format!("Invalid config id '{}': {}", config_id, e))
        })?,
        verify_date: parse_ts(&verify_date)?,
        baseline_count: row.get::<i64>(3)? as usize,
        baseline_total: row.get::<i64>(4)? as usize,
        verify_count: row.get::<i64>(5)? as usize,
        verify_total: row.get::<i64>(6)? as usize,
        baseline_ratio: row.get(7)?,
        verify_ratio: row.get(8)?,
        change_percent: row.get(9)?,
        conclusion: conclusion.parse()?,
        summary: row.get(11)?,
    })
}

#[async_trait]
impl FeedbackSource for LibsqlStorage {
    async fn eligible_feedback(
        &self,
        filter: &EligibilityFilter,
        limit: Option<usize>,
    ) -> Result<Vec<FeedbackRecord>> {
        let (mut clause, mut values) = eligibility_clause(filter);
        clause.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = limit {
            clause.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        self.query_feedback(&clause, values).await
    }

    async fn eligible_ids(&self, filter: &EligibilityFilter) -> Result<BTreeSet<FeedbackId>> {
        let (clause, values) = eligibility_clause(filter);
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT id FROM feedback WHERE {}", clause),
                Params::Positional(values),
            )
            .await?;

        let mut ids = BTreeSet::new();
        while let Some(row) = rows.next().await? {
            ids.insert(row.get::<i64>(0)?);
        }
        Ok(ids)
    }

    async fn issue_counts(
        &self,
        app_id: &str,
        window: &TimeWindow,
        issue: &IssueMatch,
    ) -> Result<IssueCounts> {
        let (match_clause, mut values) = issue_clause(issue)?;
        let (eligible, eligible_values) =
            eligibility_clause(&EligibilityFilter::new(app_id, Scope::All, *window));
        values.extend(eligible_values);

        // One statement, so `matching` can never exceed `total`
        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN {} THEN 1 ELSE 0 END), 0) \
             FROM feedback WHERE {}",
            match_clause, eligible
        );
        let conn = self.conn().await?;
        let mut rows = conn.query(&sql, Params::Positional(values)).await?;

        match rows.next().await? {
            Some(row) => Ok(IssueCounts {
                total: row.get::<i64>(0)? as usize,
                matching: row.get::<i64>(1)? as usize,
            }),
            None => Ok(IssueCounts::default()),
        }
    }

    async fn list_apps(&self) -> Result<Vec<String>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT DISTINCT app_id FROM feedback ORDER BY app_id", ())
            .await?;

        let mut apps = Vec::new();
        while let Some(row) = rows.next().await? {
            apps.push(row.get::<String>(0)?);
        }
        Ok(apps)
    }
}

#[async_trait]
impl ClusterStore for LibsqlStorage {
    async fn replace_period_clusters(
        &self,
        app_id: &str,
        scope: &Scope,
        period_key: &PeriodKey,
        groups: &[ReviewGroup],
    ) -> Result<()> {
        if let Some(stray) = groups
            .iter()
            .find(|g| g.app_id != app_id || &g.scope != scope || &g.period_key != period_key)
        {
            return Err(EngineError::Persistence(format!(
                "Group '{}' belongs to {}, not {}",
                stray.title,
                clustering_unit_key(&stray.app_id, &stray.scope, &stray.period_key),
                clustering_unit_key(app_id, scope, period_key)
            )));
        }

        let unit_key = clustering_unit_key(app_id, scope, period_key);
        let _guard = self.write_locks.lock(&unit_key).await;

        let conn = self.conn().await.map_err(into_persistence)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| EngineError::Persistence(format!("Failed to begin transaction: {}", e)))?;

        match Self::write_generation(&tx, app_id, scope, period_key, groups).await {
            Ok(deleted) => {
                tx.commit().await.map_err(|e| {
                    EngineError::Persistence(format!("Transaction commit failed: {}", e))
                })?;
                info!(
                    "Replaced generation {}: {} old groups, {} new groups",
                    unit_key,
                    deleted,
                    groups.len()
                );
                Ok(())
            }
            Err(e) => {
                warn!("Rolling back generation replace for {}: {}", unit_key, e);
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback failed for {}: {}", unit_key, rollback_err);
                }
                Err(into_persistence(e))
            }
        }
    }

    async fn list_groups(&self, filter: &GroupFilter) -> Result<Vec<ReviewGroup>> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if let Some(app_id) = &filter.app_id {
            conditions.push("app_id = ?");
            values.push(text(app_id));
        }
        if let Some(scope) = &filter.scope {
            conditions.push("scope = ?");
            values.push(text(&scope.to_string()));
        }
        if let Some(period_key) = &filter.period_key {
            conditions.push("period_key = ?");
            values.push(text(&period_key.to_string()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM review_groups{} ORDER BY rank ASC, app_id, scope, period_key",
            GROUP_COLUMNS, where_clause
        );

        let conn = self.conn().await?;
        let mut rows = conn.query(&sql, Params::Positional(values)).await?;
        let mut groups = Vec::new();
        while let Some(row) = rows.next().await? {
            groups.push(row_to_group(&row)?);
        }
        Ok(groups)
    }

    async fn get_group(&self, id: GroupId) -> Result<ReviewGroup> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM review_groups WHERE id = ?", GROUP_COLUMNS),
                params![id.to_string()],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("review group {}", id)))?;
        row_to_group(&row)
    }
}

#[async_trait]
impl VerificationStore for LibsqlStorage {
    async fn insert_config(&self, config: &VerificationConfig) -> Result<()> {
        let conn = self.conn().await?;
        let snapshot = config
            .cluster_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            &format!(
                "INSERT INTO verification_configs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                CONFIG_COLUMNS
            ),
            params![
                config.id.to_string(),
                config.app_id.clone(),
                config.issue_type.as_str(),
                config.issue_value.clone(),
                snapshot,
                ts(&config.baseline_start),
                ts(&config.baseline_end),
                ts(&config.verify_start),
                config.verify_end.as_ref().map(ts),
                config.optimization_desc.clone(),
                config.expected_reduction,
                config.status.as_str(),
                ts(&config.created_at),
            ],
        )
        .await
        .map_err(|e| EngineError::Persistence(format!("Failed to insert config: {}", e)))?;

        debug!("Stored verification config {}", config.id);
        Ok(())
    }

    async fn get_config(&self, id: ConfigId) -> Result<VerificationConfig> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM verification_configs WHERE id = ?",
                    CONFIG_COLUMNS
                ),
                params![id.to_string()],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("verification config {}", id)))?;
        row_to_config(&row)
    }

    async fn list_configs(&self, app_id: Option<&str>) -> Result<Vec<VerificationConfig>> {
        let conn = self.conn().await?;
        let mut rows = match app_id {
            Some(app_id) => {
                conn.query(
                    &format!(
                        "SELECT {} FROM verification_configs WHERE app_id = ? ORDER BY created_at, id",
                        CONFIG_COLUMNS
                    ),
                    params![app_id],
                )
                .await?
            }
            None => {
                conn.query(
                    &format!(
                        "SELECT {} FROM verification_configs ORDER BY created_at, id",
                        CONFIG_COLUMNS
                    ),
                    (),
                )
                .await?
            }
        };

        let mut configs = Vec::new();
        while let Some(row) = rows.next().await? {
            configs.push(row_to_config(&row)?);
        }
        Ok(configs)
    }

    async fn append_result(&self, result: &VerificationResult) -> Result<()> {
        let conn = self.conn().await.map_err(into_persistence)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| EngineError::Persistence(format!("Failed to begin transaction: {}", e)))?;

        match Self::write_result(&tx, result).await {
            Ok(()) => {
                tx.commit().await.map_err(|e| {
                    EngineError::Persistence(format!("Transaction commit failed: {}", e))
                })?;
                debug!(
                    "Recorded verification result {} for config {}",
                    result.id, result.config_id
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback failed for result {}: {}", result.id, rollback_err);
                }
                Err(into_persistence(e))
            }
        }
    }

    async fn list_results(&self, config_id: ConfigId) -> Result<Vec<VerificationResult>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM verification_results WHERE config_id = ? \
                     ORDER BY rowid DESC",
                    RESULT_COLUMNS
                ),
                params![config_id.to_string()],
            )
            .await?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            results.push(row_to_result(&row)?);
        }
        Ok(results)
    }
}

#[async_trait]
impl RunLog for LibsqlStorage {
    async fn record_run(&self, run: &UnitRun) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO unit_runs (kind, unit_key, status, observed_count, detail, ran_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                run.kind.as_str(),
                run.unit_key.clone(),
                run.status.as_str(),
                run.observed_count.map(|c| c as i64),
                run.detail.clone(),
                ts(&run.ran_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn latest_run(&self, kind: RunKind, unit_key: &str) -> Result<Option<UnitRun>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT kind, unit_key, status, observed_count, detail, ran_at FROM unit_runs \
                 WHERE kind = ? AND unit_key = ? ORDER BY id DESC LIMIT 1",
                params![kind.as_str(), unit_key],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let kind: String = row.get(0)?;
        let status: String = row.get(2)?;
        let observed_count: Option<i64> = row.get(3)?;
        let ran_at: String = row.get(5)?;

        Ok(Some(UnitRun {
            kind: kind.parse()?,
            unit_key: row.get(1)?,
            status: status.parse()?,
            observed_count: observed_count.map(|c| c as usize),
            detail: row.get(4)?,
            ran_at: parse_ts(&ran_at)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodSpec;
    use crate::storage::RunStatus;
    use crate::types::{
        Conclusion, FeedbackStatus, IssueType, ProcessingStatus, RiskLevel, VerificationStatus,
    };
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    async fn test_storage() -> (LibsqlStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = LibsqlStorage::open(temp_dir.path().join("test.db"), true)
            .await
            .expect("Failed to create test storage");
        (storage, temp_dir)
    }

    fn feedback(id: i64, category: &str, risk: RiskLevel, status: FeedbackStatus) -> FeedbackRecord {
        FeedbackRecord {
            id,
            app_id: "appA".to_string(),
            category: category.to_string(),
            risk_level: risk,
            status,
            process_status: ProcessStatus::Analyzed,
            created_at: Utc.with_ymd_and_hms(2024, 10, 2, 8, 0, 0).unwrap()
                + Duration::minutes(id),
            summary: format!("summary {}", id),
            root_cause: None,
            content: format!("content {}", id),
            translated_content: None,
        }
    }

    fn group(key: &PeriodKey, rank: u32, ids: &[i64]) -> ReviewGroup {
        ReviewGroup {
            id: GroupId::new(),
            app_id: "appA".to_string(),
            scope: Scope::All,
            period_key: key.clone(),
            title: format!("group {}", rank),
            rank,
            review_count: ids.len(),
            percentage: 0.0,
            review_ids: ids.iter().copied().collect(),
            root_cause_summary: "root".to_string(),
            action_suggestion: "act".to_string(),
            sample_quotes: vec!["quote".to_string()],
            processing_status: ProcessingStatus::Clustered,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let (storage, temp_dir) = test_storage().await;
        storage.run_migrations().await.unwrap();
        drop(storage);

        let reopened = LibsqlStorage::open(temp_dir.path().join("test.db"), false).await;
        assert!(reopened.is_ok());
    }

    #[tokio::test]
    async fn test_open_missing_without_create_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = LibsqlStorage::open(temp_dir.path().join("missing.db"), false).await;
        assert!(matches!(result, Err(EngineError::Database(_))));
    }

    #[tokio::test]
    async fn test_sql_eligibility_matches_predicate() {
        let (storage, _temp) = test_storage().await;
        let mut records = vec![
            feedback(1, "Tech_Bug", RiskLevel::High, FeedbackStatus::New),
            feedback(2, "Tech_Bug", RiskLevel::Medium, FeedbackStatus::InProgress),
            feedback(3, "Tech_Bug", RiskLevel::Low, FeedbackStatus::New),
            feedback(4, "Tech_Bug", RiskLevel::High, FeedbackStatus::Resolved),
            feedback(5, "UX", RiskLevel::High, FeedbackStatus::Confirmed),
            feedback(6, "Tech_Bug", RiskLevel::High, FeedbackStatus::New),
        ];
        records[5].process_status = ProcessStatus::Pending;
        let mut late = feedback(7, "Tech_Bug", RiskLevel::High, FeedbackStatus::New);
        late.created_at = Utc.with_ymd_and_hms(2024, 10, 7, 0, 0, 0).unwrap();
        records.push(late);
        storage.ingest_feedback(&records).await.unwrap();

        let window = PeriodSpec::Week { year: 2024, week: 40 }
            .resolve(Utc::now())
            .unwrap()
            .window;

        for scope in [Scope::All, Scope::Category("Tech_Bug".to_string())] {
            let filter = EligibilityFilter::new("appA", scope, window);
            let expected: BTreeSet<i64> = records
                .iter()
                .filter(|r| filter.matches(r))
                .map(|r| r.id)
                .collect();
            assert_eq!(storage.eligible_ids(&filter).await.unwrap(), expected);
        }

        let tech = EligibilityFilter::new("appA", Scope::Category("Tech_Bug".into()), window);
        let ids = storage.eligible_ids(&tech).await.unwrap();
        assert_eq!(ids, BTreeSet::from([1, 2]));

        let limited = storage
            .eligible_feedback(&EligibilityFilter::new("appA", Scope::All, window), Some(2))
            .await
            .unwrap();
        assert_eq!(limited.iter().map(|r| r.id).collect::<Vec<_>>(), vec![5, 2]);
    }

    #[tokio::test]
    async fn test_sql_issue_counts_match_in_memory_rule() {
        let (storage, _temp) = test_storage().await;
        let mut records = vec![
            feedback(1, "Payment", RiskLevel::High, FeedbackStatus::New),
            feedback(2, "Payment", RiskLevel::Low, FeedbackStatus::New),
            feedback(3, "Payment", RiskLevel::Medium, FeedbackStatus::Closed),
            feedback(4, "UX", RiskLevel::Medium, FeedbackStatus::Confirmed),
            feedback(5, "UX", RiskLevel::High, FeedbackStatus::InProgress),
        ];
        records[3].translated_content = Some("Checkout button is GREY".to_string());
        records[4].root_cause = Some("checkout timeout".to_string());
        records[1].summary = "checkout broken".to_string();
        storage.ingest_feedback(&records).await.unwrap();

        let window = PeriodSpec::Week { year: 2024, week: 40 }
            .resolve(Utc::now())
            .unwrap()
            .window;
        let population = EligibilityFilter::new("appA", Scope::All, window);
        let eligible: Vec<&FeedbackRecord> =
            records.iter().filter(|r| population.matches(r)).collect();
        assert_eq!(eligible.len(), 3);

        for issue in [
            IssueMatch::Category("Payment".to_string()),
            IssueMatch::Keyword("CHECKOUT".to_string()),
            IssueMatch::Keyword("grey".to_string()),
            IssueMatch::Members(BTreeSet::from([1, 2, 5, 99])),
            IssueMatch::Members(BTreeSet::new()),
        ] {
            let counts = storage.issue_counts("appA", &window, &issue).await.unwrap();
            let expected = eligible.iter().filter(|r| issue.matches(r)).count();
            assert_eq!(counts.total, 3, "{:?}", issue);
            assert_eq!(counts.matching, expected, "{:?}", issue);
        }

        let keyword = IssueMatch::Keyword("checkout".to_string());
        let counts = storage.issue_counts("appA", &window, &keyword).await.unwrap();
        // Record 2 mentions checkout but is Low risk
        assert_eq!(counts, IssueCounts { matching: 2, total: 3 });

        let other = storage.issue_counts("appB", &window, &keyword).await.unwrap();
        assert_eq!(other, IssueCounts::default());
    }

    #[tokio::test]
    async fn test_replace_period_clusters_replaces_generation() {
        let (storage, _temp) = test_storage().await;
        let key = PeriodKey::week(2024, 40);

        storage
            .replace_period_clusters(
                "appA",
                &Scope::All,
                &key,
                &[group(&key, 1, &[1, 2]), group(&key, 2, &[3])],
            )
            .await
            .unwrap();
        storage
            .replace_period_clusters("appA", &Scope::All, &key, &[group(&key, 1, &[1, 2, 3])])
            .await
            .unwrap();

        let groups = storage
            .list_groups(&GroupFilter::for_key("appA", &Scope::All, &key))
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].review_ids, BTreeSet::from([1, 2, 3]));
        assert_eq!(groups[0].sample_quotes, vec!["quote".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_previous_generation() {
        let (storage, _temp) = test_storage().await;
        let key = PeriodKey::week(2024, 40);
        let original = vec![group(&key, 1, &[1, 2]), group(&key, 2, &[3])];
        storage
            .replace_period_clusters("appA", &Scope::All, &key, &original)
            .await
            .unwrap();

        // Duplicate rank violates UNIQUE(app_id, scope, period_key, rank) mid-transaction
        let broken = vec![group(&key, 1, &[1]), group(&key, 1, &[2, 3])];
        let result = storage
            .replace_period_clusters("appA", &Scope::All, &key, &broken)
            .await;
        assert!(matches!(result, Err(EngineError::Persistence(_))));

        let groups = storage
            .list_groups(&GroupFilter::for_key("appA", &Scope::All, &key))
            .await
            .unwrap();
        assert_eq!(
            groups.iter().map(|g| g.id).collect::<Vec<_>>(),
            original.iter().map(|g| g.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_replace_rejects_group_from_other_key() {
        let (storage, _temp) = test_storage().await;
        let key = PeriodKey::week(2024, 40);
        let other = PeriodKey::week(2024, 41);
        let result = storage
            .replace_period_clusters("appA", &Scope::All, &key, &[group(&other, 1, &[1])])
            .await;
        assert!(matches!(result, Err(EngineError::Persistence(_))));
    }

    fn config(app_id: &str) -> VerificationConfig {
        let go_live = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
        VerificationConfig {
            id: ConfigId::new(),
            app_id: app_id.to_string(),
            issue_type: IssueType::Cluster,
            issue_value: "login crash".to_string(),
            cluster_snapshot: Some(BTreeSet::from([4, 8, 15])),
            baseline_start: go_live - Duration::days(14),
            baseline_end: go_live - Duration::milliseconds(1),
            verify_start: go_live,
            verify_end: None,
            optimization_desc: "Fixed token refresh".to_string(),
            expected_reduction: Some(50.0),
            status: VerificationStatus::Monitoring,
            created_at: Utc::now(),
        }
    }

    fn result_for(config: &VerificationConfig, conclusion: Conclusion, offset_days: i64) -> VerificationResult {
        VerificationResult {
            id: ResultId::new(),
            config_id: config.id,
            verify_date: Utc.with_ymd_and_hms(2024, 10, 20, 0, 0, 0).unwrap()
                + Duration::days(offset_days),
            baseline_count: 50,
            baseline_total: 500,
            verify_count: 20,
            verify_total: 500,
            baseline_ratio: 0.1,
            verify_ratio: 0.04,
            change_percent: -60.0,
            conclusion,
            summary: "summary".to_string(),
        }
    }

    #[tokio::test]
    async fn test_config_roundtrip_preserves_snapshot() {
        let (storage, _temp) = test_storage().await;
        let config = config("appA");
        storage.insert_config(&config).await.unwrap();

        let loaded = storage.get_config(config.id).await.unwrap();
        assert_eq!(loaded.cluster_snapshot, config.cluster_snapshot);
        assert_eq!(loaded.verify_end, None);
        assert_eq!(loaded.status, VerificationStatus::Monitoring);
        assert_eq!(storage.list_configs(Some("appA")).await.unwrap().len(), 1);
        assert!(storage.list_configs(Some("appB")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_windows_rejected_by_schema() {
        let (storage, _temp) = test_storage().await;
        let mut config = config("appA");
        config.baseline_end = config.verify_start;
        assert!(storage.insert_config(&config).await.is_err());
        assert!(storage.list_configs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_result_updates_status_and_orders_history() {
        let (storage, _temp) = test_storage().await;
        let config = config("appA");
        storage.insert_config(&config).await.unwrap();

        storage
            .append_result(&result_for(&config, Conclusion::Improved, 0))
            .await
            .unwrap();
        let latest = result_for(&config, Conclusion::Resolved, 7);
        storage.append_result(&latest).await.unwrap();

        let results = storage.list_results(config.id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, latest.id);
        assert_eq!(
            storage.latest_result(config.id).await.unwrap().unwrap().conclusion,
            Conclusion::Resolved
        );
        assert_eq!(
            storage.get_config(config.id).await.unwrap().status,
            VerificationStatus::Resolved
        );
    }

    #[tokio::test]
    async fn test_latest_result_follows_append_order() {
        let (storage, _temp) = test_storage().await;
        let config = config("appA");
        storage.insert_config(&config).await.unwrap();

        storage
            .append_result(&result_for(&config, Conclusion::NoChange, 2))
            .await
            .unwrap();
        // Backfilled run carrying an earlier verify date
        let backfill = result_for(&config, Conclusion::Resolved, 0);
        storage.append_result(&backfill).await.unwrap();

        let latest = storage.latest_result(config.id).await.unwrap().unwrap();
        assert_eq!(latest.id, backfill.id);
        assert_eq!(
            storage.get_config(config.id).await.unwrap().status,
            VerificationStatus::from(latest.conclusion)
        );
    }

    #[tokio::test]
    async fn test_append_result_for_unknown_config_persists_nothing() {
        let (storage, _temp) = test_storage().await;
        let orphan = config("appA");
        let result = result_for(&orphan, Conclusion::Resolved, 0);
        assert!(storage.append_result(&result).await.is_err());
        assert!(storage.list_results(orphan.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_are_append_only() {
        let (storage, _temp) = test_storage().await;
        let config = config("appA");
        storage.insert_config(&config).await.unwrap();
        storage
            .append_result(&result_for(&config, Conclusion::NoChange, 0))
            .await
            .unwrap();

        let conn = storage.conn().await.unwrap();
        assert!(conn
            .execute("UPDATE verification_results SET summary = 'edited'", ())
            .await
            .is_err());
        assert!(conn.execute("DELETE FROM verification_results", ()).await.is_err());
    }

    #[tokio::test]
    async fn test_run_log_returns_latest_marker() {
        let (storage, _temp) = test_storage().await;
        let key = clustering_unit_key("appA", &Scope::All, &PeriodKey::month(2024, 10));
        assert!(storage
            .latest_run(RunKind::Clustering, &key)
            .await
            .unwrap()
            .is_none());

        for (status, count) in [(RunStatus::Failed, None), (RunStatus::InsufficientData, Some(2))] {
            storage
                .record_run(&UnitRun {
                    kind: RunKind::Clustering,
                    unit_key: key.clone(),
                    status,
                    observed_count: count,
                    detail: None,
                    ran_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let latest = storage
            .latest_run(RunKind::Clustering, &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, RunStatus::InsufficientData);
        assert_eq!(latest.observed_count, Some(2));
    }
}
