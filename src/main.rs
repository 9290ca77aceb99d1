//! Triage Loop - operator CLI
//!
//! Runs clustering and verification units or batches against the configured
//! database, creates verification configs, prints summaries, and hosts the
//! background scheduler.

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::{self, EnvFilter};
use triage_loop_core::{
    period::{end_of_day, start_of_day},
    scheduler::JobConfig,
    ClusterPipeline, ClusteringJob, ConfigId, ConfigManager, EngineConfig, FeedbackRecord,
    Granularity, LibsqlStorage, LlmConfig, LlmService, NewIssue, PeriodSpec, Scheduler, Scope,
    SummaryAggregator, VerificationJob, VerificationRunner,
};

/// Get the default config path using the platform config directory
fn get_default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("triage-loop")
        .join("config.toml")
}

#[derive(Parser)]
#[command(name = "triage-loop")]
#[command(about = "Feedback clustering and fix verification engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Config file (defaults to <config dir>/triage-loop/config.toml when present)
    #[arg(long, env = "TRIAGE_LOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Database path (overrides database.path from the config file)
    #[arg(long, env = "TRIAGE_LOOP_DB_PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
struct PeriodArgs {
    /// ISO week number
    #[arg(long, conflicts_with_all = ["month", "from"])]
    week: Option<u32>,

    /// Calendar month number (1-12)
    #[arg(long, conflicts_with = "from")]
    month: Option<u32>,

    /// Year for --week/--month (defaults to the current year)
    #[arg(long)]
    year: Option<i32>,

    /// Range start (YYYY-MM-DD)
    #[arg(long, requires = "to")]
    from: Option<NaiveDate>,

    /// Range end, inclusive (YYYY-MM-DD)
    #[arg(long, requires = "from")]
    to: Option<NaiveDate>,
}

impl PeriodArgs {
    fn spec(&self, now: DateTime<Utc>) -> PeriodSpec {
        match (self.week, self.month, self.from, self.to) {
            (Some(week), _, _, _) => PeriodSpec::numbered(Granularity::Week, week, self.year, now),
            (_, Some(month), _, _) => {
                PeriodSpec::numbered(Granularity::Month, month, self.year, now)
            }
            (_, _, Some(start), Some(end)) => PeriodSpec::Range { start, end },
            _ => PeriodSpec::CurrentMonth,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct IssueArgs {
    /// App the issue belongs to
    #[arg(long)]
    app: String,

    /// Issue type: category, keyword or cluster
    #[arg(long)]
    issue_type: String,

    /// Category name, keyword, or review group id
    #[arg(long)]
    value: String,

    /// What was changed
    #[arg(long, default_value = "")]
    description: String,

    /// Expected reduction in percent (0-100)
    #[arg(long)]
    expected_reduction: Option<f64>,
}

impl From<IssueArgs> for NewIssue {
    fn from(args: IssueArgs) -> Self {
        NewIssue {
            app_id: args.app,
            issue_type: args.issue_type,
            issue_value: args.value,
            optimization_desc: args.description,
            expected_reduction: args.expected_reduction,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and apply migrations
    Init,

    /// Load feedback records from a JSON array file
    Ingest {
        /// Path to the JSON file
        file: PathBuf,
    },

    /// Cluster one app/scope/period unit
    Cluster {
        #[arg(long)]
        app: String,

        /// "all" or a category name
        #[arg(long, default_value = "all")]
        scope: String,

        #[command(flatten)]
        period: PeriodArgs,
    },

    /// Cluster every app and configured scope for one period
    ClusterAll {
        #[command(flatten)]
        period: PeriodArgs,
    },

    /// Create a verification config
    CreateConfig {
        #[command(subcommand)]
        mode: CreateMode,
    },

    /// Run one verification config
    Verify {
        /// Config id
        id: String,
    },

    /// Run every verification config
    VerifyAll {
        /// Restrict to one app
        #[arg(long)]
        app: Option<String>,
    },

    /// Print dashboard summaries
    Summary {
        #[command(subcommand)]
        view: SummaryView,
    },

    /// Run the clustering and verification jobs on their schedules until interrupted
    Serve,
}

#[derive(Subcommand)]
enum CreateMode {
    /// Baseline is the days before go-live; verification is open-ended from go-live
    Quick {
        #[command(flatten)]
        issue: IssueArgs,

        /// Go-live date (YYYY-MM-DD)
        #[arg(long)]
        go_live: NaiveDate,
    },

    /// Explicit baseline and verification windows (whole days)
    Advanced {
        #[command(flatten)]
        issue: IssueArgs,

        #[arg(long)]
        baseline_start: NaiveDate,

        #[arg(long)]
        baseline_end: NaiveDate,

        #[arg(long)]
        verify_start: NaiveDate,

        #[arg(long)]
        verify_end: Option<NaiveDate>,
    },
}

#[derive(Subcommand)]
enum SummaryView {
    /// Top groups per scope for a month
    Clusters {
        #[arg(long)]
        app: String,

        #[arg(long)]
        year: i32,

        #[arg(long)]
        month: u32,

        /// Groups shown per scope
        #[arg(long, default_value = "5")]
        top: usize,
    },

    /// Verification configs with their latest result
    Verification {
        #[arg(long)]
        app: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let default_path = get_default_config_path();
            if default_path.exists() {
                EngineConfig::from_file(&default_path).with_context(|| {
                    format!("Failed to load config from {}", default_path.display())
                })?
            } else {
                debug!("No config file found, using defaults");
                EngineConfig::default()
            }
        }
    };

    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_pipeline(
    config: &EngineConfig,
    storage: &Arc<LibsqlStorage>,
) -> anyhow::Result<ClusterPipeline> {
    let llm = LlmService::new(LlmConfig::from_settings(&config.llm))
        .context("Clustering needs an LLM; set ANTHROPIC_API_KEY")?;

    Ok(ClusterPipeline::new(
        storage.clone(),
        storage.clone(),
        storage.clone(),
        Arc::new(llm),
        config.clustering.clone(),
    ))
}

fn build_runner(storage: &Arc<LibsqlStorage>) -> VerificationRunner {
    VerificationRunner::new(storage.clone(), storage.clone(), storage.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Engine at the requested level, chatty dependencies at warn
    let filter = EnvFilter::new(format!(
        "triage_loop={lvl},triage_loop_core={lvl},libsql=warn,hyper=warn,reqwest=warn",
        lvl = level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Triage Loop v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    let storage = Arc::new(
        LibsqlStorage::open(&config.database.path, true)
            .await
            .context("Failed to initialize storage")?,
    );
    let now = Utc::now();

    match cli.command {
        Commands::Init => {
            println!("Database ready at {}", storage.path().display());
            Ok(())
        }
        Commands::Ingest { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let records: Vec<FeedbackRecord> =
                serde_json::from_str(&contents).context("Invalid feedback JSON")?;
            let count = storage.ingest_feedback(&records).await?;
            println!("Ingested {} feedback records", count);
            Ok(())
        }
        Commands::Cluster { app, scope, period } => {
            let scope: Scope = scope.parse()?;
            let pipeline = build_pipeline(&config, &storage)?;
            let outcome = pipeline.run_unit(&app, &scope, &period.spec(now), now).await?;
            print_json(&outcome.groups)
        }
        Commands::ClusterAll { period } => {
            let pipeline = build_pipeline(&config, &storage)?;
            let report = pipeline.run_all(&period.spec(now), now).await?;
            print_json(&report)
        }
        Commands::CreateConfig { mode } => {
            let manager = ConfigManager::new(
                storage.clone(),
                storage.clone(),
                config.verification.clone(),
            );
            let created = match mode {
                CreateMode::Quick { issue, go_live } => {
                    manager.create_quick(issue.into(), go_live, now).await?
                }
                CreateMode::Advanced {
                    issue,
                    baseline_start,
                    baseline_end,
                    verify_start,
                    verify_end,
                } => {
                    manager
                        .create_advanced(
                            issue.into(),
                            start_of_day(baseline_start),
                            end_of_day(baseline_end),
                            start_of_day(verify_start),
                            verify_end.map(end_of_day),
                            now,
                        )
                        .await?
                }
            };
            print_json(&created)
        }
        Commands::Verify { id } => {
            let id = ConfigId::from_string(&id)
                .map_err(|e| anyhow::anyhow!("Invalid config id '{}': {}", id, e))?;
            let result = build_runner(&storage).run_config(id, now).await?;
            print_json(&result)
        }
        Commands::VerifyAll { app } => {
            let report = build_runner(&storage).run_all(app.as_deref(), now).await?;
            print_json(&report)
        }
        Commands::Summary { view } => {
            let scopes = config
                .clustering
                .scopes
                .iter()
                .map(|s| s.parse::<Scope>())
                .collect::<Result<Vec<_>, _>>()?;
            let aggregator =
                SummaryAggregator::new(storage.clone(), storage.clone(), storage.clone(), scopes);

            match view {
                SummaryView::Clusters {
                    app,
                    year,
                    month,
                    top,
                } => print_json(&aggregator.cluster_summary(&app, year, month, top).await?),
                SummaryView::Verification { app } => {
                    print_json(&aggregator.verification_summary(&app).await?)
                }
            }
        }
        Commands::Serve => {
            let pipeline = Arc::new(build_pipeline(&config, &storage)?);
            let runner = Arc::new(build_runner(&storage));

            let mut scheduler = Scheduler::new();
            scheduler.register_job(
                Arc::new(ClusteringJob::new(pipeline, config.clustering.interval)),
                JobConfig::from(&config.clustering),
            );
            scheduler.register_job(
                Arc::new(VerificationJob::new(runner)),
                JobConfig::from(&config.verification),
            );

            let scheduler = Arc::new(scheduler);
            let worker = Arc::clone(&scheduler);
            let task = tokio::spawn(async move { worker.start().await });

            info!("Scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutting down scheduler");
            scheduler.stop();

            match task.await? {
                Ok(()) => Ok(()),
                Err(e) => bail!("Scheduler stopped with error: {}", e),
            }
        }
    }
}
