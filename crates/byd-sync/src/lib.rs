//! Load orchestration: configuration, extraction, normalization, reconciliation
//! and run reports.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use byd_adapters::{
    dataset_for_id, load_dataset_registry, resolve_enabled_datasets, DatasetRegistry, DatasetSpec,
    ODataSource, DEFAULT_ODATA_BASE_URL,
};
use byd_core::{PeriodParseError, Window, WindowMode, WindowPlanner};
use byd_storage::{
    BasicCredentials, HttpClientConfig, HttpFetcher, MemoryTableSink, PgConnectOptions, PgTableSink,
    TableSink, DEFAULT_HTTP_TIMEOUT,
};
use chrono::{Local, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

pub mod fetch;
pub mod job;
pub mod normalize;
pub mod writer;

pub use fetch::{Extraction, PaginatedFetcher};
pub use job::{run_dataset, run_job, DatasetError, DatasetOutcome, DatasetReport, DatasetStatus, RunSummary};
pub use normalize::{NormalizeStats, Normalized, RecordNormalizer};
pub use writer::{ReconcileOutcome, ReconciliationWriter, ReplaceWriter};

pub const CRATE_NAME: &str = "byd-sync";

pub const DEFAULT_WINDOW_START: &str = "2026-01-01T00:00:00";
const WINDOW_START_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const USER_AGENT: &str = "byd-loader/0.1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid ETL_RELOAD_PERIODS: {0}")]
    Period(#[from] PeriodParseError),
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub credentials: Option<BasicCredentials>,
    pub odata_base_url: String,
    pub http_timeout: Duration,
    pub database: Option<PgConnectOptions>,
    pub window_mode: WindowMode,
    pub workspace_root: PathBuf,
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let credentials = match (get("BYD_USER"), get("BYD_PASS")) {
            (Some(user), Some(password)) => Some(BasicCredentials { user, password }),
            _ => None,
        };

        let http_timeout = match get("BYD_HTTP_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.parse().map_err(|_| ConfigError::Invalid {
                key: "BYD_HTTP_TIMEOUT_SECS",
                reason: format!("`{raw}` is not a whole number of seconds"),
            })?),
            None => DEFAULT_HTTP_TIMEOUT,
        };

        let database = match get("DATABASE_URL") {
            Some(url) => Some(url.parse::<PgConnectOptions>().map_err(|e| ConfigError::Invalid {
                key: "DATABASE_URL",
                reason: e.to_string(),
            })?),
            None => match (get("PG_HOST"), get("PG_USER"), get("PG_DB")) {
                (Some(host), Some(user), Some(db)) => {
                    let port = match get("PG_PORT") {
                        Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
                            key: "PG_PORT",
                            reason: format!("`{raw}` is not a port number"),
                        })?,
                        None => 5432,
                    };
                    let mut options = PgConnectOptions::new()
                        .host(&host)
                        .port(port)
                        .username(&user)
                        .database(&db);
                    if let Some(password) = get("PG_PASS") {
                        options = options.password(&password);
                    }
                    Some(options)
                }
                _ => None,
            },
        };

        let auto = get("ETL_AUTO_WINDOW")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(true);
        let window_mode = if auto {
            WindowMode::Automatic
        } else {
            let raw_start =
                get("ETL_WINDOW_START").unwrap_or_else(|| DEFAULT_WINDOW_START.to_string());
            let start = NaiveDateTime::parse_from_str(&raw_start, WINDOW_START_FORMAT).map_err(
                |e| ConfigError::Invalid {
                    key: "ETL_WINDOW_START",
                    reason: format!("`{raw_start}`: {e}"),
                },
            )?;
            let tags: Vec<String> = get("ETL_RELOAD_PERIODS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            WindowMode::manual_from_tags(start, &tags)?
        };

        Ok(Self {
            credentials,
            odata_base_url: get("BYD_ODATA_BASE_URL")
                .unwrap_or_else(|| DEFAULT_ODATA_BASE_URL.to_string()),
            http_timeout,
            database,
            window_mode,
            workspace_root: get("ETL_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }

    pub fn window_planner(&self) -> WindowPlanner {
        WindowPlanner::new(self.window_mode.clone())
    }

    pub fn require_credentials(&self) -> Result<&BasicCredentials, ConfigError> {
        self.credentials.as_ref().ok_or(ConfigError::Missing("BYD_USER/BYD_PASS"))
    }

    pub fn require_database(&self) -> Result<&PgConnectOptions, ConfigError> {
        self.database
            .as_ref()
            .ok_or(ConfigError::Missing("DATABASE_URL or PG_HOST/PG_USER/PG_DB"))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("datasets.yaml")
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to this dataset id.
    pub only_dataset: Option<String>,
    /// Load into an in-memory sink instead of PostgreSQL.
    pub dry_run: bool,
}

pub struct SyncPipeline {
    config: EtlConfig,
}

impl SyncPipeline {
    pub fn new(config: EtlConfig) -> Self {
        Self { config }
    }

    pub fn plan_window(&self, today: NaiveDate) -> Window {
        self.config.window_planner().plan(today)
    }

    pub fn select_datasets(&self, only: Option<&str>) -> Result<Vec<DatasetSpec>> {
        let registry = load_dataset_registry(self.config.registry_path())?;
        select_datasets(registry.as_ref(), only)
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let window = self.plan_window(Local::now().date_naive());
        let datasets = self.select_datasets(options.only_dataset.as_deref())?;
        let credentials = self.config.require_credentials()?.clone();

        info!(
            %run_id,
            start = %window.start(),
            fiscal_upper_bound = ?window.fiscal_upper_bound().map(|p| p.dotted()),
            tags = ?window.period_tags(),
            datasets = datasets.len(),
            dry_run = options.dry_run,
            "starting load"
        );

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: self.config.http_timeout,
            user_agent: Some(USER_AGENT.to_string()),
            credentials: Some(credentials),
        })?;
        let source = ODataSource::new(http, self.config.odata_base_url.clone(), run_id);

        let sink: Box<dyn TableSink> = if options.dry_run {
            Box::new(MemoryTableSink::new())
        } else {
            let options = self.config.require_database()?.clone();
            Box::new(
                PgTableSink::connect_with(options)
                    .await
                    .context("connecting to PostgreSQL")?,
            )
        };

        let reports = run_job(run_id, &source, sink.as_ref(), &datasets, &window).await;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            window,
            datasets: reports,
            reports_dir: None,
        };
        let reports_dir = write_run_report(&self.config.workspace_root, &summary).await?;
        summary.reports_dir = Some(reports_dir.display().to_string());
        Ok(summary)
    }
}

/// One dataset by id, or every enabled one. Registry page sizes apply either way.
pub fn select_datasets(
    registry: Option<&DatasetRegistry>,
    only: Option<&str>,
) -> Result<Vec<DatasetSpec>> {
    let Some(dataset_id) = only else {
        return resolve_enabled_datasets(registry);
    };

    let mut spec =
        dataset_for_id(dataset_id).with_context(|| format!("unknown dataset id `{dataset_id}`"))?;
    let override_size = registry
        .and_then(|r| r.datasets.iter().find(|e| e.dataset_id == dataset_id))
        .and_then(|e| e.page_size)
        .filter(|size| *size > 0);
    if let Some(page_size) = override_size {
        spec.page_size = page_size;
    }
    Ok(vec![spec])
}

/// Writes `reports/<run_id>/run_summary.json` under `workspace_root`.
pub async fn write_run_report(workspace_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = workspace_root
        .join("reports")
        .join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), bytes)
        .await
        .context("writing run_summary.json")?;
    Ok(reports_dir)
}

pub async fn run_once_from_env(options: &RunOptions) -> Result<RunSummary> {
    let config = EtlConfig::from_env()?;
    SyncPipeline::new(config).run_once(options).await
}
