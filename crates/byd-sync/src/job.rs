//! Per-dataset pipeline and the sequential job runner.

use byd_adapters::{DatasetSpec, LoadStrategy, RecordSource, SourceError};
use byd_core::Window;
use byd_storage::{SinkError, TableSink};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::fetch::PaginatedFetcher;
use crate::normalize::{NormalizeStats, RecordNormalizer};
use crate::writer::{ReconciliationWriter, ReplaceWriter};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("extraction failed: {0}")]
    Source(#[from] SourceError),
    #[error("load failed: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Loaded,
    /// Nothing survived normalization; the table was left alone.
    NoData,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetOutcome {
    pub status: DatasetStatus,
    pub pages: usize,
    pub normalize: NormalizeStats,
    pub rows_deleted: u64,
    pub rows_written: u64,
    pub table_created: bool,
}

/// Extract, normalize and load one dataset for `window`.
pub async fn run_dataset(
    source: &dyn RecordSource,
    sink: &dyn TableSink,
    dataset: &DatasetSpec,
    window: &Window,
) -> Result<DatasetOutcome, DatasetError> {
    let query = dataset.query_for(window);
    info!(
        dataset = %dataset.display_name,
        entity_set = %query.entity_set,
        page_size = query.page_size,
        filter = %query.filter.render(),
        "extracting"
    );

    let extraction = PaginatedFetcher::new(source).fetch(&query).await?;
    let normalized = RecordNormalizer::new(dataset).normalize(&extraction.entries, window);

    let mut outcome = DatasetOutcome {
        status: DatasetStatus::NoData,
        pages: extraction.pages,
        normalize: normalized.stats,
        rows_deleted: 0,
        rows_written: 0,
        table_created: false,
    };

    if normalized.rows.is_empty() {
        info!(table = %dataset.schema.table, "no data in range; table left untouched");
        return Ok(outcome);
    }

    match dataset.strategy {
        LoadStrategy::Reconcile => {
            let result = ReconciliationWriter::new(sink)
                .reconcile(&normalized.rows, window, &dataset.schema)
                .await?;
            outcome.rows_deleted = result.rows_deleted;
            outcome.rows_written = result.rows_written;
            outcome.table_created = result.created;
        }
        LoadStrategy::Replace => {
            outcome.rows_written = ReplaceWriter::new(sink)
                .replace(&normalized.rows, &dataset.schema)
                .await?;
            outcome.table_created = true;
        }
    }
    outcome.status = DatasetStatus::Loaded;
    Ok(outcome)
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub dataset_id: String,
    pub display_name: String,
    pub table: String,
    pub status: DatasetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DatasetOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub window: Window,
    pub datasets: Vec<DatasetReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &DatasetReport> {
        self.datasets
            .iter()
            .filter(|d| d.status == DatasetStatus::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }
}

/// Run every dataset in order. A failing dataset is recorded and the next one
/// still runs.
pub async fn run_job(
    run_id: Uuid,
    source: &dyn RecordSource,
    sink: &dyn TableSink,
    datasets: &[DatasetSpec],
    window: &Window,
) -> Vec<DatasetReport> {
    let mut reports = Vec::with_capacity(datasets.len());
    for dataset in datasets {
        let span = info_span!("dataset", %run_id, dataset_id = %dataset.dataset_id);
        let result = run_dataset(source, sink, dataset, window)
            .instrument(span)
            .await;

        let report = match result {
            Ok(outcome) => {
                info!(
                    dataset_id = %dataset.dataset_id,
                    status = ?outcome.status,
                    rows_written = outcome.rows_written,
                    rows_deleted = outcome.rows_deleted,
                    "dataset finished"
                );
                DatasetReport {
                    dataset_id: dataset.dataset_id.clone(),
                    display_name: dataset.display_name.clone(),
                    table: dataset.schema.table.clone(),
                    status: outcome.status,
                    outcome: Some(outcome),
                    error: None,
                }
            }
            Err(err) => {
                error!(dataset_id = %dataset.dataset_id, error = %err, "dataset failed");
                DatasetReport {
                    dataset_id: dataset.dataset_id.clone(),
                    display_name: dataset.display_name.clone(),
                    table: dataset.schema.table.clone(),
                    status: DatasetStatus::Failed,
                    outcome: None,
                    error: Some(err.to_string()),
                }
            }
        };
        reports.push(report);
    }
    reports
}
