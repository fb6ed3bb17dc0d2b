//! Windowed reconciliation and full-replace writers on top of a [`TableSink`].

use byd_core::{Row, TableSchema, Window};
use byd_storage::{DeletePredicate, SinkError, TableSink, WriteMode};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub rows_written: u64,
    pub rows_deleted: u64,
    pub created: bool,
}

pub struct ReconciliationWriter<'a> {
    sink: &'a dyn TableSink,
}

impl<'a> ReconciliationWriter<'a> {
    pub fn new(sink: &'a dyn TableSink) -> Self {
        Self { sink }
    }

    /// Delete the window's rows (every tag rendering) and append `batch` in one
    /// transaction; a missing table is created instead of deleted from.
    pub async fn reconcile(
        &self,
        batch: &[Row],
        window: &Window,
        schema: &TableSchema,
    ) -> Result<ReconcileOutcome, SinkError> {
        let exists = self.sink.table_exists(&schema.table).await?;

        let mode = if !exists {
            info!(table = %schema.table, "first load; creating table");
            WriteMode::Append {
                create_table: true,
                delete: None,
            }
        } else if window.has_period_tags() {
            let column = schema.period_column.clone().ok_or_else(|| {
                SinkError::Rejected(format!(
                    "table {} has no period column to reconcile on",
                    schema.table
                ))
            })?;
            info!(table = %schema.table, tags = ?window.period_tags(), "deleting window periods");
            WriteMode::Append {
                create_table: false,
                delete: Some(DeletePredicate {
                    column,
                    values: window.period_tags().clone(),
                }),
            }
        } else {
            warn!(table = %schema.table, "no reload periods configured; appending without delete");
            WriteMode::Append {
                create_table: false,
                delete: None,
            }
        };

        let outcome = self.sink.write(schema, batch, &mode).await?;
        Ok(ReconcileOutcome {
            rows_written: outcome.rows_written,
            rows_deleted: outcome.rows_deleted,
            created: outcome.table_created,
        })
    }
}

pub struct ReplaceWriter<'a> {
    sink: &'a dyn TableSink,
}

impl<'a> ReplaceWriter<'a> {
    pub fn new(sink: &'a dyn TableSink) -> Self {
        Self { sink }
    }

    pub async fn replace(&self, batch: &[Row], schema: &TableSchema) -> Result<u64, SinkError> {
        let outcome = self.sink.write(schema, batch, &WriteMode::Replace).await?;
        info!(table = %schema.table, rows = outcome.rows_written, "table replaced");
        Ok(outcome.rows_written)
    }
}
