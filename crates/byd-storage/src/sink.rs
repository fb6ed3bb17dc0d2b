//! Table sink contract and the in-memory implementation.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use byd_core::{Row, TableSchema, Value};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

/// Rows whose `column` value, trimmed, equals any of `values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePredicate {
    pub column: String,
    pub values: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Optionally create the table, optionally delete matching rows, then append.
    Append {
        create_table: bool,
        delete: Option<DeletePredicate>,
    },
    /// Drop whatever is there and recreate it from the rows.
    Replace,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub rows_deleted: u64,
    pub rows_written: u64,
    pub table_created: bool,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("row {row} has {actual} values but table {table} declares {expected} columns")]
    RowShape {
        table: String,
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("column {column} is not declared on table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Everything one `write` call does happens in a single transaction: either all
/// of it is visible afterwards or none of it is.
#[async_trait]
pub trait TableSink: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, SinkError>;

    async fn write(
        &self,
        schema: &TableSchema,
        rows: &[Row],
        mode: &WriteMode,
    ) -> Result<WriteOutcome, SinkError>;
}

pub(crate) fn validate_request(
    schema: &TableSchema,
    rows: &[Row],
    mode: &WriteMode,
) -> Result<(), SinkError> {
    let expected = schema.columns.len();
    if let Some((row, bad)) = rows
        .iter()
        .enumerate()
        .find(|(_, r)| r.values.len() != expected)
    {
        return Err(SinkError::RowShape {
            table: schema.table.clone(),
            row,
            expected,
            actual: bad.values.len(),
        });
    }

    if let WriteMode::Append {
        delete: Some(predicate),
        ..
    } = mode
    {
        if schema.column_index(&predicate.column).is_none() {
            return Err(SinkError::UnknownColumn {
                table: schema.table.clone(),
                column: predicate.column.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    fn from_schema(schema: &TableSchema) -> Self {
        Self {
            columns: schema.column_names().map(ToString::to_string).collect(),
            rows: Vec::new(),
        }
    }

    pub fn column_values<'a>(&'a self, column: &str) -> Vec<&'a Value> {
        let Some(idx) = self.columns.iter().position(|c| c == column) else {
            return Vec::new();
        };
        self.rows.iter().filter_map(|r| r.get(idx)).collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    reject_next_append: Option<String>,
    delete_statements: usize,
}

/// Process-local sink. Each write stages a copy of the target table and swaps
/// it in only once every step succeeded.
#[derive(Debug, Default)]
pub struct MemoryTableSink {
    state: Mutex<MemoryState>,
}

impl MemoryTableSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the append step of the next write fail after any delete has run.
    pub async fn reject_next_append(&self, reason: impl Into<String>) {
        self.state.lock().await.reject_next_append = Some(reason.into());
    }

    pub async fn table(&self, name: &str) -> Option<MemoryTable> {
        self.state.lock().await.tables.get(name).cloned()
    }

    pub async fn row_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .await
            .tables
            .get(name)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Number of delete statements that reached a committed write.
    pub async fn delete_statements(&self) -> usize {
        self.state.lock().await.delete_statements
    }

    pub async fn insert_table(&self, schema: &TableSchema, rows: Vec<Row>) {
        let mut table = MemoryTable::from_schema(schema);
        table.rows = rows;
        self.state
            .lock()
            .await
            .tables
            .insert(schema.table.clone(), table);
    }
}

#[async_trait]
impl TableSink for MemoryTableSink {
    async fn table_exists(&self, table: &str) -> Result<bool, SinkError> {
        Ok(self.state.lock().await.tables.contains_key(table))
    }

    async fn write(
        &self,
        schema: &TableSchema,
        rows: &[Row],
        mode: &WriteMode,
    ) -> Result<WriteOutcome, SinkError> {
        validate_request(schema, rows, mode)?;

        let mut state = self.state.lock().await;
        let mut outcome = WriteOutcome::default();
        let mut deletes = 0usize;

        let mut staged = match mode {
            WriteMode::Replace => {
                outcome.table_created = true;
                MemoryTable::from_schema(schema)
            }
            WriteMode::Append {
                create_table,
                delete,
            } => {
                let mut staged = match (state.tables.get(&schema.table), create_table) {
                    (Some(_), true) => return Err(SinkError::TableExists(schema.table.clone())),
                    (None, false) => return Err(SinkError::MissingTable(schema.table.clone())),
                    (Some(existing), false) => existing.clone(),
                    (None, true) => {
                        outcome.table_created = true;
                        MemoryTable::from_schema(schema)
                    }
                };

                if let Some(predicate) = delete {
                    let idx = staged
                        .columns
                        .iter()
                        .position(|c| *c == predicate.column)
                        .ok_or_else(|| SinkError::UnknownColumn {
                            table: schema.table.clone(),
                            column: predicate.column.clone(),
                        })?;
                    let before = staged.rows.len();
                    staged.rows.retain(|row| {
                        !row
                            .text(idx)
                            .is_some_and(|v| predicate.values.contains(v.trim()))
                    });
                    outcome.rows_deleted = (before - staged.rows.len()) as u64;
                    deletes += 1;
                }
                staged
            }
        };

        if let Some(reason) = state.reject_next_append.take() {
            return Err(SinkError::Rejected(reason));
        }

        staged.rows.extend(rows.iter().cloned());
        outcome.rows_written = rows.len() as u64;

        state.tables.insert(schema.table.clone(), staged);
        state.delete_statements += deletes;
        Ok(outcome)
    }
}
