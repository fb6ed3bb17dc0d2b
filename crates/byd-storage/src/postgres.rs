//! PostgreSQL table sink backed by sqlx.

use async_trait::async_trait;
use byd_core::{ColumnKind, Row, TableSchema, Value};
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::sink::{validate_request, SinkError, TableSink, WriteMode, WriteOutcome};

pub use sqlx::postgres::PgConnectOptions;

/// Rows per multi-row INSERT; keeps bind parameters well below the 65535 limit.
pub const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgTableSink {
    pool: PgPool,
}

impl PgTableSink {
    pub async fn connect_with(options: PgConnectOptions) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_type_sql(kind: &ColumnKind) -> String {
    match kind {
        ColumnKind::Text {
            max_width: Some(width),
        } => format!("VARCHAR({width})"),
        ColumnKind::Text { max_width: None } => "TEXT".to_string(),
        ColumnKind::Float => "DOUBLE PRECISION".to_string(),
    }
}

pub fn create_table_sql(schema: &TableSchema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), column_type_sql(&c.kind)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({columns})", quote_ident(&schema.table))
}

pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(table))
}

pub fn delete_sql(table: &str, column: &str) -> String {
    format!(
        "DELETE FROM {} WHERE btrim({}) = ANY($1)",
        quote_ident(table),
        quote_ident(column)
    )
}

fn insert_prefix(schema: &TableSchema) -> String {
    let columns = schema
        .column_names()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({columns}) ", quote_ident(&schema.table))
}

/// NaN, the unparsable marker, is stored as SQL NULL.
fn float_or_null(value: f64) -> Option<f64> {
    (!value.is_nan()).then_some(value)
}

async fn insert_rows(
    conn: &mut PgConnection,
    schema: &TableSchema,
    rows: &[Row],
) -> Result<u64, SinkError> {
    let prefix = insert_prefix(schema);
    let mut written = 0u64;
    for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
        qb.push_values(chunk, |mut b, row| {
            for value in &row.values {
                match value {
                    Value::Text(s) => {
                        b.push_bind(s.clone());
                    }
                    Value::Float(v) => {
                        b.push_bind(float_or_null(*v));
                    }
                }
            }
        });
        written += qb.build().execute(&mut *conn).await?.rows_affected();
        debug!(table = %schema.table, written, "inserted chunk");
    }
    Ok(written)
}

#[async_trait]
impl TableSink for PgTableSink {
    async fn table_exists(&self, table: &str) -> Result<bool, SinkError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (\
                SELECT 1 FROM information_schema.tables \
                WHERE table_schema = current_schema() AND table_name = $1\
            )",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn write(
        &self,
        schema: &TableSchema,
        rows: &[Row],
        mode: &WriteMode,
    ) -> Result<WriteOutcome, SinkError> {
        validate_request(schema, rows, mode)?;

        let mut tx = self.pool.begin().await?;
        let mut outcome = WriteOutcome::default();

        match mode {
            WriteMode::Replace => {
                sqlx::query(&drop_table_sql(&schema.table))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&create_table_sql(schema))
                    .execute(&mut *tx)
                    .await?;
                outcome.table_created = true;
            }
            WriteMode::Append {
                create_table,
                delete,
            } => {
                if *create_table {
                    sqlx::query(&create_table_sql(schema))
                        .execute(&mut *tx)
                        .await?;
                    outcome.table_created = true;
                }
                if let Some(predicate) = delete {
                    let values: Vec<String> = predicate.values.iter().cloned().collect();
                    outcome.rows_deleted = sqlx::query(&delete_sql(&schema.table, &predicate.column))
                        .bind(values)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                }
            }
        }

        outcome.rows_written = insert_rows(&mut tx, schema, rows).await?;
        tx.commit().await?;

        info!(
            table = %schema.table,
            rows_deleted = outcome.rows_deleted,
            rows_written = outcome.rows_written,
            table_created = outcome.table_created,
            "postgres write committed"
        );
        Ok(outcome)
    }
}
