use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use byd_adapters::catalog::{product_cost_dataset, sales_dataset};
use byd_adapters::{DatasetSpec, RecordQuery, RecordSource, SourceError};
use byd_core::{RawEntry, Value, Window, WindowMode, WindowPlanner};
use byd_storage::{FetchError, MemoryTableSink};
use byd_sync::{run_dataset, run_job, write_run_report, DatasetStatus, RunSummary};
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

const SALES_TABLE: &str = "sap_byd_ventas";

/// Replays scripted pages per entity set and records every request.
#[derive(Default)]
struct ScriptedSource {
    pages: Mutex<HashMap<String, VecDeque<Result<Vec<RawEntry>, SourceError>>>>,
    requests: Mutex<Vec<RecordQuery>>,
}

impl ScriptedSource {
    fn script(&self, entity_set: &str, pages: Vec<Result<Vec<RawEntry>, SourceError>>) {
        self.pages
            .lock()
            .unwrap()
            .insert(entity_set.to_string(), pages.into());
    }

    fn requests_for(&self, entity_set: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.entity_set == entity_set)
            .count()
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn fetch_page(&self, query: &RecordQuery) -> Result<Vec<RawEntry>, SourceError> {
        self.requests.lock().unwrap().push(query.clone());
        self.pages
            .lock()
            .unwrap()
            .get_mut(&query.entity_set)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

fn sale(invoice: &str, period: &str) -> RawEntry {
    [
        ("CCINHUUID", invoice),
        ("CFISCALDDATES6F44DC8D81C7C41F", period),
        ("KCZ38704318CAF9C0490E065D", "100"),
        ("KCZ206B9BDD38BC08F314528E", "60"),
        ("KCZ80E56A9357921903E24583", "2"),
        ("TCUSTOMER", "Cliente Uno"),
    ]
    .into_iter()
    .collect()
}

fn sales_with_page_size(page_size: usize) -> DatasetSpec {
    let mut spec = sales_dataset();
    spec.page_size = page_size;
    spec
}

fn window(tags: &[&str]) -> Window {
    let start = NaiveDate::from_ymd_opt(2025, 12, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    WindowPlanner::new(WindowMode::manual_from_tags(start, tags).unwrap())
        .plan(NaiveDate::from_ymd_opt(2026, 1, 20).unwrap())
}

fn two_page_script(source: &ScriptedSource, entity_set: &str) {
    source.script(
        entity_set,
        vec![
            Ok(vec![sale("A1", "12.2025"), sale("A2", "12.2025"), sale("A3", "12.2025")]),
            Ok(vec![sale("B1", "01.2026")]),
        ],
    );
}

#[tokio::test]
async fn two_pages_load_into_a_fresh_table() {
    let spec = sales_with_page_size(3);
    let source = ScriptedSource::default();
    two_page_script(&source, &spec.entity_set);
    let sink = MemoryTableSink::new();

    let outcome = run_dataset(&source, &sink, &spec, &window(&["12.2025", "01.2026"]))
        .await
        .unwrap();

    assert_eq!(outcome.status, DatasetStatus::Loaded);
    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.normalize.rows_out, 4);
    assert!(outcome.table_created);
    assert_eq!(outcome.rows_written, 4);
    assert_eq!(source.requests_for(&spec.entity_set), 2);

    let table = sink.table(SALES_TABLE).await.unwrap();
    assert_eq!(table.rows.len(), 4);
    let amounts: Vec<_> = table
        .column_values("VENTAS_US")
        .into_iter()
        .filter_map(Value::as_float)
        .collect();
    assert!(amounts.iter().all(|v| *v == -100.0));
}

#[tokio::test]
async fn rerunning_the_same_window_does_not_duplicate() {
    let spec = sales_with_page_size(3);
    let source = ScriptedSource::default();
    let sink = MemoryTableSink::new();
    let window = window(&["12.2025", "01.2026"]);

    two_page_script(&source, &spec.entity_set);
    run_dataset(&source, &sink, &spec, &window).await.unwrap();

    two_page_script(&source, &spec.entity_set);
    let second = run_dataset(&source, &sink, &spec, &window).await.unwrap();

    assert_eq!(second.rows_deleted, 4);
    assert!(!second.table_created);
    assert_eq!(sink.row_count(SALES_TABLE).await, 4);
}

#[tokio::test]
async fn rows_outside_the_window_never_reach_the_sink() {
    let spec = sales_with_page_size(10);
    let source = ScriptedSource::default();
    source.script(
        &spec.entity_set,
        vec![Ok(vec![sale("A1", "12.2025"), sale("Z9", "11.2025")])],
    );
    let sink = MemoryTableSink::new();

    let outcome = run_dataset(&source, &sink, &spec, &window(&["12.2025"]))
        .await
        .unwrap();

    assert_eq!(outcome.normalize.dropped_out_of_window, 1);
    assert_eq!(sink.row_count(SALES_TABLE).await, 1);
}

#[tokio::test]
async fn empty_extraction_leaves_the_sink_alone() {
    let spec = sales_with_page_size(10);
    let source = ScriptedSource::default();
    let sink = MemoryTableSink::new();

    let outcome = run_dataset(&source, &sink, &spec, &window(&["12.2025"]))
        .await
        .unwrap();

    assert_eq!(outcome.status, DatasetStatus::NoData);
    assert_eq!(source.requests_for(&spec.entity_set), 1);
    assert!(sink.table(SALES_TABLE).await.is_none());
}

#[tokio::test]
async fn failed_append_rolls_back_the_window_delete() {
    let spec = sales_with_page_size(3);
    let source = ScriptedSource::default();
    let sink = MemoryTableSink::new();
    let window = window(&["12.2025", "01.2026"]);

    two_page_script(&source, &spec.entity_set);
    run_dataset(&source, &sink, &spec, &window).await.unwrap();
    let before = sink.table(SALES_TABLE).await.unwrap();

    two_page_script(&source, &spec.entity_set);
    sink.reject_next_append("statement timeout").await;
    let err = run_dataset(&source, &sink, &spec, &window).await.unwrap_err();

    assert!(err.to_string().contains("statement timeout"));
    assert_eq!(sink.table(SALES_TABLE).await.unwrap(), before);
}

#[tokio::test]
async fn one_failing_dataset_does_not_stop_the_next() {
    let sales = sales_with_page_size(3);
    let cost = product_cost_dataset();
    let source = ScriptedSource::default();
    source.script(
        &sales.entity_set,
        vec![Err(SourceError::Transport(FetchError::HttpStatus {
            status: 401,
            url: "https://host/svc/sales".into(),
        }))],
    );
    source.script(
        &cost.entity_set,
        vec![Ok(vec![[("CMATERIAL", "M-1"), ("FCVALPCOMP", "12.5")]
            .into_iter()
            .collect()])],
    );
    let sink = MemoryTableSink::new();

    let reports = run_job(
        Uuid::new_v4(),
        &source,
        &sink,
        &[sales, cost],
        &window(&["12.2025"]),
    )
    .await;

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].status, DatasetStatus::Failed);
    assert!(reports[0].error.as_deref().unwrap().contains("401"));
    assert_eq!(reports[1].status, DatasetStatus::Loaded);
    assert_eq!(reports[1].display_name, "Product cost");
    assert!(sink.table(SALES_TABLE).await.is_none());
    assert_eq!(sink.row_count("sap_byd_costo_producto").await, 1);
}

#[tokio::test]
async fn run_report_lands_under_the_run_id() {
    let dir = tempfile::tempdir().unwrap();
    let summary = RunSummary {
        run_id: Uuid::new_v4(),
        started_at: Utc::now(),
        finished_at: Utc::now(),
        dry_run: true,
        window: window(&["12.2025"]),
        datasets: Vec::new(),
        reports_dir: None,
    };

    let reports_dir = write_run_report(dir.path(), &summary).await.unwrap();
    assert!(reports_dir.ends_with(summary.run_id.to_string()));

    let text = std::fs::read_to_string(reports_dir.join("run_summary.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["dry_run"], true);
    assert_eq!(json["window"]["start"], "2025-12-01T00:00:00");
    assert!(!summary.has_failures());
}
