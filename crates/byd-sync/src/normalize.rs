//! Raw entries to typed rows for one dataset.

use std::collections::BTreeSet;

use byd_adapters::DatasetSpec;
use byd_core::{truncate_chars, Batch, ColumnKind, ColumnSource, RawEntry, Row, Value, Window};
use serde::Serialize;
use tracing::{info, warn};

const PERIOD_SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizeStats {
    pub entries_in: usize,
    pub rows_out: usize,
    pub dropped_out_of_window: usize,
    /// Numeric cells that failed to parse and were stored as NaN.
    pub unparsable_values: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub rows: Batch,
    pub stats: NormalizeStats,
}

pub struct RecordNormalizer<'a> {
    dataset: &'a DatasetSpec,
    negated: Vec<usize>,
}

impl<'a> RecordNormalizer<'a> {
    pub fn new(dataset: &'a DatasetSpec) -> Self {
        let negated = dataset
            .negated_columns
            .iter()
            .filter_map(|name| dataset.schema.column_index(name))
            .collect();
        Self { dataset, negated }
    }

    pub fn normalize(&self, entries: &[RawEntry], window: &Window) -> Normalized {
        let schema = &self.dataset.schema;
        let period_idx = schema.period_index();
        let period_key = period_idx.and_then(|idx| match &schema.columns[idx].source {
            ColumnSource::Field(key) => Some(key.as_str()),
            ColumnSource::Constant(_) => None,
        });
        let filter_by_period = period_idx.is_some() && window.has_period_tags();

        if let Some(key) = period_key {
            let mut sample = BTreeSet::new();
            for value in entries.iter().filter_map(|e| e.get(key)) {
                if sample.len() == PERIOD_SAMPLE_SIZE {
                    break;
                }
                sample.insert(value.trim());
            }
            if !sample.is_empty() {
                info!(dataset_id = %self.dataset.dataset_id, ?sample, "period tags in response");
            }
        }

        let mut stats = NormalizeStats {
            entries_in: entries.len(),
            ..Default::default()
        };
        let mut rows = Vec::with_capacity(entries.len());

        for entry in entries {
            let (row, unparsable) = self.convert(entry);

            if filter_by_period {
                let tag = period_idx.and_then(|idx| row.text(idx)).unwrap_or_default();
                if !window.matches_tag(tag) {
                    stats.dropped_out_of_window += 1;
                    continue;
                }
            }
            stats.unparsable_values += unparsable;
            rows.push(row);
        }
        stats.rows_out = rows.len();

        if stats.dropped_out_of_window > 0 {
            info!(
                dataset_id = %self.dataset.dataset_id,
                before = stats.entries_in,
                after = stats.rows_out,
                tags = ?window.period_tags(),
                "dropped rows outside the reload window"
            );
        }
        if stats.unparsable_values > 0 {
            warn!(
                dataset_id = %self.dataset.dataset_id,
                unparsable = stats.unparsable_values,
                "numeric values could not be parsed; stored as NaN"
            );
        }

        Normalized { rows, stats }
    }

    fn convert(&self, entry: &RawEntry) -> (Row, usize) {
        let mut unparsable = 0;
        let values = self
            .dataset
            .schema
            .columns
            .iter()
            .enumerate()
            .map(|(idx, column)| {
                let raw = match &column.source {
                    ColumnSource::Field(key) => {
                        entry.get(key).unwrap_or(column.kind.absent_default())
                    }
                    ColumnSource::Constant(value) => value.as_str(),
                };
                match column.kind {
                    ColumnKind::Text { max_width } => Value::Text(match max_width {
                        Some(width) => truncate_chars(raw, width),
                        None => raw.to_string(),
                    }),
                    ColumnKind::Float => {
                        let parsed = raw.trim().parse::<f64>().unwrap_or_else(|_| {
                            unparsable += 1;
                            f64::NAN
                        });
                        if self.negated.contains(&idx) {
                            Value::Float(-parsed)
                        } else {
                            Value::Float(parsed)
                        }
                    }
                }
            })
            .collect();
        (Row::new(values), unparsable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byd_adapters::catalog::{product_cost_dataset, sales_dataset};
    use byd_adapters::parse_odata_page;
    use byd_core::{WindowMode, WindowPlanner};
    use chrono::NaiveDate;

    fn window(tags: &[&str]) -> Window {
        let start = NaiveDate::from_ymd_opt(2025, 12, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        WindowPlanner::new(WindowMode::manual_from_tags(start, tags).unwrap())
            .plan(NaiveDate::from_ymd_opt(2026, 1, 10).unwrap())
    }

    fn sale(invoice: &str, period: &str, amount: &str) -> RawEntry {
        [
            ("CCINHUUID", invoice),
            ("CFISCALDDATES6F44DC8D81C7C41F", period),
            ("KCZ38704318CAF9C0490E065D", amount),
            ("KCZ206B9BDD38BC08F314528E", "10"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn drops_rows_outside_the_window_in_either_rendering() {
        let spec = sales_dataset();
        let entries = vec![
            sale("1", "12.2025", "1"),
            sale("2", "2026-01 ", "1"),
            sale("3", "11.2025", "1"),
        ];
        let out = RecordNormalizer::new(&spec).normalize(&entries, &window(&["12.2025", "01.2026"]));

        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.stats.dropped_out_of_window, 1);
        let invoice = spec.schema.column_index("Invoice").unwrap();
        let kept: Vec<_> = out.rows.iter().filter_map(|r| r.text(invoice)).collect();
        assert_eq!(kept, vec!["1", "2"]);
    }

    #[test]
    fn empty_window_passes_everything_through() {
        let spec = sales_dataset();
        let entries = vec![sale("1", "12.2025", "1"), sale("2", "03.2019", "1")];
        let out = RecordNormalizer::new(&spec).normalize(&entries, &window(&[]));
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.stats.dropped_out_of_window, 0);
    }

    #[test]
    fn sales_amounts_are_negated_and_garbage_becomes_nan() {
        let spec = sales_dataset();
        let entries = vec![sale("1", "12.2025", " 125.5 "), sale("2", "12.2025", "n/a")];
        let out = RecordNormalizer::new(&spec).normalize(&entries, &window(&["12.2025"]));

        let sales = spec.schema.column_index("VENTAS_US").unwrap();
        let cost = spec.schema.column_index("COSTO_US").unwrap();
        let qty = spec.schema.column_index("Cantidad_FacUS").unwrap();

        assert_eq!(out.rows[0].float(sales), Some(-125.5));
        assert_eq!(out.rows[0].float(cost), Some(-10.0));
        assert_eq!(out.rows[0].float(qty), Some(0.0));
        assert!(out.rows[1].get(sales).unwrap().is_unparsable());
        assert_eq!(out.stats.unparsable_values, 1);
    }

    #[test]
    fn unparsable_count_ignores_rows_dropped_by_the_window() {
        let spec = sales_dataset();
        let entries = vec![
            sale("1", "12.2025", "oops"),
            sale("2", "11.2025", "oops"),
            sale("3", "10.2025", "also bad"),
        ];
        let out = RecordNormalizer::new(&spec).normalize(&entries, &window(&["12.2025"]));
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.stats.dropped_out_of_window, 2);
        assert_eq!(out.stats.unparsable_values, 1);
    }

    #[test]
    fn null_key_figure_is_unparsable_not_zero() {
        let spec = sales_dataset();
        let body = br#"{"d":{"results":[{
            "CCINHUUID":"INV-9",
            "CFISCALDDATES6F44DC8D81C7C41F":"12.2025",
            "KCZ38704318CAF9C0490E065D":null,
            "TCUSTOMER":null
        }]}}"#;
        let entries = parse_odata_page(body).unwrap();
        let out = RecordNormalizer::new(&spec).normalize(&entries, &window(&["12.2025"]));
        let row = &out.rows[0];

        assert!(row.get(spec.schema.column_index("VENTAS_US").unwrap()).unwrap().is_unparsable());
        assert_eq!(row.float(spec.schema.column_index("COSTO_US").unwrap()), Some(-0.0));
        assert_eq!(row.text(spec.schema.column_index("Customer_Name").unwrap()), Some(""));
        assert_eq!(out.stats.unparsable_values, 1);
    }

    #[test]
    fn absent_fields_default_constants_fill_and_text_truncates() {
        let spec = sales_dataset();
        let mut entry = sale("INV-000000000000000001", "12.2025", "1");
        entry.insert("C1CUSTOMERsCITY_NAME", "x".repeat(150));
        let out = RecordNormalizer::new(&spec).normalize(&[entry], &window(&[]));
        let row = &out.rows[0];

        assert_eq!(row.text(spec.schema.column_index("Invoice").unwrap()), Some("INV-00000000000"));
        assert_eq!(
            row.text(spec.schema.column_index("City").unwrap()).map(|c| c.chars().count()),
            Some(100)
        );
        assert_eq!(row.text(spec.schema.column_index("Customer").unwrap()), Some(""));
        assert_eq!(
            row.text(spec.schema.column_index("periodo_data").unwrap()),
            Some("Dic 2025 en adelante")
        );
    }

    #[test]
    fn datasets_without_period_column_are_not_filtered() {
        let spec = product_cost_dataset();
        let entry: RawEntry = [("CMATERIAL", "M-1"), ("FCVALPCOMP", "3.25")].into_iter().collect();
        let out = RecordNormalizer::new(&spec).normalize(&[entry], &window(&["12.2025"]));
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].float(spec.schema.column_index("FCVALPCOMP").unwrap()), Some(3.25));
        assert!(out.rows[0].values.iter().all(|v| !v.is_unparsable()));
    }
}
