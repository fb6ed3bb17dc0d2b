//! Built-in dataset definitions and the `datasets.yaml` registry.

use std::path::Path;

use anyhow::{bail, Context, Result};
use byd_core::{ColumnKind, ColumnSpec, TableSchema, Window};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Filter, Predicate, RecordQuery};

const FISCAL_PERIOD_FIELD: &str = "CFISCALDDATES6F44DC8D81C7C41F";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStrategy {
    /// Delete the window's periods, then append.
    Reconcile,
    /// Full snapshot refresh.
    Replace,
}

/// Fields whose query bounds come from the planned window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBounds {
    pub timestamp_field: String,
    pub period_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSpec {
    pub dataset_id: String,
    pub display_name: String,
    pub entity_set: String,
    pub select: Vec<String>,
    pub static_filter: Vec<Predicate>,
    pub window_bounds: Option<WindowBounds>,
    pub page_size: usize,
    pub strategy: LoadStrategy,
    pub schema: TableSchema,
    /// Columns whose sign the source reports inverted.
    pub negated_columns: Vec<String>,
}

impl DatasetSpec {
    pub fn filter_for(&self, window: &Window) -> Filter {
        let mut predicates = Vec::new();
        if let Some(bounds) = &self.window_bounds {
            predicates.push(Predicate::timestamp_at_least(
                &bounds.timestamp_field,
                window.start(),
            ));
        }
        predicates.extend(self.static_filter.iter().cloned());
        if let (Some(bounds), Some(upper)) = (&self.window_bounds, window.fiscal_upper_bound()) {
            if let Some(field) = &bounds.period_field {
                predicates.push(Predicate::period_at_most(field, upper));
            }
        }
        Filter::new(predicates)
    }

    pub fn query_for(&self, window: &Window) -> RecordQuery {
        RecordQuery {
            dataset_id: self.dataset_id.clone(),
            entity_set: self.entity_set.clone(),
            select: self.select.clone(),
            filter: self.filter_for(window),
            page_size: self.page_size,
            offset: 0,
        }
    }
}

fn fields(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn midnight(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Columns named after their source field, all text except the listed key figures.
fn passthrough_columns(select: &[&str], float_fields: &[&str]) -> Vec<ColumnSpec> {
    select
        .iter()
        .map(|field| {
            let kind = if float_fields.contains(field) {
                ColumnKind::Float
            } else {
                ColumnKind::unbounded_text()
            };
            ColumnSpec::field(field, field, kind)
        })
        .collect()
}

pub fn sales_dataset() -> DatasetSpec {
    let select = [
        "C1CINHUUIDsDOC_INV_DATE",
        "C1CUSTOMERsCITY_NAME",
        "CACCPERIOD",
        "CCINHUUID",
        "CCUSTOMER",
        FISCAL_PERIOD_FIELD,
        "CPRODUCT",
        "CPROFITCTR",
        "CSALESUNIT",
        "CZCE03SBUDES",
        "KCZ38704318CAF9C0490E065D",
        "KCZ206B9BDD38BC08F314528E",
        "KCZ80E56A9357921903E24583",
        "TCUSTOMER",
        "T1CUSTOMERsREGION_CODE",
        "TCOUNTRY_CODE",
        "T1CINIUUIDsIP_PR_RC_UUID",
        "TRESPEMP",
    ];
    let columns = vec![
        ColumnSpec::field("Invoice_Date", "C1CINHUUIDsDOC_INV_DATE", ColumnKind::text(25)),
        ColumnSpec::field("Customer", "CCUSTOMER", ColumnKind::text(10)),
        ColumnSpec::field("City", "C1CUSTOMERsCITY_NAME", ColumnKind::text(100)),
        ColumnSpec::field("Accounting_Period", "CACCPERIOD", ColumnKind::text(10)),
        ColumnSpec::field("Invoice", "CCINHUUID", ColumnKind::text(15)),
        ColumnSpec::field("FiscalMonthYear", FISCAL_PERIOD_FIELD, ColumnKind::text(10)),
        ColumnSpec::field("Product", "CPRODUCT", ColumnKind::text(100)),
        ColumnSpec::field("Profit_Center", "CPROFITCTR", ColumnKind::text(15)),
        ColumnSpec::field("Sales_Unit", "CSALESUNIT", ColumnKind::text(20)),
        ColumnSpec::field("E03_SBU_Name", "CZCE03SBUDES", ColumnKind::text(20)),
        ColumnSpec::field("VENTAS_US", "KCZ38704318CAF9C0490E065D", ColumnKind::Float),
        ColumnSpec::field("COSTO_US", "KCZ206B9BDD38BC08F314528E", ColumnKind::Float),
        ColumnSpec::field("Cantidad_FacUS", "KCZ80E56A9357921903E24583", ColumnKind::Float),
        ColumnSpec::field("Customer_Name", "TCUSTOMER", ColumnKind::text(50)),
        ColumnSpec::field("State", "T1CUSTOMERsREGION_CODE", ColumnKind::text(20)),
        ColumnSpec::field("Country_Region", "TCOUNTRY_CODE", ColumnKind::text(10)),
        ColumnSpec::field("Ship_To", "T1CINIUUIDsIP_PR_RC_UUID", ColumnKind::text(60)),
        ColumnSpec::field("Person_Responsible", "TRESPEMP", ColumnKind::text(50)),
        ColumnSpec::constant("periodo_data", "Dic 2025 en adelante", ColumnKind::text(50)),
    ];

    DatasetSpec {
        dataset_id: "sales".into(),
        display_name: "Sales invoices".into(),
        entity_set: "RPZE627541F6012E1EBC362E8QueryResults".into(),
        select: fields(&select),
        static_filter: vec![Predicate::not_equals("CDSR_PROC_CATID", "CA_2")],
        window_bounds: Some(WindowBounds {
            timestamp_field: "CPOSTDATE".into(),
            period_field: Some(FISCAL_PERIOD_FIELD.into()),
        }),
        page_size: 10_000,
        strategy: LoadStrategy::Reconcile,
        schema: TableSchema {
            table: "sap_byd_ventas".into(),
            columns,
            period_column: Some("FiscalMonthYear".into()),
        },
        negated_columns: fields(&["VENTAS_US", "COSTO_US"]),
    }
}

pub fn orders_dataset() -> DatasetSpec {
    // (source field, output column, numeric)
    let mapping: [(&str, &str, bool); 31] = [
        ("CBP_INT_ID", "Customer", false),
        ("TBP_INT_ID", "Account Name", false),
        ("CYPCJYMI4Y_ZBRAND", "Brand", false),
        ("CIPY_BUY_CTYNM_N", "City of Ship-to1", false),
        ("CIPY_PRD_REC_ADR_CITY", "City of Ship-to", false),
        ("TDBA_DISTRCHN_CD", "TDBA_DISTRCHN_CD", false),
        ("CZCE03SBUDES", "CZCE03SBUDES", false),
        ("CIPY_EMP_RSP_PTY", "CIPY_EMP_RSP_PTY", false),
        ("TIPY_EMP_RSP_PTY", "TIPY_EMP_RSP_PTY", false),
        (FISCAL_PERIOD_FIELD, "FiscalMonthYear", false),
        ("CIPR_PRODUCT", "Product", false),
        ("TIPR_PRODUCT", "TIPR_PRODUCT", false),
        ("CDOC_ID", "Sales Order", false),
        ("CITM_UUID", "CITM_UUID", false),
        ("TITM_UUID", "Sales Order Item", false),
        ("CIPY_PRD_REC_PTY", "Ship-To ID", false),
        ("TIPY_PRD_REC_PTY", "Ship-To", false),
        ("TIPY_BUY_REGCD_N", "State", false),
        ("KCIAV_INV_AMT_RC", "Invoiced Amount", true),
        ("KCZE2B935894219245A1E8E77", "Qty BO", true),
        ("KCZB8AFD00C36F845A6715442", "Valor Confirmado", true),
        ("KCZA9D6BCB37DDC4CFD5A793B", "Qty Confirinv", true),
        ("KCZF90BF9555FB749DF9AC0DD", "Qty En Preparacion", true),
        ("KCZB6013F9BB1AA840E860741", "Qty Facturada", true),
        ("KCZ99DCD133A13F9D1408CD69", "Qty Solicitada", true),
        ("KCZF14889264B14B86AC3BFDE", "Valor BO", true),
        ("KCZ5F74283906DBF4CD07A5CA", "Valor Confirinv", true),
        ("KCZFA7C12055DC98403D10CAA", "Valor OrdAbiertas (Con Inv)", true),
        ("KCZC4CE47BAD42C81EA5B0D0F", "Valor Preparacion", true),
        ("KCZ998098F004AB32E2511CF5", "Qty Confirmada", true),
        ("KCZ95857413FCAF0B77113DCF", "Valor Solicitado", true),
    ];

    DatasetSpec {
        dataset_id: "orders".into(),
        display_name: "Sales orders".into(),
        entity_set: "RPZA64281B20A8D0329C26607QueryResults".into(),
        select: mapping.iter().map(|(f, _, _)| f.to_string()).collect(),
        static_filter: vec![
            Predicate::text_at_least(FISCAL_PERIOD_FIELD, "2025-01"),
            Predicate::timestamp_at_least("CDOC_CREATED_DT", midnight(2025, 1, 1)),
        ],
        window_bounds: None,
        page_size: 15_000,
        strategy: LoadStrategy::Replace,
        schema: TableSchema {
            table: "sap_byd_ordenes".into(),
            columns: mapping
                .iter()
                .map(|(field, name, numeric)| {
                    let kind = if *numeric {
                        ColumnKind::Float
                    } else {
                        ColumnKind::unbounded_text()
                    };
                    ColumnSpec::field(name, field, kind)
                })
                .collect(),
            period_column: None,
        },
        negated_columns: Vec::new(),
    }
}

pub fn product_cost_dataset() -> DatasetSpec {
    DatasetSpec {
        dataset_id: "product-cost".into(),
        display_name: "Product cost".into(),
        entity_set: "RPZ2A3214DFBC04E0DEE943B3QueryResults".into(),
        // CSETOFBKS only participates in the filter
        select: fields(&["CMATERIAL", "TMATERIAL", "CPERMEST", "TPERMEST", "CSETOFBKS", "FCVALPCOMP"]),
        static_filter: vec![
            Predicate::equals("CPERMEST", "250"),
            Predicate::equals("CSETOFBKS", "ZC01"),
        ],
        window_bounds: None,
        page_size: 18_000,
        strategy: LoadStrategy::Replace,
        schema: TableSchema {
            table: "sap_byd_costo_producto".into(),
            columns: vec![
                ColumnSpec::field("Material", "CMATERIAL", ColumnKind::unbounded_text()),
                ColumnSpec::field("TMATERIAL", "TMATERIAL", ColumnKind::unbounded_text()),
                ColumnSpec::field("CPERMEST", "CPERMEST", ColumnKind::unbounded_text()),
                ColumnSpec::field("TPERMEST", "TPERMEST", ColumnKind::unbounded_text()),
                ColumnSpec::field("FCVALPCOMP", "FCVALPCOMP", ColumnKind::Float),
            ],
            period_column: None,
        },
        negated_columns: Vec::new(),
    }
}

pub fn third_party_logistics_dataset() -> DatasetSpec {
    let select = [
        "CRELEASE_STATUS",
        "TRELEASE_STATUS",
        "CBUSINEERENCEF1ACB9534604A4D9",
        "CRELEASERENCE79EA4F7FDF174CDF",
        "CSTATUSERENCE8E2BEDA58262A7C0",
        "TSTATUSERENCE8E2BEDA58262A7C0",
        "CIDCONTERENCEFD3F50267033877F",
        "CPRODUCERENCE961D56D7A61936A0",
        "KCREQUESERENCEE7C71585BF4BFCEE",
        "CBUSINEERENCEBC7B6311A522DAAC",
    ];
    DatasetSpec {
        dataset_id: "3pl".into(),
        display_name: "3PL releases".into(),
        entity_set: "RPZ8FD31E1E09C6489CFC1FE8QueryResults".into(),
        select: fields(&select),
        static_filter: vec![
            Predicate::equals("CBUSINEERENCEBC7B6311A522DAAC", "114"),
            Predicate::timestamp_at_least("CRELEASERENCE79EA4F7FDF174CDF", midnight(2025, 12, 1)),
        ],
        window_bounds: None,
        page_size: 5_000,
        strategy: LoadStrategy::Replace,
        schema: TableSchema {
            table: "sap_byd_3pl".into(),
            columns: passthrough_columns(&select, &["KCREQUESERENCEE7C71585BF4BFCEE"]),
            period_column: None,
        },
        negated_columns: Vec::new(),
    }
}

pub fn goods_delivery_dataset() -> DatasetSpec {
    let select = [
        "CID_TRANSPORTADORA_01",
        "CID_UBICACION_01",
        "CID_VERIFICACION_01",
        "CID_VEHICULO_01",
        "CID_FECHAPRIMERACITA",
        "CID_CAJAS_01",
        "CID_CITAS_ADICIONAL_01",
        "CID_CITAS_01",
        "CID_CONDUCTOR_01",
        "CID_CSAP_01",
        "CID_CUMPLIMIENTO_01",
        "CID_DIAS_ENTREGA_01",
        "CID_DIAS_SBD_01",
        "CID_ENTREGA_01",
        "CID_ESTADO_01",
        "CID_FE_01",
        "CID_FECHA_ENTREGA_01",
        "CID_FECHATRANSDESTINO",
        "CID_FGUIA_01",
        "CID_GUIA_01",
        "CID_HORA_ENTREGA_01",
        "CID_HUACALES_01",
        "CID_INDICADOR_01",
        "CID_MENTREGA_01",
        "CID_MOTIVOATRASO",
        "CID_NOMBRE_ENTREGA_01",
        "CID_NOMBRE_RECIBE_01",
        "CID_NOVEDAD_01",
        "CIBR_SLO_UUID",
        "CID_PLACAS_01",
        "CID_PROM_SERVICIO_01",
        "CID_RCSAP_01",
        "CDOC_INV_DATE",
    ];
    DatasetSpec {
        dataset_id: "goods-delivery".into(),
        display_name: "Goods delivery".into(),
        entity_set: "RPZ4E72B90D164D5C8BA4A7E9QueryResults".into(),
        select: fields(&select),
        static_filter: vec![Predicate::timestamp_at_least("CDOC_INV_DATE", midnight(2025, 12, 1))],
        window_bounds: None,
        page_size: 5_000,
        strategy: LoadStrategy::Replace,
        schema: TableSchema {
            table: "sap_byd_entrega_mercancia".into(),
            columns: passthrough_columns(&select, &[]),
            period_column: None,
        },
        negated_columns: Vec::new(),
    }
}

/// Every dataset the loader knows, in processing order.
pub fn builtin_datasets() -> Vec<DatasetSpec> {
    vec![
        sales_dataset(),
        orders_dataset(),
        product_cost_dataset(),
        third_party_logistics_dataset(),
        goods_delivery_dataset(),
    ]
}

pub fn dataset_for_id(dataset_id: &str) -> Option<DatasetSpec> {
    match dataset_id {
        "sales" => Some(sales_dataset()),
        "orders" => Some(orders_dataset()),
        "product-cost" => Some(product_cost_dataset()),
        "3pl" => Some(third_party_logistics_dataset()),
        "goods-delivery" => Some(goods_delivery_dataset()),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetEntry {
    pub dataset_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// `Ok(None)` when the file does not exist.
pub fn load_dataset_registry(path: impl AsRef<Path>) -> Result<Option<DatasetRegistry>> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "no dataset registry; using built-in datasets");
        return Ok(None);
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(registry))
}

/// Enabled datasets in registry order; without a registry, all built-ins.
pub fn resolve_enabled_datasets(registry: Option<&DatasetRegistry>) -> Result<Vec<DatasetSpec>> {
    let Some(registry) = registry else {
        return Ok(builtin_datasets());
    };

    let mut specs = Vec::new();
    for entry in &registry.datasets {
        let mut spec = dataset_for_id(&entry.dataset_id)
            .with_context(|| format!("unknown dataset id `{}` in registry", entry.dataset_id))?;
        if !entry.enabled {
            continue;
        }
        if let Some(page_size) = entry.page_size {
            if page_size == 0 {
                bail!("dataset `{}` has page_size 0", entry.dataset_id);
            }
            spec.page_size = page_size;
        }
        specs.push(spec);
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byd_core::{WindowMode, WindowPlanner};
    use std::io::Write;

    fn auto_window() -> Window {
        WindowPlanner::new(WindowMode::Automatic).plan(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap())
    }

    #[test]
    fn sales_filter_is_bounded_by_the_window() {
        let filter = sales_dataset().filter_for(&auto_window());
        assert_eq!(
            filter.render(),
            "(CPOSTDATE ge datetime'2025-12-01T00:00:00') and (CDSR_PROC_CATID ne 'CA_2') and (CFISCALDDATES6F44DC8D81C7C41F le '01.2026')"
        );
    }

    #[test]
    fn sales_filter_has_no_upper_bound_in_manual_mode() {
        let start = midnight(2026, 1, 1);
        let window = WindowPlanner::new(WindowMode::manual_from_tags(start, &["01.2026"]).unwrap())
            .plan(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        let filter = sales_dataset().filter_for(&window);
        assert_eq!(filter.predicates.len(), 2);
        assert!(!filter
            .predicates
            .iter()
            .any(|p| matches!(p, Predicate::PeriodAtMost { .. })));
        assert!(filter.render().starts_with("(CPOSTDATE ge datetime'2026-01-01T00:00:00')"));
    }

    #[test]
    fn replace_datasets_ignore_the_window() {
        let window = auto_window();
        let cost = product_cost_dataset().query_for(&window);
        assert_eq!(cost.filter.render(), "(CPERMEST eq '250') and (CSETOFBKS eq 'ZC01')");
        assert_eq!(cost.page_size, 18_000);
        assert_eq!(cost.offset, 0);
    }

    #[test]
    fn every_field_column_is_selected() {
        for spec in builtin_datasets() {
            for column in &spec.schema.columns {
                if let byd_core::ColumnSource::Field(field) = &column.source {
                    assert!(
                        spec.select.contains(field),
                        "{}: column {} reads unselected field {}",
                        spec.dataset_id,
                        column.name,
                        field
                    );
                }
            }
        }
    }

    #[test]
    fn only_sales_reconciles_and_negates() {
        let sales = sales_dataset();
        assert_eq!(sales.strategy, LoadStrategy::Reconcile);
        assert_eq!(sales.schema.period_index(), sales.schema.column_index("FiscalMonthYear"));
        for column in &sales.negated_columns {
            assert!(sales.schema.column_index(column).is_some());
        }
        for spec in builtin_datasets().into_iter().skip(1) {
            assert_eq!(spec.strategy, LoadStrategy::Replace, "{}", spec.dataset_id);
            assert!(spec.negated_columns.is_empty());
        }
    }

    #[test]
    fn catalog_lookup_matches_builtin_ids() {
        for spec in builtin_datasets() {
            assert_eq!(dataset_for_id(&spec.dataset_id), Some(spec));
        }
        assert!(dataset_for_id("inventory").is_none());
    }

    #[test]
    fn registry_controls_enablement_order_and_page_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "datasets:\n  - dataset_id: orders\n    page_size: 500\n  - dataset_id: sales\n  - dataset_id: 3pl\n    enabled: false\n"
        )
        .unwrap();

        let registry = load_dataset_registry(file.path()).unwrap().unwrap();
        let specs = resolve_enabled_datasets(Some(&registry)).unwrap();
        let ids: Vec<_> = specs.iter().map(|s| s.dataset_id.as_str()).collect();
        assert_eq!(ids, vec!["orders", "sales"]);
        assert_eq!(specs[0].page_size, 500);
        assert_eq!(specs[1].page_size, 10_000);
    }

    #[test]
    fn registry_rejects_unknown_ids_and_zero_page_size() {
        let unknown: DatasetRegistry =
            serde_yaml::from_str("datasets:\n  - dataset_id: inventory\n").unwrap();
        assert!(resolve_enabled_datasets(Some(&unknown)).is_err());

        let zero: DatasetRegistry =
            serde_yaml::from_str("datasets:\n  - dataset_id: sales\n    page_size: 0\n").unwrap();
        assert!(resolve_enabled_datasets(Some(&zero)).is_err());
    }

    #[test]
    fn missing_registry_means_all_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = load_dataset_registry(dir.path().join("datasets.yaml")).unwrap();
        assert!(registry.is_none());
        assert_eq!(resolve_enabled_datasets(None).unwrap().len(), 5);
    }
}
