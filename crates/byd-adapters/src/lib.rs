//! Record source contract, OData query rendering and the ByDesign OData source.

use async_trait::async_trait;
use byd_core::{FiscalPeriod, RawEntry};
use byd_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod catalog;

pub use catalog::{
    builtin_datasets, dataset_for_id, load_dataset_registry, resolve_enabled_datasets,
    DatasetEntry, DatasetRegistry, DatasetSpec, LoadStrategy, WindowBounds,
};

pub const CRATE_NAME: &str = "byd-adapters";

pub const DEFAULT_ODATA_BASE_URL: &str =
    "https://my336154.sapbydesign.com/sap/byd/odata/cc_home_analytics.svc";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("malformed page payload: {0}")]
    Parse(String),
}

impl SourceError {
    pub fn is_parse(&self) -> bool {
        matches!(self, SourceError::Parse(_))
    }
}

/// One condition of an OData `$filter`; a [`Filter`] ANDs them together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    TimestampAtLeast { field: String, at: NaiveDateTime },
    Equals { field: String, value: String },
    NotEquals { field: String, value: String },
    TextAtLeast { field: String, value: String },
    PeriodAtMost { field: String, period: FiscalPeriod },
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl Predicate {
    pub fn timestamp_at_least(field: &str, at: NaiveDateTime) -> Self {
        Predicate::TimestampAtLeast {
            field: field.to_string(),
            at,
        }
    }

    pub fn equals(field: &str, value: &str) -> Self {
        Predicate::Equals {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn not_equals(field: &str, value: &str) -> Self {
        Predicate::NotEquals {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn text_at_least(field: &str, value: &str) -> Self {
        Predicate::TextAtLeast {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn period_at_most(field: &str, period: FiscalPeriod) -> Self {
        Predicate::PeriodAtMost {
            field: field.to_string(),
            period,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Predicate::TimestampAtLeast { field, at } => {
                format!("({field} ge datetime'{}')", at.format("%Y-%m-%dT%H:%M:%S"))
            }
            Predicate::Equals { field, value } => format!("({field} eq {})", quote_literal(value)),
            Predicate::NotEquals { field, value } => {
                format!("({field} ne {})", quote_literal(value))
            }
            Predicate::TextAtLeast { field, value } => {
                format!("({field} ge {})", quote_literal(value))
            }
            // The service rejects `datetime lt`; the fiscal period is the upper bound instead.
            Predicate::PeriodAtMost { field, period } => {
                format!("({field} le {})", quote_literal(&period.dotted()))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn render(&self) -> String {
        self.predicates
            .iter()
            .map(Predicate::render)
            .collect::<Vec<_>>()
            .join(" and ")
    }
}

/// One page request against a collection endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub dataset_id: String,
    pub entity_set: String,
    pub select: Vec<String>,
    pub filter: Filter,
    pub page_size: usize,
    pub offset: usize,
}

impl RecordQuery {
    pub fn at_offset(&self, offset: usize) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    /// System query options, `$skip` omitted on the first page.
    pub fn odata_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("$select".to_string(), self.select.join(","))];
        if !self.filter.is_empty() {
            params.push(("$filter".to_string(), self.filter.render()));
        }
        params.push(("$top".to_string(), self.page_size.to_string()));
        if self.offset > 0 {
            params.push(("$skip".to_string(), self.offset.to_string()));
        }
        params.push(("$format".to_string(), "json".to_string()));
        params
    }
}

/// Yields one page of raw entries per call. An empty page means no more data.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_page(&self, query: &RecordQuery) -> Result<Vec<RawEntry>, SourceError>;
}

#[derive(Debug)]
pub struct ODataSource {
    http: HttpFetcher,
    base_url: String,
    run_id: Uuid,
}

impl ODataSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            run_id,
        }
    }

    pub fn collection_url(&self, entity_set: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), entity_set)
    }
}

#[async_trait]
impl RecordSource for ODataSource {
    async fn fetch_page(&self, query: &RecordQuery) -> Result<Vec<RawEntry>, SourceError> {
        let url = self.collection_url(&query.entity_set);
        let resp = self
            .http
            .fetch_bytes(self.run_id, &query.dataset_id, &url, &query.odata_params())
            .await?;
        debug!(
            dataset_id = %query.dataset_id,
            status = %resp.status,
            url = %resp.final_url,
            bytes = resp.body.len(),
            "page fetched"
        );
        parse_odata_page(&resp.body)
    }
}

/// Decode an OData v2 JSON payload (`{"d":{"results":[..]}}` or `{"d":[..]}`).
pub fn parse_odata_page(body: &[u8]) -> Result<Vec<RawEntry>, SourceError> {
    let doc: JsonValue = serde_json::from_slice(body)
        .map_err(|e| SourceError::Parse(format!("invalid JSON: {e}")))?;
    let envelope = doc
        .get("d")
        .ok_or_else(|| SourceError::Parse("missing `d` envelope".to_string()))?;
    let results = match envelope {
        JsonValue::Array(items) => items,
        JsonValue::Object(obj) => obj
            .get("results")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| SourceError::Parse("missing `d.results` array".to_string()))?,
        _ => return Err(SourceError::Parse("`d` is neither object nor array".to_string())),
    };
    results
        .iter()
        .enumerate()
        .map(|(idx, item)| entry_from_json(idx, item))
        .collect()
}

fn entry_from_json(idx: usize, item: &JsonValue) -> Result<RawEntry, SourceError> {
    let obj = item
        .as_object()
        .ok_or_else(|| SourceError::Parse(format!("entry {idx} is not an object")))?;
    let mut entry = RawEntry::new();
    for (key, value) in obj {
        let text = match value {
            JsonValue::String(s) => odata_date_to_iso(s).unwrap_or_else(|| s.clone()),
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Bool(b) => b.to_string(),
            // present but empty, so numeric columns read it as unparsable
            JsonValue::Null => String::new(),
            // __metadata and deferred navigation links
            JsonValue::Object(_) | JsonValue::Array(_) => continue,
        };
        entry.insert(key.clone(), text);
    }
    Ok(entry)
}

/// `/Date(1764547200000)/` → `2025-12-01T00:00:00`, the Atom feed rendering.
fn odata_date_to_iso(value: &str) -> Option<String> {
    let inner = value.strip_prefix("/Date(")?.strip_suffix(")/")?;
    let digits_end = inner
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && *c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(inner.len());
    let millis: i64 = inner[..digits_end].parse().ok()?;
    let at = DateTime::from_timestamp_millis(millis)?;
    Some(at.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string())
}
