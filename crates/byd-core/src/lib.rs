//! Core domain model for the ByDesign analytics loader: raw entries, typed rows,
//! table schemas and the reload window.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod window;

pub use window::{FiscalPeriod, PeriodParseError, Window, WindowMode, WindowPlanner};

pub const CRATE_NAME: &str = "byd-core";

/// One entry of a source page, field name to textual value, exactly as received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    fields: BTreeMap<String, String>,
}

impl RawEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawEntry {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A typed cell. `Float(NaN)` marks a numeric value that could not be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    Float(f64),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            Value::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    pub fn is_unparsable(&self) -> bool {
        matches!(self, Value::Float(v) if v.is_nan())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Text { max_width: Option<usize> },
    Float,
}

impl ColumnKind {
    pub const fn text(max_width: usize) -> Self {
        ColumnKind::Text {
            max_width: Some(max_width),
        }
    }

    pub const fn unbounded_text() -> Self {
        ColumnKind::Text { max_width: None }
    }

    /// Sentinel used when the source omits the field: absence means empty text
    /// or zero, never null.
    pub fn absent_default(&self) -> &'static str {
        match self {
            ColumnKind::Text { .. } => "",
            ColumnKind::Float => "0",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnSource {
    /// Read from the named source field.
    Field(String),
    /// Same literal for every row.
    Constant(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub source: ColumnSource,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn field(name: &str, source_key: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            source: ColumnSource::Field(source_key.to_string()),
            kind,
        }
    }

    pub fn constant(name: &str, value: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            source: ColumnSource::Constant(value.to_string()),
            kind,
        }
    }
}

/// Declared structure of a sink table plus the mapping from source fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub period_column: Option<String>,
}

impl TableSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn period_index(&self) -> Option<usize> {
        self.period_column
            .as_deref()
            .and_then(|name| self.column_index(name))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// One typed record, values positionally aligned with its `TableSchema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(Value::as_text)
    }

    pub fn float(&self, index: usize) -> Option<f64> {
        self.get(index).and_then(Value::as_float)
    }
}

/// Rows gathered across every page of one run, in extraction order.
pub type Batch = Vec<Row>;

/// Truncate to at most `width` characters (not bytes).
pub fn truncate_chars(value: &str, width: usize) -> String {
    match value.char_indices().nth(width) {
        Some((byte_idx, _)) => value[..byte_idx].to_string(),
        None => value.to_string(),
    }
}
