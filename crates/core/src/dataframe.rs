//! Column-oriented dataframe
//!
//! The table type that flows between pipeline nodes: named, typed, nullable
//! columns keyed by an epoch-millisecond `timestamp` column, plus free-form
//! metadata. Frames are immutable once published as artifacts; all operations
//! here produce new frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{ArtifactKind, DataSchema};

/// Name of the mandatory time column.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Name of the signal column on signals frames.
pub const SIGNAL_COLUMN: &str = "signal";

/// Canonical OHLCV column set produced by data loaders.
pub const OHLCV_COLUMNS: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

/// Typed, nullable column storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "dtype", content = "values")]
pub enum ColumnData {
    /// 64-bit integers (timestamps, signals, counts)
    Int(Vec<Option<i64>>),
    /// 64-bit floats (prices, indicator values)
    Float(Vec<Option<f64>>),
    /// UTF-8 strings (symbols, labels)
    Str(Vec<Option<String>>),
}

impl ColumnData {
    /// Number of rows in the column.
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int(values) => values.len(),
            ColumnData::Float(values) => values.len(),
            ColumnData::Str(values) => values.len(),
        }
    }

    /// True when the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `index` as a float, casting integers.
    pub fn float_at(&self, index: usize) -> Option<f64> {
        match self {
            ColumnData::Int(values) => values.get(index).copied().flatten().map(|v| v as f64),
            ColumnData::Float(values) => values.get(index).copied().flatten(),
            ColumnData::Str(_) => None,
        }
    }

    /// Keep only the rows at `indices`, in order.
    fn take(&self, indices: &[usize]) -> ColumnData {
        match self {
            ColumnData::Int(values) => {
                ColumnData::Int(indices.iter().map(|&i| values[i]).collect())
            }
            ColumnData::Float(values) => {
                ColumnData::Float(indices.iter().map(|&i| values[i]).collect())
            }
            ColumnData::Str(values) => {
                ColumnData::Str(indices.iter().map(|&i| values[i].clone()).collect())
            }
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name, unique within a frame
    pub name: String,
    /// Row values
    pub data: ColumnData,
}

impl Column {
    /// Create a column.
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// A timestamp-keyed table with named columns and free-form metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    columns: Vec<Column>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

impl DataFrame {
    /// Empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frame from columns; all columns must have equal length and
    /// unique names.
    pub fn from_columns(columns: Vec<Column>) -> Result<Self, String> {
        if let Some(first) = columns.first() {
            let len = first.data.len();
            for column in &columns {
                if column.data.len() != len {
                    return Err(format!(
                        "column '{}' has {} rows, expected {len}",
                        column.name,
                        column.data.len()
                    ));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(format!("duplicate column '{}'", column.name));
            }
        }
        Ok(Self {
            columns,
            metadata: BTreeMap::new(),
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    /// True when the frame has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// True if the frame carries the named column.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Append a column; length must match and the name must be new.
    pub fn add_column(&mut self, name: impl Into<String>, data: ColumnData) -> Result<(), String> {
        let name = name.into();
        if self.has_column(&name) {
            return Err(format!("duplicate column '{name}'"));
        }
        if !self.columns.is_empty() && data.len() != self.len() {
            return Err(format!(
                "column '{name}' has {} rows, expected {}",
                data.len(),
                self.len()
            ));
        }
        self.columns.push(Column::new(name, data));
        Ok(())
    }

    /// Column values as floats, casting integers; `None` when the column is
    /// missing or non-numeric.
    pub fn float_values(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let column = self.column(name)?;
        match &column.data {
            ColumnData::Str(_) => None,
            data => Some((0..data.len()).map(|i| data.float_at(i)).collect()),
        }
    }

    /// The timestamp column as non-null epoch milliseconds.
    pub fn timestamps(&self) -> Result<Vec<i64>, String> {
        let column = self
            .column(TIMESTAMP_COLUMN)
            .ok_or_else(|| format!("frame has no '{TIMESTAMP_COLUMN}' column"))?;
        match &column.data {
            ColumnData::Int(values) => values
                .iter()
                .enumerate()
                .map(|(i, v)| v.ok_or_else(|| format!("null timestamp at row {i}")))
                .collect(),
            _ => Err(format!("'{TIMESTAMP_COLUMN}' column is not integer-typed")),
        }
    }

    /// Frame metadata.
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Insert a metadata entry.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// New frame with only the rows at `indices`, in order. Metadata is kept.
    pub fn select_rows(&self, indices: &[usize]) -> DataFrame {
        DataFrame {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.data.take(indices)))
                .collect(),
            metadata: self.metadata.clone(),
        }
    }

    /// New frame keeping rows whose timestamp lies in `[start, end]`
    /// (either bound optional).
    pub fn filter_by_timestamp(
        &self,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<DataFrame, String> {
        let timestamps = self.timestamps()?;
        let indices: Vec<usize> = timestamps
            .iter()
            .enumerate()
            .filter(|(_, &ts)| {
                start.map_or(true, |s| ts >= s) && end.map_or(true, |e| ts <= e)
            })
            .map(|(i, _)| i)
            .collect();
        Ok(self.select_rows(&indices))
    }

    /// New frame sorted ascending by timestamp.
    pub fn sort_by_timestamp(&self) -> Result<DataFrame, String> {
        let timestamps = self.timestamps()?;
        let mut indices: Vec<usize> = (0..timestamps.len()).collect();
        indices.sort_by_key(|&i| timestamps[i]);
        Ok(self.select_rows(&indices))
    }

    /// Inner-join two frames on timestamp: returns both frames restricted to
    /// their shared timestamps, sorted ascending.
    pub fn align_on_timestamp(
        &self,
        other: &DataFrame,
    ) -> Result<(DataFrame, DataFrame), String> {
        let left_ts = self.timestamps()?;
        let right_ts = other.timestamps()?;
        let right_index: std::collections::HashMap<i64, usize> = right_ts
            .iter()
            .enumerate()
            .map(|(i, &ts)| (ts, i))
            .collect();

        let mut pairs: Vec<(i64, usize, usize)> = left_ts
            .iter()
            .enumerate()
            .filter_map(|(li, &ts)| right_index.get(&ts).map(|&ri| (ts, li, ri)))
            .collect();
        pairs.sort_by_key(|&(ts, _, _)| ts);

        let left_indices: Vec<usize> = pairs.iter().map(|&(_, li, _)| li).collect();
        let right_indices: Vec<usize> = pairs.iter().map(|&(_, _, ri)| ri).collect();
        Ok((
            self.select_rows(&left_indices),
            other.select_rows(&right_indices),
        ))
    }

    /// Schema of this frame under the given artifact kind.
    pub fn schema(&self, kind: ArtifactKind) -> DataSchema {
        DataSchema {
            kind,
            columns: self.columns.iter().map(|c| c.name.clone()).collect(),
        }
    }
}
