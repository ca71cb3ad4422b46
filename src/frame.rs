use std::collections::{HashMap, HashSet};
use std::fmt;

use anyhow::{Result, anyhow, bail};
use chrono::NaiveDate;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int64,
    Float64,
    Utf8,
    Bool,
}

impl ColumnType {
    /// Narrowest type both sides fit in. Mixed numerics widen to float,
    /// anything else that disagrees falls back to text.
    pub fn unify(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Int64, Float64) | (Float64, Int64) => Float64,
            _ => Utf8,
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Int64 | ColumnType::Bool => "INTEGER",
            ColumnType::Float64 => "REAL",
            ColumnType::Utf8 => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(ColumnType::Int64),
            Value::Float(_) => Some(ColumnType::Float64),
            Value::Text(_) => Some(ColumnType::Utf8),
            Value::Bool(_) => Some(ColumnType::Bool),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            Value::Text(s) => s.trim().parse::<i64>().ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Null | Value::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Calendar date from `YYYY-MM-DD`, optionally followed by a time part.
    pub fn as_date(&self) -> Option<NaiveDate> {
        let raw = self.as_str()?.trim();
        let day = raw.get(..10).unwrap_or(raw);
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }

    pub fn from_json(v: &JsonValue) -> Value {
        match v {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    /// Converts into `kind`. Only widening conversions are meaningful;
    /// values that cannot be represented become null.
    pub fn coerce(self, kind: ColumnType) -> Value {
        match (self, kind) {
            (Value::Null, _) => Value::Null,
            (Value::Int(v), ColumnType::Int64) => Value::Int(v),
            (Value::Int(v), ColumnType::Float64) => Value::Float(v as f64),
            (Value::Float(v), ColumnType::Float64) => Value::Float(v),
            (Value::Bool(b), ColumnType::Bool) => Value::Bool(b),
            (Value::Text(s), ColumnType::Utf8) => Value::Text(s),
            (v, ColumnType::Utf8) => Value::Text(v.to_string()),
            (v, ColumnType::Int64) => v.as_i64().map(Value::Int).unwrap_or(Value::Null),
            (v, ColumnType::Float64) => v.as_f64().map(Value::Float).unwrap_or(Value::Null),
            (Value::Text(s), ColumnType::Bool) => match s.trim() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => Value::Null,
            },
            (v, ColumnType::Bool) => v.as_i64().map(|n| Value::Bool(n != 0)).unwrap_or(Value::Null),
        }
    }

    /// Stable textual form used for key comparison and partition names.
    pub fn key_repr(&self) -> String {
        match self {
            Value::Null => "__null__".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Row-major table with a fixed, typed schema. Every cell either matches its
/// column's type or is `Value::Null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Builds a frame from a list of JSON objects. Columns appear in first-seen
    /// key order; a column's type is the unification of its non-null values.
    pub fn from_json_records(records: &[JsonValue]) -> Frame {
        let mut order: Vec<String> = Vec::new();
        let mut kinds: HashMap<String, Option<ColumnType>> = HashMap::new();
        let mut parsed: Vec<HashMap<&str, Value>> = Vec::with_capacity(records.len());

        for record in records {
            let Some(obj) = record.as_object() else {
                continue;
            };
            let mut row = HashMap::with_capacity(obj.len());
            for (key, raw) in obj {
                let value = Value::from_json(raw);
                let slot = kinds.entry(key.clone()).or_insert_with(|| {
                    order.push(key.clone());
                    None
                });
                if let Some(kind) = value.column_type() {
                    *slot = Some(match *slot {
                        Some(existing) => existing.unify(kind),
                        None => kind,
                    });
                }
                row.insert(key.as_str(), value);
            }
            parsed.push(row);
        }

        let columns = order
            .iter()
            .map(|name| {
                let kind = kinds.get(name).copied().flatten().unwrap_or(ColumnType::Utf8);
                Column::new(name.clone(), kind)
            })
            .collect::<Vec<_>>();

        let rows = parsed
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .map(|col| {
                        row.remove(col.name.as_str())
                            .unwrap_or(Value::Null)
                            .coerce(col.kind)
                    })
                    .collect()
            })
            .collect();

        Frame { columns, rows }
    }

    /// Builds a frame from untyped rows, inferring each column's type from
    /// its non-null values.
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Frame> {
        let mut kinds: Vec<Option<ColumnType>> = vec![None; names.len()];
        for row in &rows {
            if row.len() != names.len() {
                bail!("row has {} values but {} column names", row.len(), names.len());
            }
            for (slot, value) in kinds.iter_mut().zip(row) {
                if let Some(kind) = value.column_type() {
                    *slot = Some(slot.map_or(kind, |k| k.unify(kind)));
                }
            }
        }
        let columns = names
            .into_iter()
            .zip(kinds)
            .map(|(name, kind)| Column::new(name, kind.unwrap_or(ColumnType::Utf8)))
            .collect::<Vec<_>>();
        let mut frame = Frame::new(columns);
        for row in rows {
            frame.push_row(row)?;
        }
        Ok(frame)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            bail!(
                "row has {} values but frame has {} columns",
                row.len(),
                self.columns.len()
            );
        }
        let row = row
            .into_iter()
            .zip(&self.columns)
            .map(|(v, col)| v.coerce(col.kind))
            .collect();
        self.rows.push(row);
        Ok(())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    pub fn column_values<'a>(&'a self, column: &str) -> Option<impl Iterator<Item = &'a Value>> {
        let idx = self.column_index(column)?;
        Some(self.rows.iter().map(move |r| &r[idx]))
    }

    /// Adds `name` filled with `fill` when the frame does not have it yet.
    pub fn ensure_column(&mut self, name: &str, kind: ColumnType, fill: Value) {
        if self.has_column(name) {
            return;
        }
        self.columns.push(Column::new(name, kind));
        let fill = fill.coerce(kind);
        for row in &mut self.rows {
            row.push(fill.clone());
        }
    }

    pub fn filter(&self, mut keep: impl FnMut(&[Value]) -> bool) -> Frame {
        Frame {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    /// Concatenates frames, unioning their schemas by column name.
    pub fn concat(frames: Vec<Frame>) -> Frame {
        let mut columns: Vec<Column> = Vec::new();
        for frame in &frames {
            for col in &frame.columns {
                match columns.iter_mut().find(|c| c.name == col.name) {
                    Some(existing) => existing.kind = existing.kind.unify(col.kind),
                    None => columns.push(col.clone()),
                }
            }
        }

        let mut rows = Vec::with_capacity(frames.iter().map(Frame::len).sum());
        for frame in frames {
            let mapping = columns
                .iter()
                .map(|c| frame.column_index(&c.name))
                .collect::<Vec<_>>();
            for mut row in frame.rows {
                let out = mapping
                    .iter()
                    .zip(&columns)
                    .map(|(idx, col)| match idx {
                        Some(i) => std::mem::replace(&mut row[*i], Value::Null).coerce(col.kind),
                        None => Value::Null,
                    })
                    .collect();
                rows.push(out);
            }
        }

        Frame { columns, rows }
    }

    pub fn key_indices(&self, key: &[&str]) -> Result<Vec<usize>> {
        key.iter()
            .map(|name| {
                self.column_index(name)
                    .ok_or_else(|| anyhow!("frame has no key column `{name}`"))
            })
            .collect()
    }

    pub fn row_key(row: &[Value], indices: &[usize]) -> Vec<String> {
        indices.iter().map(|i| row[*i].key_repr()).collect()
    }

    /// Rows of `self` whose key also appears in `newer` are dropped, then all
    /// of `newer` is appended.
    pub fn merge_by_key(self, newer: Frame, key: &[&str]) -> Result<Frame> {
        if self.columns.is_empty() {
            return Ok(newer);
        }
        let new_idx = newer.key_indices(key)?;
        let replaced = newer
            .rows
            .iter()
            .map(|r| Frame::row_key(r, &new_idx))
            .collect::<HashSet<_>>();
        let old_idx = self.key_indices(key)?;
        let kept = self.filter(|r| !replaced.contains(&Frame::row_key(r, &old_idx)));
        Ok(Frame::concat(vec![kept, newer]))
    }

    /// Distinct non-null integers of `column`, ascending.
    pub fn distinct_i64(&self, column: &str) -> Vec<i64> {
        let Some(values) = self.column_values(column) else {
            return Vec::new();
        };
        let mut out = values.filter_map(Value::as_i64).collect::<Vec<_>>();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Keeps the first occurrence of every key.
    pub fn dedup_by_key(&self, key: &[&str]) -> Result<Frame> {
        let idx = self.key_indices(key)?;
        let mut seen = HashSet::new();
        Ok(self.filter(|r| seen.insert(Frame::row_key(r, &idx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_records_union_keys_and_widen_types() {
        let frame = Frame::from_json_records(&[
            json!({"No": 1, "Points": 3}),
            json!({"No": 2, "Points": 2.5, "Name": "x"}),
        ]);
        assert_eq!(frame.column_names(), vec!["No", "Points", "Name"]);
        assert_eq!(frame.columns()[1].kind, ColumnType::Float64);
        assert_eq!(frame.value(0, "Points"), Some(&Value::Float(3.0)));
        assert_eq!(frame.value(0, "Name"), Some(&Value::Null));
    }

    #[test]
    fn merge_by_key_prefers_newer_rows() {
        let old = Frame::from_json_records(&[json!({"No": 1, "v": "a"}), json!({"No": 2, "v": "b"})]);
        let new = Frame::from_json_records(&[json!({"No": 2, "v": "c"})]);
        let merged = old.merge_by_key(new, &["No"]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.value(1, "v"), Some(&Value::Text("c".into())));
    }

    #[test]
    fn dates_accept_optional_time_suffix() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        assert_eq!(Value::Text("2026-03-14".into()).as_date(), Some(day));
        assert_eq!(Value::Text("2026-03-14T18:30:00".into()).as_date(), Some(day));
        assert_eq!(Value::Text("14/03/2026".into()).as_date(), None);
        assert_eq!(Value::Null.as_date(), None);
    }

    #[test]
    fn concat_fills_missing_columns_with_null() {
        let a = Frame::from_json_records(&[json!({"No": 1})]);
        let b = Frame::from_json_records(&[json!({"No": 2, "extra": true})]);
        let both = Frame::concat(vec![a, b]);
        assert_eq!(both.len(), 2);
        assert_eq!(both.value(0, "extra"), Some(&Value::Null));
        assert_eq!(both.value(1, "extra"), Some(&Value::Bool(true)));
    }
}
