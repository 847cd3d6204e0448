//! Tabular data model: one `Record` per completed simulation run, collected
//! into an append-only `Dataset` in completion order.

use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;

/// A numeric cell. Integers stay integers so sizes and counters print exactly.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Value::Int(v) => v == 0,
            Value::Float(v) => v == 0.0,
        }
    }

    fn total_cmp(self, other: Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(&b),
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// Configuration fields captured from a run-start marker, in capture order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunKey(IndexMap<String, i64>);

impl RunKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: i64) {
        self.0.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<i64> {
        self.0.get(field).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>> FromIterator<(K, i64)> for RunKey {
    fn from_iter<T: IntoIterator<Item = (K, i64)>>(iter: T) -> Self {
        RunKey(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Metric values accumulated for the currently open run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSet(IndexMap<String, Value>);

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a metric, overwriting any earlier value but keeping its position.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for MetricSet {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        MetricSet(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// One completed run: key fields followed by metric and derived fields.
///
/// Serializes as a single flat map.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    key: RunKey,
    metrics: MetricSet,
}

impl Record {
    pub fn new(key: RunKey, metrics: MetricSet) -> Self {
        Self { key, metrics }
    }

    /// Look up a field by name, key fields first.
    pub fn get(&self, field: &str) -> Option<Value> {
        self.key
            .get(field)
            .map(Value::Int)
            .or_else(|| self.metrics.get(field))
    }

    /// All fields in row order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, Value)> {
        self.key
            .iter()
            .map(|(k, v)| (k, Value::Int(v)))
            .chain(self.metrics.iter())
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.key.len() + self.metrics.len()))?;
        for (name, value) in self.fields() {
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }
}

/// Row predicate applied by downstream consumers. Records lacking any
/// referenced field are dropped.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    AtMost { field: String, value: f64 },
    AtLeast { field: String, value: f64 },
    FieldsEqual { left: String, right: String },
}

impl Filter {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::AtMost { field, value } => {
                record.get(field).is_some_and(|v| v.as_f64() <= *value)
            }
            Filter::AtLeast { field, value } => {
                record.get(field).is_some_and(|v| v.as_f64() >= *value)
            }
            Filter::FieldsEqual { left, right } => match (record.get(left), record.get(right)) {
                (Some(a), Some(b)) => a.total_cmp(b) == Ordering::Equal,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::AtMost { field, value } => write!(f, "{field} <= {value}"),
            Filter::AtLeast { field, value } => write!(f, "{field} >= {value}"),
            Filter::FieldsEqual { left, right } => write!(f, "{left} == {right}"),
        }
    }
}

/// Records in run-completion order. Never mutated after construction;
/// filtering and sorting return new datasets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Dataset {
    records: Vec<Record>,
}

impl Dataset {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Union of field names across all records, in first-seen order.
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for record in &self.records {
            for (name, _) in record.fields() {
                if !columns.iter().any(|c| c == name) {
                    columns.push(name.to_string());
                }
            }
        }
        columns
    }

    pub fn has_column(&self, field: &str) -> bool {
        self.records.iter().any(|r| r.get(field).is_some())
    }

    pub fn filter(&self, filter: &Filter) -> Dataset {
        self.records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Stable ascending sort on `field`; records without the field go last.
    pub fn sorted_by(&self, field: &str) -> Dataset {
        let mut records = self.records.clone();
        records.sort_by(|a, b| match (a.get(field), b.get(field)) {
            (Some(x), Some(y)) => x.total_cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        Dataset { records }
    }

    /// Partition by the value of `field`, groups in first-seen order.
    /// Records without the field are left out.
    pub fn group_by(&self, field: &str) -> Vec<(Value, Dataset)> {
        let mut groups: Vec<(Value, Dataset)> = Vec::new();
        for record in &self.records {
            let Some(value) = record.get(field) else {
                continue;
            };
            match groups.iter_mut().find(|(v, _)| *v == value) {
                Some((_, group)) => group.records.push(record.clone()),
                None => groups.push((value, Dataset::new(vec![record.clone()]))),
            }
        }
        groups
    }
}

impl FromIterator<Record> for Dataset {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Dataset::new(iter.into_iter().collect())
    }
}

impl IntoIterator for Dataset {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
