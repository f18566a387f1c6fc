use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Error taxonomy shared by every simlab crate.
///
/// Callers match on the variant: `Configuration` for bad inputs at call
/// entry, `State` for lifecycle preconditions (results/summaries requested
/// before they were produced), `SummaryNotTabular` for summarizer output
/// that cannot be written as a table, `Unsupported` for execution paths the
/// pipeline refuses to take.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("invalid bundle state: {0}")]
    State(String),
    #[error("summary metrics must be tabular: {0}")]
    SummaryNotTabular(String),
    #[error("unsupported execution path: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub fn summary_not_tabular(msg: impl Into<String>) -> Self {
        Error::SummaryNotTabular(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Small column-ordered tabular dataset.
///
/// One `Table` holds the parameter rows or per-replicate output of a
/// simulation step. Cells are `serde_json::Value` so caller-defined columns
/// pass through untouched; rendering to CSV happens only at persistence
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a one-row table, preserving the given column order.
    pub fn single_row(cells: Vec<(&str, Value)>) -> Self {
        let columns = cells.iter().map(|(name, _)| name.to_string()).collect();
        let row = cells.into_iter().map(|(_, value)| value).collect();
        Self {
            columns,
            rows: vec![row],
        }
    }

    /// Build a table column-wise. All columns must have the same length.
    pub fn from_columns(columns: Vec<(String, Vec<Value>)>) -> Result<Self> {
        let n_rows = columns.first().map(|(_, values)| values.len()).unwrap_or(0);
        for (name, values) in &columns {
            if values.len() != n_rows {
                return Err(Error::configuration(format!(
                    "column '{}' has {} values, expected {}",
                    name,
                    values.len(),
                    n_rows
                )));
            }
        }
        let names = columns.iter().map(|(name, _)| name.clone()).collect();
        let mut rows = vec![Vec::with_capacity(columns.len()); n_rows];
        for (_, values) in columns {
            for (row, value) in rows.iter_mut().zip(values) {
                row.push(value);
            }
        }
        Ok(Self {
            columns: names,
            rows,
        })
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::configuration(format!(
                "row has {} cells, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell lookup by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(col)
    }

    /// Copy of row `index` as a one-row table with the same columns.
    pub fn row(&self, index: usize) -> Option<Table> {
        self.rows.get(index).map(|row| Table {
            columns: self.columns.clone(),
            rows: vec![row.clone()],
        })
    }

    /// Render the table as CSV with a header line.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let header: Vec<String> = self.columns.iter().map(|c| csv_field_str(c)).collect();
        out.push_str(&header.join(","));
        out.push('\n');
        for row in &self.rows {
            let fields: Vec<String> = row.iter().map(csv_field).collect();
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }

    /// Interpret a JSON value as a table.
    ///
    /// Accepted encodings: an array of row objects, or an object mapping
    /// column names to equal-length value arrays. Anything else is rejected
    /// with `SummaryNotTabular`.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => {
                let mut names: BTreeSet<String> = BTreeSet::new();
                let mut objects = Vec::with_capacity(items.len());
                for item in items {
                    let obj = item.as_object().ok_or_else(|| {
                        Error::summary_not_tabular("array rows must be objects")
                    })?;
                    names.extend(obj.keys().cloned());
                    objects.push(obj);
                }
                if names.is_empty() {
                    return Err(Error::summary_not_tabular("no columns in value"));
                }
                let columns: Vec<String> = names.into_iter().collect();
                let mut table = Table::new(columns.clone());
                for obj in objects {
                    let row = columns
                        .iter()
                        .map(|c| obj.get(c).cloned().unwrap_or(Value::Null))
                        .collect();
                    table.push_row(row)?;
                }
                Ok(table)
            }
            Value::Object(map) => {
                if map.is_empty() {
                    return Err(Error::summary_not_tabular("no columns in value"));
                }
                let mut columns = Vec::with_capacity(map.len());
                for (name, values) in map {
                    let values = values.as_array().ok_or_else(|| {
                        Error::summary_not_tabular(format!(
                            "column '{}' is not an array of values",
                            name
                        ))
                    })?;
                    columns.push((name.clone(), values.clone()));
                }
                Table::from_columns(columns)
                    .map_err(|e| Error::summary_not_tabular(e.to_string()))
            }
            other => Err(Error::summary_not_tabular(format!(
                "expected rows or columns, got {}",
                json_type_name(other)
            ))),
        }
    }

    /// Encode the table as an array of row objects.
    pub fn to_value(&self) -> Value {
        let rows: Vec<Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (name, value) in self.columns.iter().zip(row) {
                    obj.insert(name.clone(), value.clone());
                }
                Value::Object(obj)
            })
            .collect();
        Value::Array(rows)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => csv_field_str(s),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => csv_field_str(&other.to_string()),
    }
}

fn csv_field_str(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') || raw.contains('\r') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Provenance tag for one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Created,
    Duplicated,
    Executed,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Created => "created",
            BundleStatus::Duplicated => "duplicated",
            BundleStatus::Executed => "executed",
        }
    }
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of state for one simulation experiment step.
///
/// Inputs hold one row per replicate. `results` and `summary_metrics` are
/// absent until the execution and summarization stages populate them; the
/// accessors fail with a `State` error rather than handing out an empty
/// placeholder.
#[derive(Debug, Clone)]
pub struct SimulationBundle {
    inputs: Table,
    step_number: u32,
    baseline_params: Arc<Value>,
    status: BundleStatus,
    results: Option<BTreeMap<u64, Table>>,
    summary_metrics: Option<BTreeMap<u64, Value>>,
}

impl SimulationBundle {
    pub fn new(inputs: Table, step_number: u32, baseline_params: Arc<Value>) -> Self {
        Self {
            inputs,
            step_number,
            baseline_params,
            status: BundleStatus::Created,
            results: None,
            summary_metrics: None,
        }
    }

    /// Copy of `source` at the same step, sharing its baseline parameters.
    ///
    /// The clone carries no results or summaries regardless of what the
    /// source held.
    pub fn duplicate_from(source: &SimulationBundle) -> Self {
        Self {
            inputs: source.inputs.clone(),
            step_number: source.step_number,
            baseline_params: Arc::clone(&source.baseline_params),
            status: BundleStatus::Duplicated,
            results: None,
            summary_metrics: None,
        }
    }

    pub fn inputs(&self) -> &Table {
        &self.inputs
    }

    pub fn step_number(&self) -> u32 {
        self.step_number
    }

    pub fn baseline_params(&self) -> &Value {
        &self.baseline_params
    }

    pub fn baseline_params_handle(&self) -> Arc<Value> {
        Arc::clone(&self.baseline_params)
    }

    pub fn status(&self) -> BundleStatus {
        self.status
    }

    pub fn has_results(&self) -> bool {
        self.results.is_some()
    }

    pub fn has_summary_metrics(&self) -> bool {
        self.summary_metrics.is_some()
    }

    pub fn results(&self) -> Result<&BTreeMap<u64, Table>> {
        self.results
            .as_ref()
            .ok_or_else(|| Error::state("no simulation results to write"))
    }

    pub fn summary_metrics(&self) -> Result<&BTreeMap<u64, Value>> {
        self.summary_metrics
            .as_ref()
            .ok_or_else(|| Error::state("no summary metrics to write"))
    }

    /// Install execution output and mark the bundle executed.
    pub fn set_results(&mut self, results: BTreeMap<u64, Table>) {
        self.results = Some(results);
        self.status = BundleStatus::Executed;
    }

    pub fn set_summary_metrics(&mut self, summary_metrics: BTreeMap<u64, Value>) {
        self.summary_metrics = Some(summary_metrics);
    }

    /// Replicate ids in input order, taken from the `simulation` column when
    /// it holds integers, falling back to the row index.
    pub fn replicate_ids(&self) -> Vec<u64> {
        (0..self.inputs.n_rows())
            .map(|idx| {
                self.inputs
                    .get(idx, "simulation")
                    .and_then(Value::as_u64)
                    .unwrap_or(idx as u64)
            })
            .collect()
    }

    /// Per-replicate input rows, keyed by replicate id.
    pub fn writer_inputs(&self) -> BTreeMap<u64, Table> {
        self.replicate_ids()
            .into_iter()
            .enumerate()
            .filter_map(|(idx, id)| self.inputs.row(idx).map(|row| (id, row)))
            .collect()
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write via a temp file in the same directory, then rename into place.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of a JSON value under canonical (key-sorted) serialization.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("sha256:{}", sha256_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_table() -> Table {
        let mut table = Table::new(vec!["simulation".to_string(), "beta".to_string()]);
        table.push_row(vec![json!(0), json!(0.25)]).expect("row 0");
        table.push_row(vec![json!(1), json!(0.5)]).expect("row 1");
        table
    }

    #[test]
    fn csv_rendering_quotes_only_when_needed() {
        let table = Table::single_row(vec![
            ("name", json!("a,b")),
            ("note", json!("plain")),
            ("blank", Value::Null),
            ("n", json!(3)),
        ]);
        assert_eq!(table.to_csv(), "name,note,blank,n\n\"a,b\",plain,,3\n");
    }

    #[test]
    fn csv_rendering_doubles_embedded_quotes() {
        let table = Table::single_row(vec![("q", json!("say \"hi\""))]);
        assert_eq!(table.to_csv(), "q\n\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn from_value_accepts_row_objects() {
        let value = json!([
            {"simulation": 0, "beta": 0.25},
            {"simulation": 1, "beta": 0.5}
        ]);
        let table = Table::from_value(&value).expect("rows");
        assert_eq!(table.n_rows(), 2);
        assert_eq!(table.get(1, "beta"), Some(&json!(0.5)));
    }

    #[test]
    fn from_value_accepts_column_arrays() {
        let value = json!({"beta": [0.25, 0.5], "simulation": [0, 1]});
        let table = Table::from_value(&value).expect("columns");
        assert_eq!(table.n_rows(), 2);
        assert_eq!(table.get(0, "simulation"), Some(&json!(0)));
    }

    #[test]
    fn from_value_rejects_scalars_and_ragged_columns() {
        assert!(matches!(
            Table::from_value(&json!(42)),
            Err(Error::SummaryNotTabular(_))
        ));
        assert!(matches!(
            Table::from_value(&json!({"mean": 0.5})),
            Err(Error::SummaryNotTabular(_))
        ));
        assert!(matches!(
            Table::from_value(&json!({"a": [1, 2], "b": [1]})),
            Err(Error::SummaryNotTabular(_))
        ));
    }

    #[test]
    fn value_round_trip_preserves_cells() {
        let table = sample_table();
        let back = Table::from_value(&table.to_value()).expect("round trip");
        assert_eq!(back.n_rows(), table.n_rows());
        assert_eq!(back.get(0, "beta"), table.get(0, "beta"));
    }

    #[test]
    fn push_row_enforces_arity() {
        let mut table = Table::new(vec!["a".to_string(), "b".to_string()]);
        let err = table.push_row(vec![json!(1)]).expect_err("arity");
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn duplicated_bundle_shares_baseline_and_copies_inputs() {
        let baseline = Arc::new(json!({"r0": 2.5}));
        let source = SimulationBundle::new(sample_table(), 3, Arc::clone(&baseline));
        let copy = SimulationBundle::duplicate_from(&source);
        assert_eq!(copy.status(), BundleStatus::Duplicated);
        assert_eq!(copy.step_number(), 3);
        assert_eq!(copy.inputs(), source.inputs());
        assert!(Arc::ptr_eq(
            &copy.baseline_params_handle(),
            &source.baseline_params_handle()
        ));
        assert!(!copy.has_results());
    }

    #[test]
    fn result_accessors_fail_before_population() {
        let bundle = SimulationBundle::new(sample_table(), 0, Arc::new(json!({})));
        assert!(matches!(bundle.results(), Err(Error::State(_))));
        assert!(matches!(bundle.summary_metrics(), Err(Error::State(_))));
    }

    #[test]
    fn set_results_marks_bundle_executed() {
        let mut bundle = SimulationBundle::new(sample_table(), 0, Arc::new(json!({})));
        let mut results = BTreeMap::new();
        results.insert(0u64, sample_table());
        bundle.set_results(results);
        assert_eq!(bundle.status(), BundleStatus::Executed);
        assert!(bundle.results().is_ok());
    }

    #[test]
    fn replicate_ids_come_from_simulation_column() {
        let table = Table::from_columns(vec![
            ("simulation".to_string(), vec![json!(4), json!(7)]),
            ("randomSeed".to_string(), vec![json!(1), json!(2)]),
        ])
        .expect("table");
        let bundle = SimulationBundle::new(table, 0, Arc::new(json!({})));
        assert_eq!(bundle.replicate_ids(), vec![4, 7]);
        let inputs = bundle.writer_inputs();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[&7].get(0, "randomSeed"), Some(&json!(2)));
    }

    #[test]
    fn canonical_digest_is_stable_across_insertion_order() {
        let a = json!({"beta": 0.5, "alpha": 1});
        let b = json!({"alpha": 1, "beta": 0.5});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert!(canonical_json_digest(&a).starts_with("sha256:"));
    }
}
