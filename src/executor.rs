//! SQL Executor
//!
//! Runs a generated query against the attached catalog and reports rows or a
//! structured failure. The engine's error text is carried verbatim: the
//! correction stage parses it, so it must never be altered, truncated, or
//! re-worded.

use crate::db::Database;
use crate::schema::SchemaDescriptor;
use regex::Regex;
use rusqlite::types::ValueRef;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::{debug, info};

/// Largest integer magnitude a double (and therefore JSON consumers that read
/// numbers as doubles) can represent exactly.
const MAX_SAFE_INTEGER: u64 = 1 << 53;

#[derive(Debug, Clone, Serialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    /// Ordered records, one object per row mapping column -> value.
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryFailure {
    /// Raw engine error text, verbatim.
    pub error: String,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone)]
pub enum ExecutionResult {
    Success(QueryRows),
    Failure(QueryFailure),
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn error_text(&self) -> Option<&str> {
        match self {
            ExecutionResult::Success(_) => None,
            ExecutionResult::Failure(f) => Some(&f.error),
        }
    }
}

#[derive(Clone)]
pub struct SqlExecutor {
    db: Database,
}

impl SqlExecutor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Execute one query. A database-level error is an expected, first-class
    /// outcome, not an `Err`.
    pub fn execute(&self, sql: &str) -> ExecutionResult {
        debug!("Executing: {}", sql);
        let start = Instant::now();

        let outcome = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> =
                stmt.column_names().iter().map(|c| c.to_string()).collect();

            let mut rows_out = Vec::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut record = Map::new();
                for (idx, column) in columns.iter().enumerate() {
                    record.insert(column.clone(), json_value(row.get_ref(idx)?));
                }
                rows_out.push(Value::Object(record));
            }
            Ok((columns, rows_out))
        });

        let execution_time_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok((columns, rows)) => {
                let row_count = rows.len();
                info!("Query returned {} rows in {}ms", row_count, execution_time_ms);
                ExecutionResult::Success(QueryRows {
                    columns,
                    rows,
                    row_count,
                    execution_time_ms,
                })
            }
            Err(e) => {
                info!("Query failed in {}ms: {}", execution_time_ms, e);
                ExecutionResult::Failure(QueryFailure {
                    error: match e {
                        crate::error::PipelineError::Database(msg) => msg,
                        other => other.to_string(),
                    },
                    execution_time_ms,
                })
            }
        }
    }

    /// Best-effort live column probe for the correction stage. Failure here
    /// must never abort a correction, so the caller treats `None` as "no
    /// augmentation available".
    pub fn probe_table_columns(&self, table: &str) -> Option<Vec<String>> {
        SchemaDescriptor::probe_columns(&self.db, table).ok()
    }
}

/// Convert one engine value for the result payload. 64-bit integers beyond
/// the double-exact range leave as decimal strings so downstream transports
/// cannot lose precision.
fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => {
            if v.unsigned_abs() > MAX_SAFE_INTEGER {
                Value::String(v.to_string())
            } else {
                Value::Number(v.into())
            }
        }
        ValueRef::Real(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Table named by an engine error, e.g. `no such table: db.customersx`.
pub fn extract_missing_table(error: &str) -> Option<String> {
    let re = Regex::new(r"no such table:\s*(?:[A-Za-z_][A-Za-z0-9_]*\.)?([A-Za-z_][A-Za-z0-9_]*)")
        .ok()?;
    re.captures(error).map(|c| c[1].to_string())
}

/// Column named by an engine error, e.g. `no such column: Countr`.
pub fn extract_missing_column(error: &str) -> Option<String> {
    let re = Regex::new(
        r"no such column:\s*(?:[A-Za-z_][A-Za-z0-9_]*\.)*([A-Za-z_][A-Za-z0-9_]*)",
    )
    .ok()?;
    re.captures(error).map(|c| c[1].to_string())
}

/// A `Did you mean "X"?` suggestion embedded in engine error text. The name
/// comes back exactly as the engine spelled it, case preserved.
pub fn extract_suggested_name(error: &str) -> Option<String> {
    let re = Regex::new(r#"[Dd]id you mean\s+["'`]?([A-Za-z_][A-Za-z0-9_]*)"#).ok()?;
    re.captures(error).map(|c| c[1].to_string())
}

/// Rank candidate column names by similarity to a missing one, best first.
pub fn rank_similar_columns(target: &str, candidates: &[String]) -> Vec<String> {
    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .map(|c| (strsim::jaro_winkler(&target.to_lowercase(), &c.to_lowercase()), c))
        .filter(|(score, _)| *score >= 0.6)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(5).map(|(_, c)| c.clone()).collect()
}
