//! Run logging.
//!
//! Structured per-run query log: a bounded in-memory ring for the API
//! surface plus optional JSONL append to disk. One entry per pipeline run.

use crate::error::{PipelineError, Result};
use crate::pipeline::RunOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub query_id: String,
    pub question: String,
    pub sql_generated: Option<String>,
    pub success: bool,
    pub attempts: u8,
    pub rows_returned: Option<u64>,
    pub error_message: Option<String>,
}

impl QueryLogEntry {
    pub fn from_outcome(question: &str, outcome: &RunOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            query_id: uuid::Uuid::new_v4().to_string(),
            question: question.to_string(),
            sql_generated: if outcome.sql.is_empty() {
                None
            } else {
                Some(outcome.sql.clone())
            },
            success: outcome.success,
            attempts: outcome.attempts,
            rows_returned: outcome.rows.as_ref().map(|r| r.row_count as u64),
            error_message: outcome.error.clone(),
        }
    }
}

/// Query logger: in-memory ring plus optional file append.
#[derive(Clone)]
pub struct RunLogger {
    log_file: Option<PathBuf>,
    entries: Arc<Mutex<Vec<QueryLogEntry>>>,
    max_in_memory: usize,
}

impl RunLogger {
    pub fn new(log_file: Option<PathBuf>, max_in_memory: usize) -> Self {
        Self {
            log_file,
            entries: Arc::new(Mutex::new(Vec::new())),
            max_in_memory,
        }
    }

    pub fn log(&self, entry: QueryLogEntry) -> Result<()> {
        {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| PipelineError::Execution("Log mutex poisoned".to_string()))?;
            entries.push(entry.clone());
            if entries.len() > self.max_in_memory {
                entries.remove(0);
            }
        }

        if let Some(ref log_file) = self.log_file {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .map_err(|e| {
                    PipelineError::Execution(format!("Failed to open log file: {}", e))
                })?;
            let json = serde_json::to_string(&entry)?;
            writeln!(file, "{}", json)
                .map_err(|e| PipelineError::Execution(format!("Failed to write log: {}", e)))?;
        }

        Ok(())
    }

    pub fn recent(&self, limit: usize) -> Vec<QueryLogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for RunLogger {
    fn default() -> Self {
        Self::new(None, 1000)
    }
}
