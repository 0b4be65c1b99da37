//! Pipeline Orchestrator / Correction Loop
//!
//! One instance per incoming question. Sequences the five generation stages,
//! executes the resulting SQL, and on failure runs the bounded
//! retry/correction cycle:
//!
//! SchemaLinking -> Subproblem -> QueryPlan -> SqlGeneration -> Executing
//! -> Done on success, or Correcting -> Executing until the attempt ceiling.
//!
//! Every stage emits a start event before work begins and a complete/error
//! event after, so an observer never sees a state silently disappear.

use crate::config::RunConfig;
use crate::db::Database;
use crate::error::Result;
use crate::events::{EventEmitter, Stage};
use crate::executor::{
    extract_missing_column, extract_missing_table, extract_suggested_name, rank_similar_columns,
    ExecutionResult, QueryRows, SqlExecutor,
};
use crate::rewrite::qualify_tables;
use crate::schema::SchemaDescriptor;
use crate::stages::{CorrectionPlan, LinkedSchema, QueryAgents, QueryPlan, Subproblems};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Final result of one run, for callers that want more than the event stream.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub sql: String,
    pub attempts: u8,
    pub rows: Option<QueryRows>,
    pub error: Option<String>,
}

/// Live state of the execute/correct cycle. At most one query is live at a
/// time; the attempt counter only ever increases.
struct RunState {
    sql: String,
    attempts: u8,
}

pub struct Pipeline {
    agents: Arc<dyn QueryAgents>,
    db: Database,
    executor: SqlExecutor,
    emitter: EventEmitter,
    config: RunConfig,
}

impl Pipeline {
    pub fn new(
        agents: Arc<dyn QueryAgents>,
        db: Database,
        emitter: EventEmitter,
        config: RunConfig,
    ) -> Self {
        let executor = SqlExecutor::new(db.clone());
        Self {
            agents,
            db,
            executor,
            emitter,
            config,
        }
    }

    /// Run the full pipeline for one question. The returned outcome mirrors
    /// the terminal event; fatal errors surface as `success: false` with no
    /// attempts.
    pub async fn run(&self, question: &str) -> RunOutcome {
        if let Err(e) = self.config.validate(question) {
            return self.fatal(&e.to_string());
        }

        info!("Pipeline run started: {}", question);

        // Schema linking. Enumeration and linking failures are both fatal:
        // nothing downstream can work without schema context.
        self.emitter.agent_start(Stage::Schema);
        let schema = match SchemaDescriptor::snapshot(&self.db) {
            Ok(schema) => schema,
            Err(e) => {
                let msg = e.to_string();
                self.emitter.agent_error(Stage::Schema, &msg);
                return self.fatal(&msg);
            }
        };
        let linked = match self.agents.link_schema(question, &schema).await {
            Ok(linked) => linked,
            Err(e) => {
                let msg = e.to_string();
                self.emitter.agent_error(Stage::Schema, &msg);
                return self.fatal(&msg);
            }
        };
        self.emitter.agent_complete(Stage::Schema, &linked.summary());

        // Subproblem decomposition: malformed output degrades to an empty
        // breakdown, the run continues.
        self.emitter.agent_start(Stage::Subproblem);
        let subproblems = match self.agents.decompose(question, &linked).await {
            Ok(subproblems) => {
                self.emitter
                    .agent_complete(Stage::Subproblem, &subproblems.summary());
                subproblems
            }
            Err(e) if e.is_parse() => {
                warn!("Subproblem stage degraded: {}", e);
                self.emitter.agent_error(Stage::Subproblem, &e.to_string());
                Subproblems::default()
            }
            Err(e) => {
                let msg = e.to_string();
                self.emitter.agent_error(Stage::Subproblem, &msg);
                return self.fatal(&msg);
            }
        };

        // Query planning: same degradation policy.
        self.emitter.agent_start(Stage::Queryplan);
        let plan = match self.agents.plan_query(question, &linked, &subproblems).await {
            Ok(plan) => {
                self.emitter.agent_complete(Stage::Queryplan, &plan.summary());
                plan
            }
            Err(e) if e.is_parse() => {
                warn!("Query plan stage degraded: {}", e);
                self.emitter.agent_error(Stage::Queryplan, &e.to_string());
                QueryPlan::default()
            }
            Err(e) => {
                let msg = e.to_string();
                self.emitter.agent_error(Stage::Queryplan, &msg);
                return self.fatal(&msg);
            }
        };

        // SQL generation.
        self.emitter.agent_start(Stage::Sql);
        let sql = match self.generate(question, &plan, &linked).await {
            Ok(sql) => sql,
            Err(e) => {
                let msg = e.to_string();
                self.emitter.agent_error(Stage::Sql, &msg);
                return self.fatal(&msg);
            }
        };
        self.emitter.agent_complete(Stage::Sql, &sql);

        self.execute_with_corrections(question, &linked, sql).await
    }

    async fn generate(
        &self,
        question: &str,
        plan: &QueryPlan,
        linked: &LinkedSchema,
    ) -> Result<String> {
        let raw = self.agents.generate_sql(question, plan, linked).await?;
        qualify_tables(&raw, &self.config.catalog)
    }

    /// The execute/correct cycle. The ceiling counts total execution
    /// attempts: generate, execute(1), correct, execute(2), correct,
    /// execute(3), stop.
    async fn execute_with_corrections(
        &self,
        question: &str,
        linked: &LinkedSchema,
        sql: String,
    ) -> RunOutcome {
        let mut state = RunState { sql, attempts: 0 };

        loop {
            state.attempts += 1;
            info!("Execution attempt {} of {}", state.attempts, self.config.max_attempts);
            self.emitter.agent_start(Stage::Execute);

            let failure = match self.executor.execute(&state.sql) {
                ExecutionResult::Success(rows) => {
                    self.emitter.agent_complete(
                        Stage::Execute,
                        &format!("{} row(s) in {}ms", rows.row_count, rows.execution_time_ms),
                    );
                    let results = serde_json::to_value(&rows).unwrap_or(serde_json::Value::Null);
                    self.emitter.complete(true, &state.sql, results, state.attempts);
                    return RunOutcome {
                        success: true,
                        sql: state.sql,
                        attempts: state.attempts,
                        rows: Some(rows),
                        error: None,
                    };
                }
                ExecutionResult::Failure(failure) => failure,
            };

            self.emitter.agent_error(Stage::Execute, &failure.error);

            if state.attempts >= self.config.max_attempts {
                info!("Attempt ceiling reached, giving up");
                self.emitter.complete(
                    false,
                    &state.sql,
                    json!({"error": failure.error}),
                    state.attempts,
                );
                return RunOutcome {
                    success: false,
                    sql: state.sql,
                    attempts: state.attempts,
                    rows: None,
                    error: Some(failure.error),
                };
            }

            // Correction: diagnose, rewrite, go around again.
            self.emitter.agent_start(Stage::Correction);
            let augmentation = self.build_augmentation(&failure.error, linked);

            let plan = match self
                .agents
                .plan_correction(question, &state.sql, &failure.error, linked, &augmentation)
                .await
            {
                Ok(plan) => plan,
                Err(e) if e.is_parse() => {
                    warn!("Correction plan degraded: {}", e);
                    CorrectionPlan::default()
                }
                Err(e) => {
                    let msg = e.to_string();
                    self.emitter.agent_error(Stage::Correction, &msg);
                    return self.fatal_with_state(&msg, state);
                }
            };

            let corrected = match self
                .agents
                .correct_sql(question, &state.sql, &plan, linked)
                .await
            {
                Ok(sql) => qualify_tables(&sql, &self.config.catalog),
                Err(e) => Err(e),
            };
            let corrected = match corrected {
                Ok(sql) => sql,
                Err(e) => {
                    let msg = e.to_string();
                    self.emitter.agent_error(Stage::Correction, &msg);
                    return self.fatal_with_state(&msg, state);
                }
            };

            self.emitter.agent_complete(Stage::Correction, &plan.summary());
            self.emitter.agent_update(Stage::Sql, &corrected);
            state.sql = corrected;
        }
    }

    /// Assemble best-effort live metadata for the correction prompt. Probing
    /// failure is swallowed: it only means no augmentation.
    fn build_augmentation(&self, error: &str, linked: &LinkedSchema) -> String {
        let mut lines = Vec::new();

        if let Some(suggested) = extract_suggested_name(error) {
            lines.push(format!(
                "The engine suggests the exact name: {} (use it verbatim, case preserved)",
                suggested
            ));
        }

        if let Some(table) = extract_missing_table(error) {
            if let Some(columns) = self.executor.probe_table_columns(&table) {
                lines.push(format!("Columns of {}: {}", table, columns.join(", ")));
            }
        }

        if let Some(column) = extract_missing_column(error) {
            for table in &linked.tables {
                let live = self
                    .executor
                    .probe_table_columns(table)
                    .or_else(|| linked.columns.get(table).cloned());
                if let Some(candidates) = live {
                    let ranked = rank_similar_columns(&column, &candidates);
                    if !ranked.is_empty() {
                        lines.push(format!(
                            "Closest columns to '{}' in {}: {}",
                            column,
                            table,
                            ranked.join(", ")
                        ));
                    }
                }
            }
        }

        lines.join("\n")
    }

    fn fatal(&self, message: &str) -> RunOutcome {
        self.emitter.error(message);
        RunOutcome {
            success: false,
            sql: String::new(),
            attempts: 0,
            rows: None,
            error: Some(message.to_string()),
        }
    }

    fn fatal_with_state(&self, message: &str, state: RunState) -> RunOutcome {
        self.emitter.error(message);
        RunOutcome {
            success: false,
            sql: state.sql,
            attempts: state.attempts,
            rows: None,
            error: Some(message.to_string()),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("catalog", &self.config.catalog)
            .field("model", &self.config.model)
            .field("max_attempts", &self.config.max_attempts)
            .finish()
    }
}
