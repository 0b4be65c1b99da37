//! End-to-end pipeline tests over deterministic fake agents and an in-memory
//! catalog. The fakes stand in for the language model; everything else (the
//! orchestrator, the rewrite, the executor, the event emitter) is the real
//! thing.

use async_trait::async_trait;
use nl2sql_engine::config::RunConfig;
use nl2sql_engine::db::Database;
use nl2sql_engine::error::{PipelineError, Result};
use nl2sql_engine::events::{EventEmitter, PipelineEvent};
use nl2sql_engine::pipeline::Pipeline;
use nl2sql_engine::schema::SchemaDescriptor;
use nl2sql_engine::stages::{
    CorrectionPlan, CorrectionSteps, LinkedSchema, PlanStep, QueryAgents, QueryPlan, Subproblems,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

/// Scripted agents: a fixed initial query, then a queue of corrections.
struct ScriptedAgents {
    initial_sql: String,
    corrections: Mutex<VecDeque<String>>,
    /// Augmentation text the correction planner was shown, for assertions.
    seen_augmentations: Mutex<Vec<String>>,
    fail_link: bool,
    fail_decompose: bool,
}

impl ScriptedAgents {
    fn new(initial_sql: &str, corrections: Vec<&str>) -> Self {
        Self {
            initial_sql: initial_sql.to_string(),
            corrections: Mutex::new(corrections.into_iter().map(String::from).collect()),
            seen_augmentations: Mutex::new(Vec::new()),
            fail_link: false,
            fail_decompose: false,
        }
    }
}

#[async_trait]
impl QueryAgents for ScriptedAgents {
    async fn link_schema(
        &self,
        _question: &str,
        schema: &SchemaDescriptor,
    ) -> Result<LinkedSchema> {
        if self.fail_link {
            return Err(PipelineError::parse("schema", "not json"));
        }
        Ok(LinkedSchema {
            tables: schema.table_names(),
            columns: schema
                .tables
                .iter()
                .map(|(t, cols)| (t.clone(), cols.iter().map(|c| c.name.clone()).collect()))
                .collect(),
            foreign_keys: Vec::new(),
            reasoning: "scripted".to_string(),
        })
    }

    async fn decompose(&self, _question: &str, _linked: &LinkedSchema) -> Result<Subproblems> {
        if self.fail_decompose {
            return Err(PipelineError::parse("subproblem", "not json"));
        }
        Ok(Subproblems {
            clauses: [
                ("SELECT".to_string(), "all customer columns".to_string()),
                ("WHERE".to_string(), "country is USA".to_string()),
            ]
            .into_iter()
            .collect(),
        })
    }

    async fn plan_query(
        &self,
        _question: &str,
        _linked: &LinkedSchema,
        _subproblems: &Subproblems,
    ) -> Result<QueryPlan> {
        Ok(QueryPlan {
            steps: vec![PlanStep {
                step_number: 1,
                action: "filter customers by country".to_string(),
                reasoning: "the question names a single table".to_string(),
                sql_fragment: None,
            }],
            final_strategy: "single-table select with a WHERE filter".to_string(),
        })
    }

    async fn generate_sql(
        &self,
        _question: &str,
        _plan: &QueryPlan,
        _linked: &LinkedSchema,
    ) -> Result<String> {
        Ok(self.initial_sql.clone())
    }

    async fn plan_correction(
        &self,
        _question: &str,
        _failed_sql: &str,
        _error: &str,
        _linked: &LinkedSchema,
        augmentation: &str,
    ) -> Result<CorrectionPlan> {
        self.seen_augmentations
            .lock()
            .unwrap()
            .push(augmentation.to_string());
        Ok(CorrectionPlan {
            error_categories: vec!["schema_link.col_missing".to_string()],
            root_cause: "column name typo".to_string(),
            correction_plan: CorrectionSteps {
                steps: vec![serde_json::json!("use the real column name")],
            },
            sql_before: None,
            sql_after: None,
        })
    }

    async fn correct_sql(
        &self,
        _question: &str,
        failed_sql: &str,
        _plan: &CorrectionPlan,
        _linked: &LinkedSchema,
    ) -> Result<String> {
        let next = self.corrections.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| failed_sql.to_string()))
    }
}

fn fixture_db() -> Database {
    let db = Database::open_in_memory("db").unwrap();
    db.with_conn(|conn| {
        conn.execute_batch(
            "CREATE TABLE db.customers (
                 CustomerId INTEGER PRIMARY KEY,
                 Name TEXT NOT NULL,
                 Country TEXT
             );
             INSERT INTO db.customers VALUES (1, 'Ada', 'USA');
             INSERT INTO db.customers VALUES (2, 'Linus', 'Finland');
             INSERT INTO db.customers VALUES (3, 'Grace', 'USA');",
        )
        .map_err(Into::into)
    })
    .unwrap();
    db
}

fn test_config() -> RunConfig {
    RunConfig::new("sk-test".to_string(), "scripted".to_string())
}

async fn run_pipeline(
    agents: ScriptedAgents,
    question: &str,
) -> (nl2sql_engine::pipeline::RunOutcome, Vec<PipelineEvent>) {
    let (emitter, rx) = EventEmitter::new();
    let pipeline = Pipeline::new(Arc::new(agents), fixture_db(), emitter, test_config());
    let outcome = pipeline.run(question).await;
    drop(pipeline);
    (outcome, drain(rx))
}

fn drain(mut rx: UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn events_for_agent<'a>(events: &'a [PipelineEvent], agent: &str) -> Vec<&'a PipelineEvent> {
    events
        .iter()
        .filter(|e| e.data.get("agent").and_then(|a| a.as_str()) == Some(agent))
        .collect()
}

#[tokio::test]
async fn test_success_on_first_attempt() {
    let agents = ScriptedAgents::new("SELECT * FROM customers WHERE Country = 'USA'", vec![]);
    let (outcome, events) = run_pipeline(agents, "List all customers from USA").await;

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 1);
    // The rewrite qualified the bare table reference.
    assert!(outcome.sql.contains("FROM db.customers"));
    assert_eq!(outcome.rows.as_ref().unwrap().row_count, 2);

    // No correction events of any kind on a first-attempt success.
    assert!(events_for_agent(&events, "correction").is_empty());

    let terminal: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "complete" || e.event_type == "error")
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].event_type, "complete");
    assert_eq!(terminal[0].data["success"], true);
    assert_eq!(terminal[0].data["attempts"], 1);
    assert_eq!(terminal[0].data["results"]["row_count"], 2);
}

#[tokio::test]
async fn test_correction_loop_recovers_on_second_attempt() {
    let agents = ScriptedAgents::new(
        "SELECT Countr FROM customers",
        vec!["SELECT Country FROM customers"],
    );
    let (outcome, events) = run_pipeline(agents, "What countries do customers live in?").await;

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 2);

    // The correction ran exactly once: start + complete.
    let correction = events_for_agent(&events, "correction");
    assert_eq!(correction.len(), 2);
    assert_eq!(correction[0].event_type, "agent_start");
    assert_eq!(correction[1].event_type, "agent_complete");

    // The SQL view was revised after the correction.
    let updates: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "agent_update")
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].data["agent"], "sql");
    assert!(updates[0].data["output"]
        .as_str()
        .unwrap()
        .contains("Country"));
}

#[tokio::test]
async fn test_attempt_ceiling_exhausted() {
    let agents = ScriptedAgents::new(
        "SELECT nope FROM customers",
        vec!["SELECT still_nope FROM customers", "SELECT nope_again FROM customers"],
    );
    let (outcome, events) = run_pipeline(agents, "doomed question").await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 3);
    assert!(outcome.error.is_some());

    // Three executions, two corrections.
    let execute_starts = events
        .iter()
        .filter(|e| {
            e.event_type == "agent_start" && e.data["agent"] == "execute"
        })
        .count();
    assert_eq!(execute_starts, 3);
    let correction_starts = events
        .iter()
        .filter(|e| {
            e.event_type == "agent_start" && e.data["agent"] == "correction"
        })
        .count();
    assert_eq!(correction_starts, 2);

    // Exhaustion terminates with a failed `complete`, not a fatal `error`.
    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, "complete");
    assert_eq!(terminal.data["success"], false);
    assert_eq!(terminal.data["attempts"], 3);
}

#[tokio::test]
async fn test_event_ordering_start_precedes_outcome() {
    let agents = ScriptedAgents::new(
        "SELECT Countr FROM customers",
        vec!["SELECT Country FROM customers"],
    );
    let (_, events) = run_pipeline(agents, "ordering check").await;

    for agent in ["schema", "subproblem", "queryplan", "sql", "execute", "correction"] {
        let agent_events = events_for_agent(&events, agent);
        if agent_events.is_empty() {
            continue;
        }
        assert_eq!(
            agent_events[0].event_type, "agent_start",
            "first event for {} must be agent_start",
            agent
        );
    }
}

#[tokio::test]
async fn test_correction_probe_suggests_similar_column() {
    let agents = ScriptedAgents::new(
        "SELECT Countr FROM customers",
        vec!["SELECT Country FROM customers"],
    );
    let (emitter, rx) = EventEmitter::new();
    let scripted = Arc::new(agents);
    let pipeline = Pipeline::new(scripted.clone(), fixture_db(), emitter, test_config());
    let outcome = pipeline.run("typo question").await;
    drop(pipeline);
    drain(rx);

    assert!(outcome.success);
    let augmentations = scripted.seen_augmentations.lock().unwrap();
    assert_eq!(augmentations.len(), 1);
    // The live probe ranked the real column as the closest match to the typo.
    assert!(augmentations[0].contains("Countr"));
    assert!(augmentations[0].contains("Country"));
}

#[tokio::test]
async fn test_missing_question_is_immediately_fatal() {
    let agents = ScriptedAgents::new("SELECT 1", vec![]);
    let (outcome, events) = run_pipeline(agents, "   ").await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "error");
}

#[tokio::test]
async fn test_missing_api_key_is_immediately_fatal() {
    let agents = ScriptedAgents::new("SELECT 1", vec![]);
    let (emitter, rx) = EventEmitter::new();
    let config = RunConfig::new(String::new(), "scripted".to_string());
    let pipeline = Pipeline::new(Arc::new(agents), fixture_db(), emitter, config);
    let outcome = pipeline.run("a real question").await;
    drop(pipeline);
    let events = drain(rx);

    assert!(!outcome.success);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "error");
}

#[tokio::test]
async fn test_schema_linking_parse_failure_is_fatal() {
    let mut agents = ScriptedAgents::new("SELECT 1", vec![]);
    agents.fail_link = true;
    let (outcome, events) = run_pipeline(agents, "question").await;

    assert!(!outcome.success);
    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, "error");
    // Nothing past schema linking ran.
    assert!(events_for_agent(&events, "sql").is_empty());
    assert!(events_for_agent(&events, "execute").is_empty());
}

#[tokio::test]
async fn test_subproblem_parse_failure_degrades_and_run_succeeds() {
    let mut agents = ScriptedAgents::new("SELECT * FROM customers", vec![]);
    agents.fail_decompose = true;
    let (outcome, events) = run_pipeline(agents, "question").await;

    assert!(outcome.success, "degraded stage must not kill the run");
    assert_eq!(outcome.attempts, 1);

    // The stage surfaced its failure instead of silently disappearing.
    let subproblem = events_for_agent(&events, "subproblem");
    assert_eq!(subproblem[0].event_type, "agent_start");
    assert_eq!(subproblem[1].event_type, "agent_error");

    // And the run still reached a successful terminal event.
    assert_eq!(events.last().unwrap().event_type, "complete");
    assert_eq!(events.last().unwrap().data["success"], true);
}
