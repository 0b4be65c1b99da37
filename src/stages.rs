//! Stage contracts: typed outputs and the agent interface.
//!
//! Each stage is a function from typed input to typed output whose
//! implementation delegates reasoning to a language model. The orchestrator
//! depends only on the [`QueryAgents`] trait, so tests substitute
//! deterministic fakes.

use crate::error::{PipelineError, Result};
use crate::llm::{strip_code_fences, LlmClient};
use crate::prompts;
use crate::schema::SchemaDescriptor;
use crate::taxonomy;
use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkedForeignKey {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

/// Subset of the schema relevant to one question, produced by schema linking
/// and consumed by every later stage as schema context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkedSchema {
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub foreign_keys: Vec<LinkedForeignKey>,
    #[serde(default)]
    pub reasoning: String,
}

impl LinkedSchema {
    pub fn to_prompt_context(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            let columns = self
                .columns
                .get(table)
                .map(|cols| cols.join(", "))
                .unwrap_or_default();
            out.push_str(&format!("TABLE {} ({})\n", table, columns));
        }
        if !self.foreign_keys.is_empty() {
            out.push_str("FOREIGN KEYS:\n");
            for fk in &self.foreign_keys {
                out.push_str(&format!("  {} -> {}\n", fk.from, fk.to));
            }
        }
        out
    }

    pub fn summary(&self) -> String {
        format!(
            "Linked {} table(s): {}",
            self.tables.len(),
            self.tables.iter().join(", ")
        )
    }
}

/// Per-clause intent breakdown. Optional clauses are simply absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subproblems {
    #[serde(default)]
    pub clauses: BTreeMap<String, String>,
}

impl Subproblems {
    pub fn to_prompt_context(&self) -> String {
        if self.clauses.is_empty() {
            return "(no clause breakdown)\n".to_string();
        }
        let mut out = String::new();
        for (clause, intent) in &self.clauses {
            out.push_str(&format!("{}: {}\n", clause, intent));
        }
        out
    }

    pub fn summary(&self) -> String {
        format!(
            "{} clause(s): {}",
            self.clauses.len(),
            self.clauses.keys().join(", ")
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub step_number: u32,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub sql_fragment: Option<String>,
}

/// Ordered derivation toward the final query. Step order is significant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPlan {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub final_strategy: String,
}

impl QueryPlan {
    pub fn to_prompt_context(&self) -> String {
        if self.steps.is_empty() {
            return "(no plan)\n".to_string();
        }
        let mut out = String::new();
        for step in &self.steps {
            out.push_str(&format!(
                "{}. {} ({})\n",
                step.step_number, step.action, step.reasoning
            ));
            if let Some(fragment) = &step.sql_fragment {
                out.push_str(&format!("   SQL: {}\n", fragment));
            }
        }
        if !self.final_strategy.is_empty() {
            out.push_str(&format!("Strategy: {}\n", self.final_strategy));
        }
        out
    }

    pub fn summary(&self) -> String {
        format!("{} step(s)", self.steps.len())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionSteps {
    /// Steps arrive as strings or small objects depending on the model; kept
    /// tolerant and rendered as text.
    #[serde(default)]
    pub steps: Vec<serde_json::Value>,
}

/// Diagnosis of a failed execution: taxonomy categories, root cause, and the
/// planned fix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionPlan {
    #[serde(default)]
    pub error_categories: Vec<String>,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub correction_plan: CorrectionSteps,
    #[serde(default)]
    pub sql_before: Option<String>,
    #[serde(default)]
    pub sql_after: Option<String>,
}

impl CorrectionPlan {
    pub fn to_prompt_context(&self) -> String {
        let mut out = String::new();
        if !self.error_categories.is_empty() {
            out.push_str(&format!("Categories: {}\n", self.error_categories.join(", ")));
        }
        if !self.root_cause.is_empty() {
            out.push_str(&format!("Root cause: {}\n", self.root_cause));
        }
        for (idx, step) in self.correction_plan.steps.iter().enumerate() {
            let text = match step {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("{}. {}\n", idx + 1, text));
        }
        if let (Some(before), Some(after)) = (&self.sql_before, &self.sql_after) {
            out.push_str(&format!("Replace: {}\nWith:    {}\n", before, after));
        }
        if out.is_empty() {
            out.push_str("(no structured plan; fix the query against the error text)\n");
        }
        out
    }

    pub fn summary(&self) -> String {
        if self.error_categories.is_empty() {
            "Correction planned".to_string()
        } else {
            format!("Diagnosed: {}", self.error_categories.join(", "))
        }
    }
}

/// One method per stage. Generation methods return plain SQL text; structured
/// methods return parsed stage outputs. A `Parse` error from a structured
/// method is the signal the orchestrator's degradation policy keys off.
#[async_trait]
pub trait QueryAgents: Send + Sync {
    async fn link_schema(
        &self,
        question: &str,
        schema: &SchemaDescriptor,
    ) -> Result<LinkedSchema>;

    async fn decompose(&self, question: &str, linked: &LinkedSchema) -> Result<Subproblems>;

    async fn plan_query(
        &self,
        question: &str,
        linked: &LinkedSchema,
        subproblems: &Subproblems,
    ) -> Result<QueryPlan>;

    async fn generate_sql(
        &self,
        question: &str,
        plan: &QueryPlan,
        linked: &LinkedSchema,
    ) -> Result<String>;

    async fn plan_correction(
        &self,
        question: &str,
        failed_sql: &str,
        error: &str,
        linked: &LinkedSchema,
        augmentation: &str,
    ) -> Result<CorrectionPlan>;

    async fn correct_sql(
        &self,
        question: &str,
        failed_sql: &str,
        plan: &CorrectionPlan,
        linked: &LinkedSchema,
    ) -> Result<String>;
}

/// The production implementation: builds prompts, calls the model client,
/// parses and validates the output.
pub struct LlmAgents {
    llm: LlmClient,
    catalog: String,
}

impl LlmAgents {
    pub fn new(llm: LlmClient, catalog: String) -> Self {
        Self { llm, catalog }
    }

    fn parse_structured<T: for<'de> Deserialize<'de>>(stage: &str, raw: &str) -> Result<T> {
        let cleaned = strip_code_fences(raw);
        serde_json::from_str(&cleaned).map_err(|e| {
            PipelineError::parse(stage, format!("{}. Response: {}", e, cleaned))
        })
    }

    /// Keep only linked tables that exist in the snapshot, fixing case drift
    /// against the real names. An empty result falls back to the full table
    /// list so downstream stages always have schema context.
    fn validate_linked(schema: &SchemaDescriptor, mut linked: LinkedSchema) -> LinkedSchema {
        let known = schema.table_names();
        let mut fixed = Vec::new();
        for table in linked.tables.drain(..) {
            if known.contains(&table) {
                fixed.push(table);
                continue;
            }
            match known
                .iter()
                .find(|k| k.eq_ignore_ascii_case(&table))
            {
                Some(actual) => {
                    warn!("Schema linking returned '{}', fixed to '{}'", table, actual);
                    if let Some(cols) = linked.columns.remove(&table) {
                        linked.columns.insert(actual.clone(), cols);
                    }
                    fixed.push(actual.clone());
                }
                None => warn!("Schema linking returned unknown table '{}', dropped", table),
            }
        }
        if fixed.is_empty() {
            warn!("Schema linking produced no usable tables, falling back to full schema");
            fixed = known;
            linked.columns = schema
                .tables
                .iter()
                .map(|(t, cols)| (t.clone(), cols.iter().map(|c| c.name.clone()).collect()))
                .collect();
        }
        linked.tables = fixed;
        linked
    }
}

#[async_trait]
impl QueryAgents for LlmAgents {
    async fn link_schema(
        &self,
        question: &str,
        schema: &SchemaDescriptor,
    ) -> Result<LinkedSchema> {
        let prompt = prompts::schema_linking(question, &schema.to_prompt_context());
        let raw = self.llm.complete(&prompt, true).await?;
        let linked: LinkedSchema = Self::parse_structured("schema", &raw)?;
        Ok(Self::validate_linked(schema, linked))
    }

    async fn decompose(&self, question: &str, linked: &LinkedSchema) -> Result<Subproblems> {
        let prompt = prompts::subproblem(question, &linked.to_prompt_context());
        let raw = self.llm.complete(&prompt, true).await?;
        Self::parse_structured("subproblem", &raw)
    }

    async fn plan_query(
        &self,
        question: &str,
        linked: &LinkedSchema,
        subproblems: &Subproblems,
    ) -> Result<QueryPlan> {
        let prompt = prompts::query_plan(
            question,
            &linked.to_prompt_context(),
            &subproblems.to_prompt_context(),
        );
        let raw = self.llm.complete(&prompt, true).await?;
        Self::parse_structured("queryplan", &raw)
    }

    async fn generate_sql(
        &self,
        question: &str,
        plan: &QueryPlan,
        linked: &LinkedSchema,
    ) -> Result<String> {
        let prompt = prompts::sql_generation(
            question,
            &plan.to_prompt_context(),
            &linked.to_prompt_context(),
            &self.catalog,
        );
        let raw = self.llm.complete(&prompt, false).await?;
        Ok(strip_code_fences(&raw))
    }

    async fn plan_correction(
        &self,
        question: &str,
        failed_sql: &str,
        error: &str,
        linked: &LinkedSchema,
        augmentation: &str,
    ) -> Result<CorrectionPlan> {
        let prompt = prompts::correction_plan(
            question,
            failed_sql,
            error,
            &linked.to_prompt_context(),
            &taxonomy::taxonomy_table(),
            augmentation,
        );
        let raw = self.llm.complete(&prompt, true).await?;
        let plan: CorrectionPlan = Self::parse_structured("correction", &raw)?;
        for category in &plan.error_categories {
            if !taxonomy::is_known_category(category) {
                warn!("Correction plan used unknown category '{}'", category);
            }
        }
        Ok(plan)
    }

    async fn correct_sql(
        &self,
        question: &str,
        failed_sql: &str,
        plan: &CorrectionPlan,
        linked: &LinkedSchema,
    ) -> Result<String> {
        let prompt = prompts::correction_sql(
            question,
            failed_sql,
            &plan.to_prompt_context(),
            &linked.to_prompt_context(),
            &self.catalog,
        );
        let raw = self.llm.complete(&prompt, false).await?;
        Ok(strip_code_fences(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linked_schema_parses_contract_shape() {
        let raw = r#"{
            "tables": ["customers"],
            "columns": {"customers": ["CustomerId", "Country"]},
            "foreign_keys": [{"from": "orders.CustomerId", "to": "customers.CustomerId"}],
            "reasoning": "the question is about customers"
        }"#;
        let linked: LinkedSchema = serde_json::from_str(raw).unwrap();
        assert_eq!(linked.tables, vec!["customers"]);
        assert_eq!(linked.foreign_keys[0].to, "customers.CustomerId");
        assert!(linked.to_prompt_context().contains("TABLE customers"));
    }

    #[test]
    fn test_partial_json_degrades_to_defaults() {
        // Missing keys must not fail the parse; absent clauses are simply empty.
        let subproblems: Subproblems = serde_json::from_str("{}").unwrap();
        assert!(subproblems.clauses.is_empty());

        let plan: QueryPlan = serde_json::from_str(r#"{"steps": []}"#).unwrap();
        assert!(plan.final_strategy.is_empty());
        assert_eq!(plan.to_prompt_context(), "(no plan)\n");
    }

    #[test]
    fn test_correction_plan_tolerates_mixed_step_shapes() {
        let raw = r#"{
            "error_categories": ["schema_link.col_missing"],
            "root_cause": "column name typo",
            "correction_plan": {"steps": ["rename Countr to Country", {"fix": "requote"}]}
        }"#;
        let plan: CorrectionPlan = serde_json::from_str(raw).unwrap();
        let rendered = plan.to_prompt_context();
        assert!(rendered.contains("1. rename Countr to Country"));
        assert!(rendered.contains("2. "));
        assert_eq!(plan.summary(), "Diagnosed: schema_link.col_missing");
    }

    #[test]
    fn test_validate_linked_fixes_case_and_drops_unknown() {
        let db = crate::db::Database::open_in_memory("db").unwrap();
        db.with_conn(|conn| {
            conn.execute("CREATE TABLE db.customers (id INTEGER)", [])
                .map_err(Into::into)
        })
        .unwrap();
        let schema = SchemaDescriptor::snapshot(&db).unwrap();

        let linked = LinkedSchema {
            tables: vec!["Customers".to_string(), "ghosts".to_string()],
            columns: [("Customers".to_string(), vec!["id".to_string()])]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let validated = LlmAgents::validate_linked(&schema, linked);
        assert_eq!(validated.tables, vec!["customers"]);
        assert_eq!(validated.columns["customers"], vec!["id"]);
    }

    #[test]
    fn test_validate_linked_falls_back_to_full_schema() {
        let db = crate::db::Database::open_in_memory("db").unwrap();
        db.with_conn(|conn| {
            conn.execute("CREATE TABLE db.orders (OrderId INTEGER)", [])
                .map_err(Into::into)
        })
        .unwrap();
        let schema = SchemaDescriptor::snapshot(&db).unwrap();

        let validated = LlmAgents::validate_linked(&schema, LinkedSchema::default());
        assert_eq!(validated.tables, vec!["orders"]);
        assert_eq!(validated.columns["orders"], vec!["OrderId"]);
    }

    #[test]
    fn test_parse_structured_strips_fences_and_reports_stage() {
        let fenced = "```json\n{\"clauses\": {\"SELECT\": \"all columns\"}}\n```";
        let parsed: Subproblems = LlmAgents::parse_structured("subproblem", fenced).unwrap();
        assert_eq!(parsed.clauses["SELECT"], "all columns");

        let err = LlmAgents::parse_structured::<Subproblems>("subproblem", "not json").unwrap_err();
        assert!(err.is_parse());
        assert!(err.to_string().contains("subproblem"));
    }
}
