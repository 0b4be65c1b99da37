//! Prompt templates, one per agent role.
//!
//! Each template spells out the exact JSON shape the stage must return, with
//! rules and a minimal example. This is the single canonical prompt set; the
//! taxonomy table rendered into the correction prompt comes from
//! [`crate::taxonomy`].

/// Schema linking: pick the subset of the catalog relevant to one question.
pub fn schema_linking(question: &str, schema_context: &str) -> String {
    format!(
        r#"Select the tables, columns and foreign keys needed to answer the question. Return JSON only.

Question: "{question}"

DATABASE SCHEMA:
{schema_context}
Format:
{{"tables":["t1"],"columns":{{"t1":["c1","c2"]}},"foreign_keys":[{{"from":"t1.c1","to":"t2.c2"}}],"reasoning":"one sentence"}}

Rules:
- Use only table and column names that appear in the schema above, spelled exactly as shown.
- Include every table the query will read, and only those.
- foreign_keys lists only the edges the query will join on; [] when a single table suffices."#
    )
}

/// Subproblem decomposition: describe the intent of each SQL clause.
pub fn subproblem(question: &str, linked_context: &str) -> String {
    format!(
        r#"Break the question into per-clause subproblems for a SQL query. Return JSON only.

Question: "{question}"

RELEVANT SCHEMA:
{linked_context}
Format:
{{"clauses":{{"SELECT":"what to project","FROM":"source tables","WHERE":"filters"}}}}

Rules:
- Allowed clause names: SELECT, FROM, WHERE, JOIN, GROUP BY, HAVING, ORDER BY, LIMIT.
- Omit clauses the query does not need; do not invent placeholders for them.
- Each value is one plain-language sentence of intent, not SQL."#
    )
}

/// Query planning: ordered derivation steps toward the final query.
pub fn query_plan(question: &str, linked_context: &str, subproblems: &str) -> String {
    format!(
        r#"Produce an ordered plan for building the SQL query. Return JSON only.

Question: "{question}"

RELEVANT SCHEMA:
{linked_context}
CLAUSE BREAKDOWN:
{subproblems}
Format:
{{"steps":[{{"step_number":1,"action":"what this step does","reasoning":"why","sql_fragment":"optional SQL piece"}}],"final_strategy":"one-paragraph summary"}}

Rules:
- Steps are read top to bottom as a derivation; number them from 1 with no gaps.
- sql_fragment is optional per step; include it when the step pins down concrete SQL.
- Keep the plan minimal: no steps about execution, optimization or formatting."#
    )
}

/// SQL generation: the initial query, plain text out.
pub fn sql_generation(question: &str, plan: &str, linked_context: &str, catalog: &str) -> String {
    format!(
        r#"Write one SQLite query that answers the question. Return only the SQL, no commentary.

Question: "{question}"

RELEVANT SCHEMA:
{linked_context}
QUERY PLAN:
{plan}
Rules:
- Single statement, SQLite dialect.
- Reference tables as {catalog}.<table> (the database is attached as '{catalog}').
- Use only tables and columns from the schema above, spelled exactly as shown."#
    )
}

/// Correction planning: classify the failure and plan the fix.
pub fn correction_plan(
    question: &str,
    failed_sql: &str,
    error: &str,
    linked_context: &str,
    taxonomy: &str,
    augmentation: &str,
) -> String {
    let augmentation_block = if augmentation.is_empty() {
        String::new()
    } else {
        format!("LIVE TABLE METADATA:\n{augmentation}\n")
    };
    format!(
        r#"A generated SQL query failed. Diagnose it and plan a correction. Return JSON only.

Question: "{question}"

FAILED SQL:
{failed_sql}

DATABASE ERROR (verbatim):
{error}

RELEVANT SCHEMA:
{linked_context}
{augmentation_block}{taxonomy}
Format:
{{"error_categories":["schema_link.col_missing"],"root_cause":"one sentence","correction_plan":{{"steps":["fix step 1","fix step 2"]}},"sql_before":"offending fragment","sql_after":"fixed fragment"}}

Rules:
- error_categories come from the taxonomy above; list every category that applies.
- If the database error suggests a name (e.g. Did you mean "X"), the plan must reuse that exact name, case preserved.
- sql_before/sql_after are optional; include them when the fix is a local fragment rewrite."#
    )
}

/// Correction SQL: the replacement query, plain text out.
pub fn correction_sql(
    question: &str,
    failed_sql: &str,
    plan: &str,
    linked_context: &str,
    catalog: &str,
) -> String {
    format!(
        r#"Rewrite the failed SQLite query following the correction plan. Return only the corrected SQL, no commentary.

Question: "{question}"

FAILED SQL:
{failed_sql}

CORRECTION PLAN:
{plan}
RELEVANT SCHEMA:
{linked_context}
Rules:
- Single statement, SQLite dialect; the corrected query wholly replaces the failed one.
- Reference tables as {catalog}.<table>.
- If the correction plan or the database error names an exact replacement identifier, use it verbatim, case preserved."#
    )
}
