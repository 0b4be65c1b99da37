//! Schema-qualification rewrite.
//!
//! Generated SQL must reference tables under the attached catalog's logical
//! name. Models routinely emit bare `FROM customers`; this rewrite prefixes
//! the catalog deterministically and is idempotent, so the orchestrator can
//! apply it to both fresh and corrected queries without tracking state.

use crate::error::{PipelineError, Result};
use regex::Regex;

/// Prefix every unqualified `FROM <table>` / `JOIN <table>` reference with
/// `<catalog>.`. Already-qualified references are left alone, and any
/// `catalog.catalog.` doubling a naive pass would produce is collapsed.
pub fn qualify_tables(sql: &str, catalog: &str) -> Result<String> {
    // Capture the keyword, the first identifier after it, and whether that
    // identifier is itself a qualifier (followed by a dot).
    let reference = Regex::new(r"(?i)\b(FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)(\s*\.)?")
        .map_err(|e| PipelineError::Execution(format!("Bad rewrite pattern: {}", e)))?;

    let qualified = reference.replace_all(sql, |caps: &regex::Captures| {
        if caps.get(3).is_some() {
            // Already qualified (`FROM x.y`), keep as-is.
            caps[0].to_string()
        } else {
            format!("{} {}.{}", &caps[1], catalog, &caps[2])
        }
    });

    // Collapse doubling left behind by any earlier naive qualification.
    let doubled = Regex::new(&format!(
        r"(?i)\b{0}\s*\.\s*{0}\s*\.",
        regex::escape(catalog)
    ))
    .map_err(|e| PipelineError::Execution(format!("Bad rewrite pattern: {}", e)))?;

    let collapsed = format!("{}.", catalog);
    Ok(doubled.replace_all(&qualified, collapsed.as_str()).into_owned())
}
