//! Error taxonomy for the correction stage.
//!
//! A fixed table of category codes the correction planner classifies SQL
//! failures into. The codes are contractual: they appear verbatim in
//! correction-plan outputs and in the correction prompt.

/// Category code -> what it covers. Wildcard families (`syntax.*`) accept any
/// suffix under the family prefix.
pub const CATEGORIES: &[(&str, &str)] = &[
    ("syntax.*", "SQL syntax errors: malformed clauses, unbalanced parens, bad keywords"),
    ("schema_link.table_missing", "Query references a table that does not exist"),
    ("schema_link.col_missing", "Query references a column that does not exist"),
    ("schema_link.ambiguous_col", "Column reference matches more than one table"),
    ("schema_link.incorrect_foreign_key", "Join uses a wrong or nonexistent foreign key"),
    ("join.missing", "A required join is absent"),
    ("join.wrong_type", "Wrong join type (INNER vs LEFT/RIGHT)"),
    ("join.extra_table", "Join pulls in a table the question does not need"),
    ("join.incorrect_col", "Join condition uses the wrong columns"),
    ("filter.where_missing", "A required WHERE filter is absent"),
    ("filter.condition_wrong_col", "Filter tests the wrong column"),
    ("filter.condition_type_mismatch", "Filter compares incompatible types"),
    ("aggregation.no_groupby", "Aggregate used without the required GROUP BY"),
    ("aggregation.groupby_missing_col", "GROUP BY omits a selected non-aggregate column"),
    ("aggregation.having_without_groupby", "HAVING used without GROUP BY"),
    ("value.hardcoded_value", "Literal value does not match the data"),
    ("value.value_format_wrong", "Literal value has the wrong format (dates, casing)"),
    ("subquery.*", "Subquery construction errors"),
    ("set_operations.*", "UNION/INTERSECT/EXCEPT errors"),
    ("other.*", "Anything not covered above"),
];

/// Render the taxonomy as a prompt table.
pub fn taxonomy_table() -> String {
    let mut out = String::from("ERROR TAXONOMY (use these category codes):\n");
    for (code, description) in CATEGORIES {
        out.push_str(&format!("- {}: {}\n", code, description));
    }
    out
}

/// Whether a category code produced by the model belongs to the taxonomy.
/// Wildcard families match any code under their prefix.
pub fn is_known_category(code: &str) -> bool {
    CATEGORIES.iter().any(|(known, _)| {
        if let Some(family) = known.strip_suffix(".*") {
            code == *known || code.strip_prefix(family).is_some_and(|rest| rest.starts_with('.'))
        } else {
            code == *known
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_categories_match() {
        assert!(is_known_category("schema_link.col_missing"));
        assert!(is_known_category("aggregation.no_groupby"));
        assert!(!is_known_category("schema_link.totally_new"));
    }

    #[test]
    fn test_wildcard_families_match_any_suffix() {
        assert!(is_known_category("syntax.unbalanced_parens"));
        assert!(is_known_category("subquery.correlation"));
        assert!(is_known_category("other.unknown"));
        assert!(!is_known_category("syntaxerror.x"));
    }

    #[test]
    fn test_taxonomy_table_lists_every_code() {
        let table = taxonomy_table();
        for (code, _) in CATEGORIES {
            assert!(table.contains(code), "missing {}", code);
        }
    }
}
