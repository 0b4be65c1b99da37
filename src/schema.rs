//! Schema Provider
//!
//! Builds a normalized snapshot of the attached catalog: every base table,
//! its columns in declaration order, and the foreign-key edges between
//! tables. Table enumeration is lexical so prompts built from the snapshot
//! are reproducible across runs.

use crate::db::Database;
use crate::error::{PipelineError, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub notnull: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

/// Read-only schema snapshot, built once per pipeline run and shared by all
/// stages of that run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Table name -> columns in declaration order. BTreeMap keeps table
    /// iteration lexical.
    pub tables: BTreeMap<String, Vec<ColumnInfo>>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl SchemaDescriptor {
    /// Snapshot the attached catalog. Any introspection failure is fatal for
    /// the run: no partial schema is usable downstream.
    pub fn snapshot(db: &Database) -> Result<Self> {
        let catalog = db.catalog().to_string();
        db.with_conn(|conn| {
            let table_names: Vec<String> = {
                let mut stmt = conn.prepare(&format!(
                    "SELECT name FROM {}.sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                    catalog
                ))?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            if table_names.is_empty() {
                return Err(PipelineError::Schema(format!(
                    "Catalog '{}' contains no tables",
                    catalog
                )));
            }

            let mut tables = BTreeMap::new();
            let mut primary_keys: BTreeMap<String, String> = BTreeMap::new();
            for table in &table_names {
                let mut stmt = conn.prepare(&format!(
                    "PRAGMA {}.table_info({})",
                    catalog,
                    quote_ident(table)
                ))?;
                let rows = stmt.query_map([], |row| {
                    let name: String = row.get(1)?;
                    let declared_type: String = row.get(2)?;
                    let notnull: i64 = row.get(3)?;
                    let pk: i64 = row.get(5)?;
                    Ok((
                        ColumnInfo {
                            name,
                            declared_type,
                            notnull: notnull != 0,
                        },
                        pk != 0,
                    ))
                })?;

                let mut columns = Vec::new();
                for row in rows {
                    let (column, is_pk) = row?;
                    if is_pk && !primary_keys.contains_key(table) {
                        primary_keys.insert(table.clone(), column.name.clone());
                    }
                    columns.push(column);
                }
                tables.insert(table.clone(), columns);
            }

            let mut foreign_keys = Vec::new();
            for table in &table_names {
                let mut stmt = conn.prepare(&format!(
                    "PRAGMA {}.foreign_key_list({})",
                    catalog,
                    quote_ident(table)
                ))?;
                let rows = stmt.query_map([], |row| {
                    let to_table: String = row.get(2)?;
                    let from_column: String = row.get(3)?;
                    let to_column: Option<String> = row.get(4)?;
                    Ok((to_table, from_column, to_column))
                })?;
                for row in rows {
                    let (to_table, from_column, to_column) = row?;
                    // A NULL target column means the constraint references the
                    // parent's primary key implicitly.
                    let to_column = to_column
                        .or_else(|| primary_keys.get(&to_table).cloned())
                        .unwrap_or_else(|| "rowid".to_string());
                    foreign_keys.push(ForeignKey {
                        from_table: table.clone(),
                        from_column,
                        to_table,
                        to_column,
                    });
                }
            }

            info!(
                "Schema snapshot: {} tables, {} foreign keys",
                tables.len(),
                foreign_keys.len()
            );
            Ok(SchemaDescriptor {
                tables,
                foreign_keys,
            })
        })
    }

    /// Live column names for one table, used by the correction probe. Unlike
    /// the snapshot this is best-effort and the caller swallows failures.
    pub fn probe_columns(db: &Database, table: &str) -> Result<Vec<String>> {
        let catalog = db.catalog().to_string();
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "PRAGMA {}.table_info({})",
                catalog,
                quote_ident(table)
            ))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
            let columns = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            if columns.is_empty() {
                return Err(PipelineError::Schema(format!(
                    "Table '{}' not found in catalog '{}'",
                    table, catalog
                )));
            }
            Ok(columns)
        })
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Render the snapshot as prompt context.
    pub fn to_prompt_context(&self) -> String {
        let mut out = String::new();
        for (table, columns) in &self.tables {
            let cols = columns
                .iter()
                .map(|c| {
                    if c.notnull {
                        format!("{} {} NOT NULL", c.name, c.declared_type)
                    } else {
                        format!("{} {}", c.name, c.declared_type)
                    }
                })
                .join(", ");
            out.push_str(&format!("TABLE {} ({})\n", table, cols));
        }
        if !self.foreign_keys.is_empty() {
            out.push_str("FOREIGN KEYS:\n");
            for fk in &self.foreign_keys {
                out.push_str(&format!(
                    "  {}.{} -> {}.{}\n",
                    fk.from_table, fk.from_column, fk.to_table, fk.to_column
                ));
            }
        }
        out
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
