//! Database connection management.
//!
//! One rusqlite connection per process, shared behind a mutex: concurrent
//! schema introspection and query execution against a single embedded engine
//! handle are not safe to interleave, so every caller goes through
//! [`Database::with_conn`].
//!
//! The target database file is attached onto an in-memory primary connection
//! under a configurable logical catalog name, which is why generated SQL has
//! to reference tables as `<catalog>.<table>`.

use crate::error::{PipelineError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    catalog: String,
}

impl Database {
    /// Open the catalog file and attach it under `catalog`.
    pub fn open(path: &Path, catalog: &str) -> Result<Self> {
        validate_catalog_name(catalog)?;
        if !path.exists() {
            return Err(PipelineError::Database(format!(
                "Database file not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open_in_memory()?;
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", catalog),
            [path.to_string_lossy().as_ref()],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            catalog: catalog.to_string(),
        })
    }

    /// In-memory catalog, used by tests and fixtures.
    pub fn open_in_memory(catalog: &str) -> Result<Self> {
        validate_catalog_name(catalog)?;
        let conn = Connection::open_in_memory()?;
        conn.execute(&format!("ATTACH DATABASE ':memory:' AS {}", catalog), [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            catalog: catalog.to_string(),
        })
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    /// Run `f` with exclusive access to the underlying connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| PipelineError::Database("Connection mutex poisoned".to_string()))?;
        f(&conn)
    }
}

/// The catalog name is interpolated into ATTACH and PRAGMA statements, so it
/// must be a plain identifier.
fn validate_catalog_name(catalog: &str) -> Result<()> {
    let valid = !catalog.is_empty()
        && catalog
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !catalog.chars().next().unwrap().is_ascii_digit();
    if valid {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "Invalid catalog name '{}': expected an identifier",
            catalog
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_attaches_catalog() {
        let db = Database::open_in_memory("db").unwrap();
        db.with_conn(|conn| {
            conn.execute("CREATE TABLE db.t (id INTEGER)", [])?;
            conn.execute("INSERT INTO db.t VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM db.t", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_invalid_catalog_name_rejected() {
        assert!(Database::open_in_memory("my catalog").is_err());
        assert!(Database::open_in_memory("1db").is_err());
        assert!(Database::open_in_memory("").is_err());
        assert!(Database::open_in_memory("main_db").is_ok());
    }
}
