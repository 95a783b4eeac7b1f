//! Reader for the persistent bundle store.
//!
//! A bundle is a SQLite database exposing three relations:
//!
//! - `entry_points(id_name)`
//! - `bindings(id_name, lazy, value, file_name)` — `value` is a JSON
//!   document holding the binding's declarative instruction list
//! - `depends_ons(id_name, needs)`
//!
//! The reader does not interpret the JSON payloads; it only hands rows to
//! the loader.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to open bundle file '{path}': {source}")]
    Open {
        path: String,
        source: rusqlite::Error,
    },

    #[error("binding not found: {0}")]
    MissingBinding(String),

    #[error("bundle query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// One row of the `bindings` relation.
#[derive(Debug, Clone)]
pub struct Binding {
    pub idname: String,
    pub lazy: bool,
    /// JSON-encoded declarative function.
    pub value: String,
    pub filename: String,
}

#[derive(Debug)]
pub struct BundleReader {
    conn: Connection,
}

impl BundleReader {
    /// Open an existing bundle file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BundleError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| BundleError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { conn })
    }

    /// An empty in-memory bundle, for tests and embedding.
    pub fn open_in_memory() -> Result<Self, BundleError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Direct access to the underlying connection (fixture setup, vacuuming
    /// into a file, …).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn entry_points(&self) -> Result<Vec<String>, BundleError> {
        let mut stmt = self.conn.prepare("SELECT id_name FROM entry_points")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn binding(&self, idname: &str) -> Result<Binding, BundleError> {
        let mut stmt = self.conn.prepare(
            "SELECT id_name, lazy, value, file_name FROM bindings WHERE id_name = ?1",
        )?;
        stmt.query_row([idname], |row| {
            Ok(Binding {
                idname: row.get(0)?,
                lazy: row.get(1)?,
                value: row.get(2)?,
                filename: row.get(3)?,
            })
        })
        .optional()?
        .ok_or_else(|| BundleError::MissingBinding(idname.to_string()))
    }

    /// The transitive dependency closure of `idname`, including `idname`
    /// itself, mapped to each binding's lazy bit. Cycle-safe: a name is
    /// visited at most once.
    pub fn dependencies(
        &self,
        idname: &str,
    ) -> Result<HashMap<String, bool>, BundleError> {
        let mut deps = HashMap::new();
        self.collect_dependencies(idname, &mut deps)?;
        debug!(entry = idname, count = deps.len(), "resolved dependency set");
        Ok(deps)
    }

    fn collect_dependencies(
        &self,
        idname: &str,
        deps: &mut HashMap<String, bool>,
    ) -> Result<(), BundleError> {
        if deps.contains_key(idname) {
            return Ok(());
        }

        let binding = self.binding(idname)?;
        deps.insert(idname.to_string(), binding.lazy);

        let mut stmt = self
            .conn
            .prepare("SELECT needs FROM depends_ons WHERE id_name = ?1")?;
        let needs = stmt
            .query_map([idname], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        for need in needs {
            self.collect_dependencies(&need, deps)?;
        }
        Ok(())
    }
}
