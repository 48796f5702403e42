//! SQLite inventory store implementation.

use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("database connection lock poisoned")]
    LockPoisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open the store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Create the schema if it does not exist yet.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    /// Add an inventory row and return its ID.
    #[cfg(test)]
    pub fn add_entity(&self, entity: &NewEntity) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO entities (name, address, entity_type) VALUES (?1, ?2, ?3)",
            params![entity.name, entity.address, entity.entity_type],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get all entities of the given type, ordered by ID.
    pub fn get_entities(&self, entity_type: i64) -> Result<Vec<Entity>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, address FROM entities WHERE entity_type = ?1 ORDER BY id ASC",
        )?;

        let entities = stmt
            .query_map(params![entity_type], |row| {
                Ok(Entity::from_row(row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(entities)
    }

    /// Count all inventory rows regardless of type.
    pub fn count_entities(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?)
    }
}
