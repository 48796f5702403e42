//! Entity source backed by the inventory store.

use async_trait::async_trait;
use thiserror::Error;

use super::models::Entity;
use super::store::{DbError, Store};

/// Failure to obtain the entity list. Fatal to a run.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("inventory query failed: {0}")]
    Database(#[from] DbError),
    #[error("entity source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the entities to probe for one run.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn fetch_entities(&self) -> Result<Vec<Entity>, SourceError>;
}

/// Reads entities of one type from the inventory store.
pub struct InventorySource {
    store: Store,
    entity_type: i64,
}

impl InventorySource {
    pub fn new(store: Store, entity_type: i64) -> Self {
        Self { store, entity_type }
    }
}

#[async_trait]
impl EntitySource for InventorySource {
    async fn fetch_entities(&self) -> Result<Vec<Entity>, SourceError> {
        let store = self.store.clone();
        let entity_type = self.entity_type;

        tokio::task::spawn_blocking(move || store.get_entities(entity_type))
            .await
            .map_err(|e| SourceError::Unavailable(format!("inventory task failed: {}", e)))?
            .map_err(SourceError::from)
    }
}
