//! Database model types.

use serde::Serialize;

/// Entity type flag for servers in the inventory.
pub const SERVER_ENTITY_TYPE: i64 = 1;

/// A monitored target loaded from the inventory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    /// Probe target. Falls back to `name` when the inventory row has no address.
    pub address: String,
}

impl Entity {
    #[cfg(test)]
    pub fn new(id: i64, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
        }
    }

    /// Build an entity from an inventory row, using the name as the
    /// address when the address column is NULL or blank.
    pub fn from_row(id: i64, name: String, address: Option<String>) -> Self {
        let address = match address {
            Some(a) if !a.trim().is_empty() => a.trim().to_string(),
            _ => {
                tracing::debug!(entity_id = id, name = %name, "No address on record, probing by name");
                name.clone()
            }
        };
        Self { id, name, address }
    }
}

/// A new inventory row, used when seeding the store.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub name: String,
    pub address: Option<String>,
    pub entity_type: i64,
}

#[cfg(test)]
impl Default for NewEntity {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: None,
            entity_type: SERVER_ENTITY_TYPE,
        }
    }
}
