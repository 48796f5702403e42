//! Database module for pingwatch.
//!
//! Provides the SQLite inventory store and the entity source built on it.

mod models;
mod source;
mod store;

pub use models::*;
pub use source::*;
pub use store::*;
