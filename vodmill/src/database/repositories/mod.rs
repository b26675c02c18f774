//! Repository layer for database access.
//!
//! All SQL lives here. Everything above this layer speaks in models and
//! stage/status enums, never in query strings.

pub mod collection;
pub mod item;
pub mod partition;

pub use collection::*;
pub use item::*;
pub use partition::*;
