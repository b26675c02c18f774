//! Database models.

pub mod collection;
pub mod item;
pub mod partition;

pub use collection::{CollectionRecord, NewCollection};
pub use item::{ItemRecord, NewItem, Stage, StageStatus};
pub use partition::{PartitionRecord, SelectionPredicate};
