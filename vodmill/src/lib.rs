//! vodmill library crate.
//!
//! Durable per-item, per-stage pipeline state in SQLite plus the
//! orchestration that drives external tools over it.

pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;

pub use error::{Error, Result};
