//! vt-core - Storage and pure domain logic for the voicetime tracker
//!
//! This crate provides the durable pieces the tracker engine builds on:
//!
//! - **db**: SQLite-backed presence store (sessions, relationships, levels)
//! - **pair**: canonical unordered pair key for the relationship ledger
//! - **level**: pure experience/leveling math
//! - **config**: tracker configuration loaded from TOML
//! - **error**: shared error types

pub mod config;
pub mod db;
pub mod error;
pub mod level;
pub mod pair;

// Re-export commonly used types
pub use config::TrackerConfig;
pub use db::Store;
pub use error::{Error, Result};
pub use pair::PairKey;
