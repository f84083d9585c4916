//! Database layer for pitchlab
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - Partial-field session updates with typed schema-mismatch detection

pub mod repo;
pub mod schema;

pub use repo::{Database, GradingRunRecord, GradingRunStatus, SessionCandidate};
