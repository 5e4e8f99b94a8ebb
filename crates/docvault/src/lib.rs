//! Docvault - a team document store kept on a physical file tree
//!
//! Files and folders live on disk under a storage root and are mirrored in
//! a relational path index that carries ownership and metadata. Top-level
//! folders may back a team, whose members then govern everything below.
//!
//! # Features
//! - Path-based authorization by team membership or ownership chain
//! - Tree mutations (create, upload, rename, move, delete) applied to disk
//!   and index under per-subtree locks with a write-ahead intent journal
//! - Append-only activity log with read deduplication
//! - Reconciliation between disk and index, with index-only repair

pub mod config;
pub mod db;
pub mod error;
pub mod migrations;
pub mod models;
pub mod paths;
pub mod security;
pub mod services;
pub mod state;

#[cfg(test)]
mod testing;

pub use config::VaultConfig;
pub use error::{VaultError, VaultResult};
pub use state::VaultState;
