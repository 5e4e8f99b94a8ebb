//! Services module - path index, authorization inputs and tree mutation

pub mod activity_service;
pub mod concurrency;
pub mod intent_journal;
pub mod path_index;
pub mod reconciler;
pub mod stats_service;
pub mod team_registry;
pub mod team_service;
pub mod tree_mutator;

pub use activity_service::ActivityRecorder;
pub use concurrency::{SubtreeGuard, SubtreeLocks};
pub use intent_journal::IntentJournal;
pub use path_index::PathIndex;
pub use reconciler::{DiskOnlyItem, DriftReport, Reconciler, RepairFailure, RepairResult};
pub use stats_service::StatsService;
pub use team_registry::TeamRegistry;
pub use team_service::TeamService;
pub use tree_mutator::{FileDownload, TreeMutator, UploadItem};

use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared database pool type
pub type DbPool = Arc<SqlitePool>;
