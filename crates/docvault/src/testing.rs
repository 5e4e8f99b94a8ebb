//! Shared fixtures for unit tests

use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

use crate::paths::StorageRoot;
use crate::services::{ActivityRecorder, TreeMutator};

/// A migrated index database plus an empty storage root, both inside a
/// temporary directory that lives as long as the fixture.
pub(crate) struct TestEnv {
    pub dir: TempDir,
    pub pool: SqlitePool,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("storage")).unwrap();

        let pool = crate::db::connect_file(&dir.path().join("index.db"), 4)
            .await
            .unwrap();
        crate::migrations::run_migration(&pool).await.unwrap();

        Self { dir, pool }
    }

    pub fn storage(&self) -> StorageRoot {
        StorageRoot::new(self.dir.path().join("storage"))
    }

    /// Disk location of a canonical path
    pub fn disk(&self, path: &str) -> PathBuf {
        self.storage().resolve(path).unwrap()
    }

    pub fn recorder(&self) -> ActivityRecorder {
        ActivityRecorder::new(Duration::from_secs(5))
    }

    pub fn mutator(&self) -> TreeMutator {
        TreeMutator::new(self.storage(), self.recorder())
    }
}
