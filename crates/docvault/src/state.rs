//! Vault state - one connected, migrated set of services

use std::sync::Arc;
use tracing::info;

use crate::config::VaultConfig;
use crate::error::VaultResult;
use crate::paths::StorageRoot;
use crate::services::{
    ActivityRecorder, DbPool, PathIndex, Reconciler, StatsService, TeamService, TreeMutator,
};

/// Shared vault state
#[derive(Clone)]
pub struct VaultState {
    pub pool: DbPool,
    pub config: VaultConfig,
    pub index: Arc<PathIndex>,
    pub mutator: Arc<TreeMutator>,
    pub teams: Arc<TeamService>,
    pub stats: Arc<StatsService>,
    pub reconciler: Arc<Reconciler>,
}

impl VaultState {
    /// Connect to the index database, apply the schema and make sure the
    /// storage root exists
    pub async fn open(config: VaultConfig) -> VaultResult<Self> {
        let pool = crate::db::connect(&config.database_url, config.max_connections).await?;
        crate::migrations::run_migration(&pool).await?;
        tokio::fs::create_dir_all(&config.storage_root).await?;

        let recorder = ActivityRecorder::new(config.read_dedup_window());
        let root = StorageRoot::new(config.storage_root.clone());
        let mutator = Arc::new(TreeMutator::new(root, recorder.clone()));

        info!(
            storage_root = %config.storage_root.display(),
            database_url = %config.database_url,
            "Vault opened"
        );

        Ok(Self {
            pool: Arc::new(pool),
            index: Arc::new(PathIndex::new()),
            teams: Arc::new(TeamService::new(Arc::clone(&mutator))),
            stats: Arc::new(StatsService::new(recorder)),
            reconciler: Arc::new(Reconciler::new(Arc::clone(&mutator))),
            mutator,
            config,
        })
    }
}
