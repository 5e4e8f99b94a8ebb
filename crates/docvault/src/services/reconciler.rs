//! Reconciler - compares the physical tree with the path index
//!
//! Checks are read-then-report. The only repair touches the index: disk
//! decides whether an item exists, so stale index entries are removed and
//! disk content is never deleted.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{VaultError, VaultResult};
use crate::models::{
    ActivityAction, ActivityRecord, Entry, Principal, RecoveryReport, TeamSummary,
};
use crate::paths::{self, StorageRoot};
use crate::services::{IntentJournal, PathIndex, TeamRegistry, TreeMutator};

/// Item found on disk with no index entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskOnlyItem {
    pub path: String,
    pub is_folder: bool,
}

/// Both directions of drift, sorted by path
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftReport {
    pub missing_on_disk: Vec<Entry>,
    pub missing_in_index: Vec<DiskOnlyItem>,
    /// Entries whose path exists on disk as the other kind (file vs folder).
    /// Repair leaves these alone.
    pub kind_mismatch: Vec<Entry>,
}

impl DriftReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_on_disk.is_empty()
            && self.missing_in_index.is_empty()
            && self.kind_mismatch.is_empty()
    }
}

/// Result of an index repair
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairResult {
    /// Stale entries removed (or, on a dry run, that would be removed)
    pub removed: Vec<String>,
    /// Number of index rows deleted, descendants included
    pub removed_rows: u64,
    /// Team folders left in place; see `Reconciler::orphaned_teams`
    pub skipped_team_folders: Vec<String>,
    /// Entries that reappeared on disk between the check and the removal
    pub skipped_no_longer_stale: Vec<String>,
    pub failures: Vec<RepairFailure>,
    pub dry_run: bool,
}

impl RepairResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairFailure {
    pub path: String,
    pub error: String,
}

/// Reconciler
pub struct Reconciler {
    mutator: Arc<TreeMutator>,
    index: PathIndex,
    teams: TeamRegistry,
    journal: IntentJournal,
}

impl Reconciler {
    pub fn new(mutator: Arc<TreeMutator>) -> Self {
        Self {
            mutator,
            index: PathIndex::new(),
            teams: TeamRegistry::new(),
            journal: IntentJournal::new(),
        }
    }

    fn require_admin(principal: &Principal, action: &str) -> VaultResult<()> {
        if TeamRegistry::is_admin(principal) {
            Ok(())
        } else {
            Err(VaultError::Forbidden {
                reason: format!("{} requires an administrator", action),
            })
        }
    }

    /// Every item under the storage root, keyed by canonical path
    async fn scan_disk(&self) -> VaultResult<BTreeMap<String, bool>> {
        let root: StorageRoot = self.mutator.storage_root().clone();
        tokio::task::spawn_blocking(move || {
            let mut items = BTreeMap::new();
            for item in WalkDir::new(root.path()).min_depth(1).sort_by_file_name() {
                let item = item?;
                match root.to_canonical(item.path()) {
                    Some(path) => {
                        items.insert(path, item.file_type().is_dir());
                    }
                    None => {
                        warn!(path = %item.path().display(), "Skipping item with a name the index cannot hold");
                    }
                }
            }
            Ok::<_, VaultError>(items)
        })
        .await
        .map_err(|e| VaultError::Internal(format!("Disk scan task failed: {}", e)))?
    }

    /// Index entries with no matching item on disk
    pub async fn missing_on_disk(&self, pool: &SqlitePool) -> VaultResult<Vec<Entry>> {
        let disk = self.scan_disk().await?;
        let entries = self.index.all_entries(pool).await?;
        Ok(Self::index_only(entries, &disk))
    }

    /// Disk items with no index entry
    pub async fn missing_in_index(&self, pool: &SqlitePool) -> VaultResult<Vec<DiskOnlyItem>> {
        let disk = self.scan_disk().await?;
        let entries = self.index.all_entries(pool).await?;
        Ok(Self::disk_only(&entries, disk))
    }

    /// Both checks against a single snapshot of each store
    pub async fn check(&self, pool: &SqlitePool) -> VaultResult<DriftReport> {
        let disk = self.scan_disk().await?;
        let entries = self.index.all_entries(pool).await?;

        let report = DriftReport {
            kind_mismatch: Self::kind_mismatches(&entries, &disk),
            missing_in_index: Self::disk_only(&entries, disk.clone()),
            missing_on_disk: Self::index_only(entries, &disk),
        };
        info!(
            missing_on_disk = report.missing_on_disk.len(),
            missing_in_index = report.missing_in_index.len(),
            kind_mismatch = report.kind_mismatch.len(),
            "Consistency check finished"
        );
        Ok(report)
    }

    fn index_only(entries: Vec<Entry>, disk: &BTreeMap<String, bool>) -> Vec<Entry> {
        entries
            .into_iter()
            .filter(|entry| !disk.contains_key(&entry.path))
            .collect()
    }

    fn kind_mismatches(entries: &[Entry], disk: &BTreeMap<String, bool>) -> Vec<Entry> {
        entries
            .iter()
            .filter(|entry| matches!(disk.get(&entry.path), Some(is_dir) if *is_dir != entry.is_folder))
            .cloned()
            .collect()
    }

    fn disk_only(entries: &[Entry], disk: BTreeMap<String, bool>) -> Vec<DiskOnlyItem> {
        let known: HashSet<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        disk.into_iter()
            .filter(|(path, _)| !known.contains(path.as_str()))
            .map(|(path, is_folder)| DiskOnlyItem { path, is_folder })
            .collect()
    }

    /// Delete index entries whose disk item is missing. Team folders are
    /// skipped together with everything below them.
    pub async fn repair_index(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        dry_run: bool,
    ) -> VaultResult<RepairResult> {
        Self::require_admin(principal, "index repair")?;

        let mut result = RepairResult {
            dry_run,
            ..Default::default()
        };
        let stale = self.missing_on_disk(pool).await?;

        for entry in stale {
            let path = entry.path;
            let covered = result
                .removed
                .iter()
                .chain(result.skipped_team_folders.iter())
                .any(|done| paths::is_within(&path, done));
            if covered {
                continue;
            }

            if entry.is_folder && self.teams.team_for_folder_path(pool, &path).await?.is_some() {
                warn!(path = %path, "Team folder missing on disk; leaving it for team administration");
                result.skipped_team_folders.push(path);
                continue;
            }

            if dry_run {
                result.removed.push(path);
                continue;
            }

            match self.mutator.remove_stale_index_entry(pool, &path).await {
                Ok(Some(rows)) => {
                    let details = format!("removed {} stale index entries", rows);
                    self.mutator
                        .recorder()
                        .record(pool, &principal.user_id, ActivityAction::IndexRepair, &path, Some(&details))
                        .await;
                    result.removed_rows += rows;
                    result.removed.push(path);
                }
                Ok(None) => {
                    info!(path = %path, "Entry no longer stale; left in place");
                    result.skipped_no_longer_stale.push(path);
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to remove stale index entry");
                    result.failures.push(RepairFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            removed = result.removed.len(),
            removed_rows = result.removed_rows,
            skipped = result.skipped_team_folders.len(),
            no_longer_stale = result.skipped_no_longer_stale.len(),
            failed = result.failures.len(),
            dry_run,
            "Index repair finished"
        );
        Ok(result)
    }

    /// Teams whose backing folder is gone from disk
    pub async fn orphaned_teams(&self, pool: &SqlitePool) -> VaultResult<Vec<TeamSummary>> {
        let root = self.mutator.storage_root();
        let mut orphaned = Vec::new();
        for summary in self.teams.list(pool).await? {
            if !root.resolve(&summary.folder_path)?.is_dir() {
                orphaned.push(summary);
            }
        }
        Ok(orphaned)
    }

    /// Converge the index for intents a crash or failure left unresolved
    pub async fn replay_intents(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
    ) -> VaultResult<RecoveryReport> {
        self.mutator.recover_intents(pool, principal).await
    }

    /// Delete resolved intents older than `keep`
    pub async fn prune_intents(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        keep: Duration,
    ) -> VaultResult<u64> {
        Self::require_admin(principal, "intent pruning")?;
        let keep = chrono::Duration::from_std(keep)
            .map_err(|e| VaultError::Validation(format!("Retention out of range: {}", e)))?;
        let before = Utc::now()
            .checked_sub_signed(keep)
            .ok_or_else(|| VaultError::Validation("Retention out of range".to_string()))?;
        let pruned = self.journal.prune_resolved(pool, before).await?;
        info!(pruned, "Resolved intents pruned");
        Ok(pruned)
    }

    /// Most recent activity records for manual inspection
    pub async fn recent_activity(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        limit: u32,
    ) -> VaultResult<Vec<ActivityRecord>> {
        Self::require_admin(principal, "reading the activity log")?;
        let recorder = self.mutator.recorder();
        let records = recorder.recent(pool, limit).await?;
        recorder
            .record(pool, &principal.user_id, ActivityAction::ActivityView, paths::ROOT, None)
            .await;
        Ok(records)
    }
}
