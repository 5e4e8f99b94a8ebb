//! Tree mutator - keeps the physical tree and the path index in step
//!
//! Every mutation runs the same sequence under its subtree lock:
//! authorize, check both stores, write an intent, apply the disk step,
//! apply the index step, commit the intent, record the activity. A failure
//! after the disk step is reported as a partial failure naming the stage
//! that was not reached; nothing already applied is undone.

use sqlx::SqlitePool;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{info, warn};

use crate::error::{VaultError, VaultResult};
use crate::models::{
    ActivityAction, Entry, IntentOp, IntentState, MutationIntent, MutationOutcome, MutationStage,
    Principal, RecoveryReport, UploadFailure, UploadReport,
};
use crate::paths::{self, StorageRoot};
use crate::security::{
    ensure_same_extension, validate_entry_name, AuthorizationResolver, Decision, DenyReason,
    Intent,
};
use crate::services::{ActivityRecorder, IntentJournal, PathIndex, SubtreeLocks, TeamRegistry};

/// Kind of item found on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskItem {
    File(u64),
    Folder,
}

impl DiskItem {
    fn is_folder(&self) -> bool {
        matches!(self, DiskItem::Folder)
    }
}

async fn disk_item(disk: &Path) -> VaultResult<Option<DiskItem>> {
    match fs::metadata(disk).await {
        Ok(meta) if meta.is_dir() => Ok(Some(DiskItem::Folder)),
        Ok(meta) => Ok(Some(DiskItem::File(meta.len()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn dir_has_entries(disk: &Path) -> VaultResult<bool> {
    let mut entries = fs::read_dir(disk).await?;
    Ok(entries.next_entry().await?.is_some())
}

/// One file of an upload. For folder-structure uploads `name` is a
/// relative path such as `reports/2024/q1.pdf`.
pub struct UploadItem {
    pub name: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl UploadItem {
    pub fn new(name: impl Into<String>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            name: name.into(),
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(name, std::io::Cursor::new(bytes.into()))
    }
}

/// An opened file ready to be streamed to the caller
#[derive(Debug)]
pub struct FileDownload {
    pub entry: Entry,
    pub mime_type: String,
    pub file: fs::File,
}

/// Tree mutator
pub struct TreeMutator {
    root: StorageRoot,
    index: PathIndex,
    teams: TeamRegistry,
    resolver: AuthorizationResolver,
    recorder: ActivityRecorder,
    journal: IntentJournal,
    locks: SubtreeLocks,
}

impl TreeMutator {
    pub fn new(root: StorageRoot, recorder: ActivityRecorder) -> Self {
        Self {
            root,
            index: PathIndex::new(),
            teams: TeamRegistry::new(),
            resolver: AuthorizationResolver::new(),
            recorder,
            journal: IntentJournal::new(),
            locks: SubtreeLocks::new(),
        }
    }

    pub fn storage_root(&self) -> &StorageRoot {
        &self.root
    }

    pub fn recorder(&self) -> &ActivityRecorder {
        &self.recorder
    }

    // ----- mutations -----

    /// Create a folder named `name` inside `parent`
    pub async fn create_folder(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        parent: &str,
        name: &str,
    ) -> VaultResult<MutationOutcome> {
        validate_entry_name(name)?;
        let parent = paths::normalize(parent)?;
        let path = paths::join(&parent, name);

        let _guard = self.locks.acquire_one(&path).await;
        self.resolver
            .require(pool, principal, &path, Intent::Create)
            .await?;
        self.create_folder_locked(pool, principal, &path).await?;

        self.recorder
            .record(pool, &principal.user_id, ActivityAction::CreateFolder, &path, None)
            .await;
        info!(user_id = %principal.user_id, path = %path, "Folder created");
        Ok(MutationOutcome::applied(Some(path)))
    }

    /// Upload files into `parent`. Each file is committed on its own; a
    /// failing file is reported and the rest are still attempted.
    pub async fn upload_files(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        parent: &str,
        items: Vec<UploadItem>,
    ) -> VaultResult<UploadReport> {
        let parent = paths::normalize(parent)?;

        // The parent chain decides authorization for every file alike
        if let Some(first) = items.iter().find(|i| validate_entry_name(&i.name).is_ok()) {
            let first_path = paths::join(&parent, &first.name);
            self.resolver
                .require(pool, principal, &first_path, Intent::Upload)
                .await?;
            self.require_parent_folder(pool, &parent).await?;
        }

        let mut report = UploadReport::default();
        for item in items {
            let name = item.name.clone();
            match self.upload_one(pool, principal, &parent, item).await {
                Ok(entry) => report.uploaded.push(entry),
                Err(e) => {
                    warn!(parent = %parent, name = %name, error = %e, "Upload of file failed");
                    report.failed.push(UploadFailure {
                        name,
                        failure: e.to_failure(),
                    });
                }
            }
        }

        info!(
            user_id = %principal.user_id,
            parent = %parent,
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            "Upload finished"
        );
        Ok(report)
    }

    async fn upload_one(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        parent: &str,
        item: UploadItem,
    ) -> VaultResult<Entry> {
        validate_entry_name(&item.name)?;
        let path = paths::join(parent, &item.name);

        let _guard = self.locks.acquire_one(&path).await;
        self.resolver
            .require(pool, principal, &path, Intent::Upload)
            .await?;
        let entry = self
            .write_file_locked(pool, principal, &path, item.reader)
            .await?;

        let details = format!("size={}", entry.size);
        self.recorder
            .record(pool, &principal.user_id, ActivityAction::Upload, &path, Some(&details))
            .await;
        Ok(entry)
    }

    /// Upload files given by relative path, creating missing intermediate
    /// folders owned by the uploader
    pub async fn upload_folder_structure(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        parent: &str,
        items: Vec<UploadItem>,
    ) -> VaultResult<UploadReport> {
        let parent = paths::normalize(parent)?;
        self.require_parent_folder(pool, &parent).await?;

        let mut report = UploadReport::default();
        for item in items {
            let name = item.name.clone();
            match self
                .upload_structured_one(pool, principal, &parent, item, &mut report.created_folders)
                .await
            {
                Ok(entry) => report.uploaded.push(entry),
                Err(e) => {
                    warn!(parent = %parent, name = %name, error = %e, "Structured upload of file failed");
                    report.failed.push(UploadFailure {
                        name,
                        failure: e.to_failure(),
                    });
                }
            }
        }

        if !report.uploaded.is_empty() || !report.created_folders.is_empty() {
            let details = format!(
                "files={} folders={} failed={}",
                report.uploaded.len(),
                report.created_folders.len(),
                report.failed.len()
            );
            self.recorder
                .record(
                    pool,
                    &principal.user_id,
                    ActivityAction::UploadFolderStructure,
                    &parent,
                    Some(&details),
                )
                .await;
        }
        Ok(report)
    }

    async fn upload_structured_one(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        parent: &str,
        item: UploadItem,
        created_folders: &mut Vec<String>,
    ) -> VaultResult<Entry> {
        let relative = paths::normalize(&item.name)?;
        let segments: Vec<&str> = paths::segments(&relative).collect();
        let Some((file_name, folders)) = segments.split_last() else {
            return Err(VaultError::invalid_path(&item.name, "no file name"));
        };
        for segment in &segments {
            validate_entry_name(segment)?;
        }

        let target = paths::join(
            &folders
                .iter()
                .fold(parent.to_string(), |acc, folder| paths::join(&acc, folder)),
            file_name,
        );
        let _guard = self.locks.acquire_one(&target).await;

        let mut current = parent.to_string();
        for folder in folders {
            let next = paths::join(&current, folder);
            let (on_disk, indexed) = self.observe(pool, &next).await?;
            let exists = matches!(
                (on_disk, &indexed),
                (Some(DiskItem::Folder), Some(entry)) if entry.is_folder
            );
            if !exists {
                self.resolver
                    .require(pool, principal, &next, Intent::Create)
                    .await?;
                self.create_folder_locked(pool, principal, &next).await?;
                created_folders.push(next.clone());
            }
            current = next;
        }

        self.resolver
            .require(pool, principal, &target, Intent::Upload)
            .await?;
        self.write_file_locked(pool, principal, &target, item.reader)
            .await
    }

    /// Rename a file or folder in place
    pub async fn rename(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
        new_name: &str,
    ) -> VaultResult<MutationOutcome> {
        let path = self.normalize_non_root(path)?;
        validate_entry_name(new_name)?;
        let parent = paths::parent(&path).unwrap_or(paths::ROOT);
        let new_path = paths::join(parent, new_name);
        if new_path == path {
            return Err(VaultError::conflict(&path, "new name equals the current name"));
        }

        let _guard = self.locks.acquire([path.as_str(), new_path.as_str()]).await;
        self.refuse_team_folder(pool, &path, "renamed").await?;
        self.authorize_existing(pool, principal, &path, Intent::Rename)
            .await?;

        let entry = self.require_both(pool, &path).await?;
        if !entry.is_folder {
            ensure_same_extension(&entry.name, new_name)?;
        }
        self.require_vacant(pool, &new_path).await?;

        self.relocate(pool, principal, &entry, &new_path, IntentOp::Rename)
            .await?;

        let details = format!("to={}", new_path);
        self.recorder
            .record(
                pool,
                &principal.user_id,
                ActivityAction::rename(entry.is_folder),
                &path,
                Some(&details),
            )
            .await;
        info!(user_id = %principal.user_id, from = %path, to = %new_path, "Entry renamed");
        Ok(MutationOutcome::applied(Some(new_path)))
    }

    /// Move a file or folder into `destination_parent`, keeping its name
    pub async fn move_entry(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
        destination_parent: &str,
    ) -> VaultResult<MutationOutcome> {
        let path = self.normalize_non_root(path)?;
        let destination_parent = paths::normalize(destination_parent)?;
        if paths::is_within(&destination_parent, &path) {
            return Err(VaultError::invalid_path(
                &destination_parent,
                "cannot move a folder into itself",
            ));
        }
        let new_path = paths::join(&destination_parent, paths::name(&path));
        if new_path == path {
            return Err(VaultError::conflict(&path, "entry is already in the destination"));
        }

        let _guard = self.locks.acquire([path.as_str(), new_path.as_str()]).await;
        self.refuse_team_folder(pool, &path, "moved").await?;
        self.authorize_existing(pool, principal, &path, Intent::Move)
            .await?;
        self.resolver
            .require(pool, principal, &new_path, Intent::Create)
            .await?;

        self.require_parent_folder(pool, &destination_parent).await?;
        let entry = self.require_both(pool, &path).await?;
        self.require_vacant(pool, &new_path).await?;

        self.relocate(pool, principal, &entry, &new_path, IntentOp::Move)
            .await?;

        let details = format!("to={}", new_path);
        self.recorder
            .record(
                pool,
                &principal.user_id,
                ActivityAction::move_entry(entry.is_folder),
                &path,
                Some(&details),
            )
            .await;
        info!(user_id = %principal.user_id, from = %path, to = %new_path, "Entry moved");
        Ok(MutationOutcome::applied(Some(new_path)))
    }

    /// Delete a file or folder. A non-empty folder needs `force`. When the
    /// item is already gone from disk the index entry is cleaned up and the
    /// outcome says so.
    pub async fn delete(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
        force: bool,
    ) -> VaultResult<MutationOutcome> {
        let path = self.normalize_non_root(path)?;

        let _guard = self.locks.acquire_one(&path).await;
        self.refuse_team_folder(pool, &path, "deleted").await?;
        self.authorize_existing(pool, principal, &path, Intent::Delete)
            .await?;

        self.delete_locked(pool, principal, &path, force).await
    }

    /// Delete a team's backing folder after its team row is gone
    pub(crate) async fn delete_released_team_folder(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
    ) -> VaultResult<MutationOutcome> {
        let _guard = self.locks.acquire_one(path).await;
        self.delete_locked(pool, principal, path, true).await
    }

    async fn delete_locked(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
        force: bool,
    ) -> VaultResult<MutationOutcome> {
        let disk = self.root.resolve(path)?;
        let (on_disk, indexed) = self.observe(pool, path).await?;

        let entry = match (on_disk, indexed) {
            (None, None) => return Err(VaultError::not_found(path)),
            (Some(_), None) => {
                return Err(VaultError::drift(path, "exists on disk but not in the index"))
            }
            (None, Some(entry)) => {
                return self.cleanup_index_only(pool, principal, &entry, force).await
            }
            (Some(item), Some(entry)) => {
                if item.is_folder() != entry.is_folder {
                    return Err(VaultError::drift(
                        path,
                        "disk and index disagree on whether this is a folder",
                    ));
                }
                entry
            }
        };

        let non_empty = entry.is_folder
            && (dir_has_entries(&disk).await? || self.index.has_descendants(pool, path).await?);
        if non_empty && !force {
            return Err(VaultError::NonEmptyFolder {
                path: path.to_string(),
            });
        }

        let intent = self
            .journal
            .begin(pool, &principal.user_id, IntentOp::Delete, None, path)
            .await?;

        let removed = if !entry.is_folder {
            fs::remove_file(&disk).await
        } else if non_empty {
            fs::remove_dir_all(&disk).await
        } else {
            fs::remove_dir(&disk).await
        };
        if let Err(e) = removed {
            self.journal
                .note_failure(pool, &intent, MutationStage::DiskApplied, &e.to_string())
                .await;
            // A recursive removal may have deleted part of the subtree
            return Err(if non_empty {
                VaultError::partial(MutationStage::DiskApplied, path, e)
            } else {
                e.into()
            });
        }
        self.journal.note(pool, &intent, IntentState::DiskApplied).await;

        let removed_rows = self.apply_index_step(pool, &intent, path, async {
            self.index.delete_subtree(pool, path).await
        })
        .await?;
        self.journal.note(pool, &intent, IntentState::Committed).await;

        self.recorder
            .record(
                pool,
                &principal.user_id,
                ActivityAction::delete(entry.is_folder),
                path,
                None,
            )
            .await;
        info!(
            user_id = %principal.user_id,
            path = %path,
            index_rows = removed_rows,
            "Entry deleted"
        );
        Ok(MutationOutcome::applied(None))
    }

    async fn cleanup_index_only(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        entry: &Entry,
        force: bool,
    ) -> VaultResult<MutationOutcome> {
        let path = entry.path.as_str();
        if entry.is_folder && !force && self.index.has_descendants(pool, path).await? {
            return Err(VaultError::NonEmptyFolder {
                path: path.to_string(),
            });
        }

        let intent = self
            .journal
            .begin(pool, &principal.user_id, IntentOp::Delete, None, path)
            .await?;
        self.journal.note(pool, &intent, IntentState::DiskApplied).await;

        let removed_rows = self.apply_index_step(pool, &intent, path, async {
            self.index.delete_subtree(pool, path).await
        })
        .await?;
        self.journal.note(pool, &intent, IntentState::Committed).await;

        let warning = format!(
            "{} was already missing on disk; removed {} index entries",
            path, removed_rows
        );
        warn!(user_id = %principal.user_id, path = %path, removed_rows, "Index-only cleanup of drifted entry");
        self.recorder
            .record(
                pool,
                &principal.user_id,
                ActivityAction::delete(entry.is_folder),
                path,
                Some("index-only cleanup"),
            )
            .await;
        Ok(MutationOutcome::index_only_cleanup(warning))
    }

    /// Remove an index subtree whose disk counterpart is gone. The stores
    /// are re-read under the lock; `None` means the entry is no longer stale.
    pub(crate) async fn remove_stale_index_entry(
        &self,
        pool: &SqlitePool,
        path: &str,
    ) -> VaultResult<Option<u64>> {
        let _guard = self.locks.acquire_one(path).await;
        match self.observe(pool, path).await? {
            (None, Some(_)) => Ok(Some(self.index.delete_subtree(pool, path).await?)),
            _ => Ok(None),
        }
    }

    // ----- reads -----

    /// Direct children of a folder, from the index
    pub async fn list_folder(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
    ) -> VaultResult<Vec<Entry>> {
        let path = paths::normalize(path)?;
        self.resolver
            .require(pool, principal, &path, Intent::Read)
            .await?;

        if !paths::is_root(&path) {
            match self.index.get(pool, &path).await? {
                Some(entry) if entry.is_folder => {}
                Some(_) => return Err(VaultError::invalid_path(&path, "not a folder")),
                None => return Err(VaultError::not_found(&path)),
            }
        }
        self.index.list_children(pool, &path).await
    }

    /// Metadata of an entry present in both stores
    pub async fn metadata(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
    ) -> VaultResult<Entry> {
        let path = self.normalize_non_root(path)?;
        self.resolver
            .require(pool, principal, &path, Intent::Read)
            .await?;

        let entry = self.require_both(pool, &path).await?;
        self.recorder
            .record(pool, &principal.user_id, ActivityAction::MetadataRead, &path, None)
            .await;
        Ok(entry)
    }

    /// Open a file for streaming download
    pub async fn open_file(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
    ) -> VaultResult<FileDownload> {
        let path = self.normalize_non_root(path)?;
        self.resolver
            .require(pool, principal, &path, Intent::Read)
            .await?;

        let entry = self.require_both(pool, &path).await?;
        if entry.is_folder {
            return Err(VaultError::invalid_path(&path, "folders cannot be downloaded"));
        }
        let file = fs::File::open(self.root.resolve(&path)?).await?;
        let mime_type = mime_guess::from_path(&entry.name)
            .first_or_octet_stream()
            .to_string();

        self.recorder
            .record(pool, &principal.user_id, ActivityAction::Download, &path, None)
            .await;
        Ok(FileDownload {
            entry,
            mime_type,
            file,
        })
    }

    /// Case-insensitive name search within the caller's own entries
    pub async fn search(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        text: &str,
    ) -> VaultResult<Vec<Entry>> {
        self.index.search(pool, &principal.user_id, text).await
    }

    // ----- intent replay -----

    /// Converge the index to disk for every unresolved intent
    pub async fn recover_intents(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
    ) -> VaultResult<RecoveryReport> {
        if !principal.is_admin() {
            return Err(VaultError::Forbidden {
                reason: "intent replay requires an administrator".to_string(),
            });
        }

        let mut report = RecoveryReport::default();
        for intent in self.journal.unresolved(pool).await? {
            let mut touched = vec![intent.target_path.as_str()];
            if let Some(ref source) = intent.source_path {
                touched.push(source.as_str());
            }
            let _guard = self.locks.acquire(touched).await;

            match self.replay(pool, &intent).await {
                Ok(Some(state)) => {
                    self.journal.advance(pool, &intent.id, state).await?;
                    if state == IntentState::Recovered {
                        let details = format!("replayed {} intent {}", intent.op, intent.id);
                        self.recorder
                            .record(
                                pool,
                                &principal.user_id,
                                ActivityAction::IndexRepair,
                                &intent.target_path,
                                Some(&details),
                            )
                            .await;
                        report.recovered.push(intent);
                    } else {
                        report.abandoned.push(intent);
                    }
                }
                Ok(None) => report.unresolved.push(intent),
                Err(e) => {
                    warn!(intent_id = %intent.id, error = %e, "Intent replay failed");
                    report.unresolved.push(intent);
                }
            }
        }

        info!(
            recovered = report.recovered.len(),
            abandoned = report.abandoned.len(),
            unresolved = report.unresolved.len(),
            "Intent replay finished"
        );
        Ok(report)
    }

    /// Decide the final state of one intent from what the disk shows.
    /// `None` means the disk state fits neither outcome.
    async fn replay(
        &self,
        pool: &SqlitePool,
        intent: &MutationIntent,
    ) -> VaultResult<Option<IntentState>> {
        let target = intent.target_path.as_str();
        let on_disk = disk_item(&self.root.resolve(target)?).await?;

        match intent.op {
            IntentOp::CreateFolder | IntentOp::UploadFile => {
                let indexed = self.index.get(pool, target).await?;
                match (on_disk, indexed) {
                    (Some(_), Some(_)) => Ok(Some(IntentState::Recovered)),
                    (None, None) => Ok(Some(IntentState::Abandoned)),
                    (None, Some(_)) => Ok(None),
                    (Some(item), None) => {
                        // A pending upload may have been cut off mid-write
                        let write_finished = intent.state == IntentState::DiskApplied
                            || intent.failed_stage == Some(MutationStage::IndexApplied);
                        if intent.op == IntentOp::UploadFile && !write_finished {
                            return Ok(None);
                        }
                        let entry = match item {
                            DiskItem::Folder => Entry::new_folder(target, &intent.user_id),
                            DiskItem::File(len) => {
                                Entry::new_file(target, &intent.user_id, len as i64)
                            }
                        };
                        self.index.insert(pool, &entry).await?;
                        Ok(Some(IntentState::Recovered))
                    }
                }
            }
            IntentOp::Rename | IntentOp::Move => {
                let Some(source) = intent.source_path.as_deref() else {
                    return Ok(None);
                };
                let source_on_disk = disk_item(&self.root.resolve(source)?).await?;
                match (source_on_disk, on_disk) {
                    (Some(_), None) => Ok(Some(IntentState::Abandoned)),
                    (None, Some(item)) => {
                        if self.index.get(pool, source).await?.is_some() {
                            if item.is_folder() {
                                self.index.bulk_reparent(pool, source, target).await?;
                            } else {
                                self.index.update_path(pool, source, target).await?;
                            }
                        }
                        Ok(Some(IntentState::Recovered))
                    }
                    _ => Ok(None),
                }
            }
            IntentOp::Delete => {
                if on_disk.is_some() {
                    return Ok(Some(IntentState::Abandoned));
                }
                self.index.delete_subtree(pool, target).await?;
                Ok(Some(IntentState::Recovered))
            }
        }
    }

    // ----- shared steps -----

    fn normalize_non_root(&self, path: &str) -> VaultResult<String> {
        let path = paths::normalize(path)?;
        if paths::is_root(&path) {
            return Err(VaultError::invalid_path(path, "the root cannot be addressed"));
        }
        Ok(path)
    }

    /// What each store holds at `path`
    async fn observe(
        &self,
        pool: &SqlitePool,
        path: &str,
    ) -> VaultResult<(Option<DiskItem>, Option<Entry>)> {
        let on_disk = disk_item(&self.root.resolve(path)?).await?;
        let indexed = self.index.get(pool, path).await?;
        Ok((on_disk, indexed))
    }

    /// The entry at `path`, which must exist in both stores
    async fn require_both(&self, pool: &SqlitePool, path: &str) -> VaultResult<Entry> {
        match self.observe(pool, path).await? {
            (Some(_), Some(entry)) => Ok(entry),
            (None, None) => Err(VaultError::not_found(path)),
            (Some(_), None) => Err(VaultError::drift(path, "exists on disk but not in the index")),
            (None, Some(_)) => Err(VaultError::drift(path, "indexed but missing on disk")),
        }
    }

    /// Reject a destination occupied in either store
    async fn require_vacant(&self, pool: &SqlitePool, path: &str) -> VaultResult<()> {
        match self.observe(pool, path).await? {
            (None, None) => Ok(()),
            (Some(_), Some(_)) => Err(VaultError::conflict(path, "destination already exists")),
            (Some(_), None) => Err(VaultError::drift(path, "exists on disk but not in the index")),
            (None, Some(_)) => Err(VaultError::drift(path, "indexed but missing on disk")),
        }
    }

    /// A parent must be a folder in both stores; the root always qualifies
    async fn require_parent_folder(&self, pool: &SqlitePool, parent: &str) -> VaultResult<()> {
        if paths::is_root(parent) {
            return Ok(());
        }
        match self.observe(pool, parent).await? {
            (Some(DiskItem::Folder), Some(entry)) if entry.is_folder => Ok(()),
            (None, None) => Err(VaultError::not_found(parent)),
            (Some(_), Some(_)) => Err(VaultError::invalid_path(parent, "not a folder")),
            (Some(_), None) => Err(VaultError::drift(parent, "exists on disk but not in the index")),
            (None, Some(_)) => Err(VaultError::drift(parent, "indexed but missing on disk")),
        }
    }

    /// Authorize an intent on an existing entry. An entry missing from the
    /// index but present on disk is drift, not absence.
    async fn authorize_existing(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
        intent: Intent,
    ) -> VaultResult<()> {
        let decision = self.resolver.authorize(pool, principal, path, intent).await?;
        if let Decision::Deny(DenyReason::MissingEntry { ref path }) = decision {
            if disk_item(&self.root.resolve(path)?).await?.is_some() {
                return Err(VaultError::drift(
                    path.as_str(),
                    "exists on disk but not in the index",
                ));
            }
        }
        decision.into_result()
    }

    /// Team folders only change through team administration
    async fn refuse_team_folder(&self, pool: &SqlitePool, path: &str, verb: &str) -> VaultResult<()> {
        if let Some(team) = self.teams.team_for_folder_path(pool, path).await? {
            return Err(VaultError::Forbidden {
                reason: format!(
                    "{} backs team {} and cannot be {} directly",
                    path, team.name, verb
                ),
            });
        }
        Ok(())
    }

    /// Disk and index halves of folder creation; caller holds the lock and
    /// has authorized the path
    async fn create_folder_locked(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
    ) -> VaultResult<Entry> {
        let parent = paths::parent(path).unwrap_or(paths::ROOT);
        self.require_parent_folder(pool, parent).await?;
        self.require_vacant(pool, path).await?;
        let disk = self.root.resolve(path)?;

        let intent = self
            .journal
            .begin(pool, &principal.user_id, IntentOp::CreateFolder, None, path)
            .await?;

        if let Err(e) = fs::create_dir(&disk).await {
            self.journal
                .note_failure(pool, &intent, MutationStage::DiskApplied, &e.to_string())
                .await;
            return Err(e.into());
        }
        self.journal.note(pool, &intent, IntentState::DiskApplied).await;

        let entry = Entry::new_folder(path, &principal.user_id);
        self.apply_index_step(pool, &intent, path, async {
            self.index.insert(pool, &entry).await
        })
        .await?;
        self.journal.note(pool, &intent, IntentState::Committed).await;
        Ok(entry)
    }

    /// Disk and index halves of a file upload; caller holds the lock and
    /// has authorized the path
    async fn write_file_locked(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> VaultResult<Entry> {
        let parent = paths::parent(path).unwrap_or(paths::ROOT);
        self.require_parent_folder(pool, parent).await?;
        self.require_vacant(pool, path).await?;
        let disk = self.root.resolve(path)?;

        let intent = self
            .journal
            .begin(pool, &principal.user_id, IntentOp::UploadFile, None, path)
            .await?;

        let written = match write_new_file(&disk, &mut reader).await {
            Ok(written) => written,
            Err(e) => {
                // Never leave a truncated file behind
                if let Err(cleanup) = fs::remove_file(&disk).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path, error = %cleanup, "Failed to remove partial upload");
                    }
                }
                self.journal
                    .note_failure(pool, &intent, MutationStage::DiskApplied, &e.to_string())
                    .await;
                return Err(e.into());
            }
        };
        self.journal.note(pool, &intent, IntentState::DiskApplied).await;

        let entry = Entry::new_file(path, &principal.user_id, written as i64);
        self.apply_index_step(pool, &intent, path, async {
            self.index.insert(pool, &entry).await
        })
        .await?;
        self.journal.note(pool, &intent, IntentState::Committed).await;
        Ok(entry)
    }

    /// Disk move plus index rewrite shared by rename and move
    async fn relocate(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        entry: &Entry,
        new_path: &str,
        op: IntentOp,
    ) -> VaultResult<()> {
        let from = self.root.resolve(&entry.path)?;
        let to = self.root.resolve(new_path)?;

        let intent = self
            .journal
            .begin(pool, &principal.user_id, op, Some(&entry.path), new_path)
            .await?;

        if let Err(e) = fs::rename(&from, &to).await {
            self.journal
                .note_failure(pool, &intent, MutationStage::DiskApplied, &e.to_string())
                .await;
            return Err(e.into());
        }
        self.journal.note(pool, &intent, IntentState::DiskApplied).await;

        self.apply_index_step(pool, &intent, &entry.path, async {
            if entry.is_folder {
                self.index
                    .bulk_reparent(pool, &entry.path, new_path)
                    .await
                    .map(|_| ())
            } else {
                self.index.update_path(pool, &entry.path, new_path).await
            }
        })
        .await?;
        self.journal.note(pool, &intent, IntentState::Committed).await;
        Ok(())
    }

    /// Run an index step after the disk step succeeded. A failure leaves
    /// drift behind and is reported as a partial failure.
    async fn apply_index_step<T>(
        &self,
        pool: &SqlitePool,
        intent_id: &str,
        path: &str,
        step: impl std::future::Future<Output = VaultResult<T>>,
    ) -> VaultResult<T> {
        match step.await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    path = %path,
                    intent_id = %intent_id,
                    error = %e,
                    "Index update failed after disk change; stores have drifted"
                );
                self.journal
                    .note_failure(pool, intent_id, MutationStage::IndexApplied, &e.to_string())
                    .await;
                Err(VaultError::partial(MutationStage::IndexApplied, path, e))
            }
        }
    }
}

async fn write_new_file(
    disk: &Path,
    reader: &mut (dyn AsyncRead + Send + Unpin),
) -> std::io::Result<u64> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(disk)
        .await?;
    let written = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{OutcomeKind, Team};
    use crate::testing::TestEnv;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    async fn index_paths(env: &TestEnv) -> BTreeSet<String> {
        PathIndex::new()
            .all_entries(&env.pool)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect()
    }

    fn disk_paths(env: &TestEnv) -> BTreeSet<String> {
        let storage = env.storage();
        walkdir::WalkDir::new(storage.path())
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| storage.to_canonical(e.path()))
            .collect()
    }

    async fn make_team(env: &TestEnv, mutator: &TreeMutator, name: &str) -> Team {
        let admin = Principal::admin("admin");
        mutator.create_folder(&env.pool, &admin, "/", name).await.unwrap();
        let folder = PathIndex::new()
            .get(&env.pool, &paths::join(paths::ROOT, name))
            .await
            .unwrap()
            .unwrap();
        let team = Team::new(name.to_string(), folder.id);
        TeamRegistry::new().insert(&env.pool, &team).await.unwrap();
        team
    }

    #[tokio::test]
    async fn test_create_folder_then_list() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");

        let outcome = mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        assert_eq!(outcome.new_path.as_deref(), Some("/A"));
        mutator.create_folder(&env.pool, &alice, "/A", "B").await.unwrap();

        let children = mutator.list_folder(&env.pool, &alice, "/A").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path, "/A/B");
        assert_eq!(children[0].owner_id, "alice");
        assert!(env.disk("/A/B").is_dir());

        let err = mutator.create_folder(&env.pool, &alice, "/A", "B").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = mutator.create_folder(&env.pool, &alice, "/A", "x/y").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        let err = mutator.create_folder(&env.pool, &alice, "/../etc", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
    }

    #[tokio::test]
    async fn test_create_in_foreign_folder_is_forbidden() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        mutator
            .create_folder(&env.pool, &Principal::user("alice"), "/", "A")
            .await
            .unwrap();

        let err = mutator
            .create_folder(&env.pool, &Principal::user("bob"), "/A", "B")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(!env.disk("/A/B").exists());
    }

    #[tokio::test]
    async fn test_create_over_disk_only_folder_reports_drift() {
        let env = TestEnv::new().await;
        std::fs::create_dir(env.disk("/Stray")).unwrap();

        let err = env
            .mutator()
            .create_folder(&env.pool, &Principal::admin("admin"), "/", "Stray")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Drift);
    }

    #[tokio::test]
    async fn test_team_member_upload_overrides_ownership() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let admin = Principal::admin("admin");
        let team = make_team(&env, &mutator, "Eng").await;
        mutator.create_folder(&env.pool, &admin, "/Eng", "docs").await.unwrap();
        TeamRegistry::new()
            .add_member(&env.pool, &team.id, "u", "admin")
            .await
            .unwrap();

        let report = mutator
            .upload_files(
                &env.pool,
                &Principal::user("u"),
                "/Eng/docs",
                vec![UploadItem::from_bytes("report.pdf", b"%PDF-1.7".to_vec())],
            )
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.uploaded[0].path, "/Eng/docs/report.pdf");
        assert_eq!(report.uploaded[0].size, 8);
        assert_eq!(report.uploaded[0].owner_id, "u");

        let err = mutator
            .upload_files(
                &env.pool,
                &Principal::user("v"),
                "/Eng/docs",
                vec![UploadItem::from_bytes("other.pdf", b"x".to_vec())],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(!env.disk("/Eng/docs/other.pdf").exists());
    }

    #[tokio::test]
    async fn test_upload_commits_each_file() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();

        let report = mutator
            .upload_files(
                &env.pool,
                &alice,
                "/A",
                vec![
                    UploadItem::from_bytes("a.txt", b"one".to_vec()),
                    UploadItem::from_bytes("a.txt", b"two".to_vec()),
                    UploadItem::from_bytes("b.txt", b"three".to_vec()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.uploaded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].failure.kind, ErrorKind::Conflict);
        assert_eq!(std::fs::read_to_string(env.disk("/A/a.txt")).unwrap(), "one");
        assert_eq!(index_paths(&env).await, disk_paths(&env));
    }

    #[tokio::test]
    async fn test_upload_folder_structure_creates_intermediate_folders() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();

        let report = mutator
            .upload_folder_structure(
                &env.pool,
                &alice,
                "/A",
                vec![
                    UploadItem::from_bytes("reports/2024/q1.pdf", b"q1".to_vec()),
                    UploadItem::from_bytes("reports/2024/q2.pdf", b"q2".to_vec()),
                    UploadItem::from_bytes("reports/../escape.pdf", b"no".to_vec()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.uploaded.len(), 2);
        assert_eq!(report.created_folders, vec!["/A/reports", "/A/reports/2024"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].failure.kind, ErrorKind::InvalidPath);

        let folder = PathIndex::new().get(&env.pool, "/A/reports/2024").await.unwrap().unwrap();
        assert!(folder.is_folder);
        assert_eq!(folder.owner_id, "alice");
        assert_eq!(index_paths(&env).await, disk_paths(&env));
    }

    #[tokio::test]
    async fn test_move_folder_rewrites_descendants() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/", "B").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A", vec![UploadItem::from_bytes("x.txt", b"x".to_vec())])
            .await
            .unwrap();

        let outcome = mutator.move_entry(&env.pool, &alice, "/A", "/B").await.unwrap();
        assert_eq!(outcome.new_path.as_deref(), Some("/B/A"));

        let index = PathIndex::new();
        assert!(index.get(&env.pool, "/B/A/x.txt").await.unwrap().is_some());
        assert!(index.get(&env.pool, "/A").await.unwrap().is_none());
        assert!(index.get(&env.pool, "/A/x.txt").await.unwrap().is_none());
        assert_eq!(index_paths(&env).await, disk_paths(&env));
    }

    #[tokio::test]
    async fn test_move_rejections() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/A", "Inner").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/", "B").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/B", "Inner").await.unwrap();

        let into_self = mutator.move_entry(&env.pool, &alice, "/A", "/A/Inner").await;
        assert_eq!(into_self.unwrap_err().kind(), ErrorKind::InvalidPath);

        let occupied = mutator.move_entry(&env.pool, &alice, "/A/Inner", "/B").await;
        assert_eq!(occupied.unwrap_err().kind(), ErrorKind::Conflict);

        let missing_parent = mutator.move_entry(&env.pool, &alice, "/A/Inner", "/C").await;
        assert_eq!(missing_parent.unwrap_err().kind(), ErrorKind::NotFound);

        let foreign = mutator
            .move_entry(&env.pool, &Principal::user("bob"), "/A/Inner", "/")
            .await;
        assert_eq!(foreign.unwrap_err().kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_rename_extension_mismatch_touches_nothing() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A", vec![UploadItem::from_bytes("pic.png", b"png".to_vec())])
            .await
            .unwrap();

        let err = mutator.rename(&env.pool, &alice, "/A/pic.png", "pic.jpg").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtensionMismatch);
        assert!(env.disk("/A/pic.png").exists());
        assert!(!env.disk("/A/pic.jpg").exists());
        assert!(PathIndex::new().get(&env.pool, "/A/pic.png").await.unwrap().is_some());

        let outcome = mutator.rename(&env.pool, &alice, "/A/pic.png", "photo.PNG").await.unwrap();
        assert_eq!(outcome.new_path.as_deref(), Some("/A/photo.PNG"));
        let renamed = PathIndex::new().get(&env.pool, "/A/photo.PNG").await.unwrap().unwrap();
        assert_eq!(renamed.name, "photo.PNG");
    }

    #[tokio::test]
    async fn test_rename_folder_updates_every_descendant() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/A", "sub").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A/sub", vec![UploadItem::from_bytes("f.md", b"#".to_vec())])
            .await
            .unwrap();

        mutator.rename(&env.pool, &alice, "/A", "Archive").await.unwrap();

        let paths = index_paths(&env).await;
        let expected: BTreeSet<String> = ["/Archive", "/Archive/sub", "/Archive/sub/f.md"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(paths, expected);
        assert_eq!(paths, disk_paths(&env));
    }

    #[tokio::test]
    async fn test_team_folder_cannot_be_renamed_or_deleted_directly() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let admin = Principal::admin("admin");
        make_team(&env, &mutator, "Eng").await;

        let err = mutator.rename(&env.pool, &admin, "/Eng", "Ops").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = mutator.delete(&env.pool, &admin, "/Eng", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(env.disk("/Eng").is_dir());
    }

    #[tokio::test]
    async fn test_delete_requires_force_for_non_empty_folder() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/A", "B").await.unwrap();

        let err = mutator.delete(&env.pool, &alice, "/A", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonEmptyFolder);
        assert!(env.disk("/A/B").is_dir());

        let outcome = mutator.delete(&env.pool, &alice, "/A", true).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Applied);
        assert!(!env.disk("/A").exists());
        assert!(index_paths(&env).await.is_empty());

        let err = mutator.delete(&env.pool, &alice, "/A", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_of_vanished_folder_cleans_index_only() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/A", "B").await.unwrap();
        std::fs::remove_dir_all(env.disk("/A")).unwrap();

        let err = mutator.delete(&env.pool, &alice, "/A", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonEmptyFolder);

        let outcome = mutator.delete(&env.pool, &alice, "/A", true).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::IndexOnlyCleanup);
        assert!(outcome.warning.is_some());
        assert!(index_paths(&env).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_unindexed_item_reports_drift() {
        let env = TestEnv::new().await;
        std::fs::write(env.disk("/loose.txt"), b"x").unwrap();

        let err = env
            .mutator()
            .delete(&env.pool, &Principal::user("alice"), "/loose.txt", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Drift);
        assert!(env.disk("/loose.txt").exists());
    }

    #[tokio::test]
    async fn test_reads() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A", vec![UploadItem::from_bytes("notes.txt", b"hello".to_vec())])
            .await
            .unwrap();

        let meta = mutator.metadata(&env.pool, &alice, "/A/notes.txt").await.unwrap();
        assert_eq!(meta.size, 5);

        let mut download = mutator.open_file(&env.pool, &alice, "/A/notes.txt").await.unwrap();
        assert_eq!(download.mime_type, "text/plain");
        let mut body = String::new();
        download.file.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "hello");

        let err = mutator.open_file(&env.pool, &alice, "/A").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);

        let found = mutator.search(&env.pool, &alice, "NOTE").await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(mutator
            .search(&env.pool, &Principal::user("bob"), "note")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_index_failure_is_partial_and_recoverable() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        sqlx::query(
            "CREATE TRIGGER block_inserts BEFORE INSERT ON entries BEGIN SELECT RAISE(ABORT, 'index unavailable'); END",
        )
        .execute(&env.pool)
        .await
        .unwrap();

        let err = mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::Partial {
                stage: MutationStage::IndexApplied,
                ..
            }
        ));
        assert!(env.disk("/A").is_dir());
        assert!(index_paths(&env).await.is_empty());

        sqlx::query("DROP TRIGGER block_inserts")
            .execute(&env.pool)
            .await
            .unwrap();

        let denied = mutator.recover_intents(&env.pool, &alice).await.unwrap_err();
        assert_eq!(denied.kind(), ErrorKind::Forbidden);

        let report = mutator
            .recover_intents(&env.pool, &Principal::system())
            .await
            .unwrap();
        assert_eq!(report.recovered.len(), 1);
        assert!(report.unresolved.is_empty());

        let entry = PathIndex::new().get(&env.pool, "/A").await.unwrap().unwrap();
        assert_eq!(entry.owner_id, "alice");
        assert!(IntentJournal::new().unresolved(&env.pool).await.unwrap().is_empty());
    }

    async fn block_index(env: &TestEnv, event: &str) {
        let sql = format!(
            "CREATE TRIGGER block_index BEFORE {} ON entries BEGIN SELECT RAISE(ABORT, 'index unavailable'); END",
            event
        );
        sqlx::query(&sql).execute(&env.pool).await.unwrap();
    }

    async fn unblock_index(env: &TestEnv) {
        sqlx::query("DROP TRIGGER block_index")
            .execute(&env.pool)
            .await
            .unwrap();
    }

    fn is_index_partial(err: &VaultError) -> bool {
        matches!(
            err,
            VaultError::Partial {
                stage: MutationStage::IndexApplied,
                ..
            }
        )
    }

    #[tokio::test]
    async fn test_folder_rename_index_failure_is_replayed() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/A", "sub").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A/sub", vec![UploadItem::from_bytes("x.txt", b"x".to_vec())])
            .await
            .unwrap();

        block_index(&env, "UPDATE").await;
        let err = mutator.rename(&env.pool, &alice, "/A", "Archive").await.unwrap_err();
        assert!(is_index_partial(&err));
        assert!(env.disk("/Archive/sub/x.txt").is_file());
        assert!(index_paths(&env).await.contains("/A/sub/x.txt"));
        assert_ne!(index_paths(&env).await, disk_paths(&env));

        unblock_index(&env).await;
        let report = mutator
            .recover_intents(&env.pool, &Principal::system())
            .await
            .unwrap();
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(report.recovered[0].op, IntentOp::Rename);
        assert!(report.unresolved.is_empty());

        let converged = index_paths(&env).await;
        assert_eq!(converged, disk_paths(&env));
        assert!(converged.contains("/Archive/sub/x.txt"));
        let folder = PathIndex::new().get(&env.pool, "/Archive").await.unwrap().unwrap();
        assert_eq!(folder.name, "Archive");
    }

    #[tokio::test]
    async fn test_file_move_index_failure_is_replayed() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/", "B").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A", vec![UploadItem::from_bytes("x.txt", b"x".to_vec())])
            .await
            .unwrap();

        block_index(&env, "UPDATE").await;
        let err = mutator.move_entry(&env.pool, &alice, "/A/x.txt", "/B").await.unwrap_err();
        assert!(is_index_partial(&err));
        assert!(env.disk("/B/x.txt").is_file());
        assert!(!env.disk("/A/x.txt").exists());
        assert!(PathIndex::new().get(&env.pool, "/A/x.txt").await.unwrap().is_some());

        unblock_index(&env).await;
        let report = mutator
            .recover_intents(&env.pool, &Principal::system())
            .await
            .unwrap();
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(index_paths(&env).await, disk_paths(&env));
        let moved = PathIndex::new().get(&env.pool, "/B/x.txt").await.unwrap().unwrap();
        assert_eq!(moved.owner_id, "alice");

        // A second replay has nothing left to do
        let again = mutator
            .recover_intents(&env.pool, &Principal::system())
            .await
            .unwrap();
        assert!(again.recovered.is_empty() && again.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_delete_index_failure_is_replayed() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/A", "sub").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A/sub", vec![UploadItem::from_bytes("x.txt", b"x".to_vec())])
            .await
            .unwrap();

        block_index(&env, "DELETE").await;
        let err = mutator.delete(&env.pool, &alice, "/A/sub", true).await.unwrap_err();
        assert!(is_index_partial(&err));
        assert!(!env.disk("/A/sub").exists());
        assert!(index_paths(&env).await.contains("/A/sub/x.txt"));

        unblock_index(&env).await;
        let report = mutator
            .recover_intents(&env.pool, &Principal::system())
            .await
            .unwrap();
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(report.recovered[0].op, IntentOp::Delete);
        assert_eq!(index_paths(&env).await, BTreeSet::from(["/A".to_string()]));
        assert_eq!(index_paths(&env).await, disk_paths(&env));
    }

    #[tokio::test]
    async fn test_delete_interrupted_after_disk_removal_is_replayed() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A", vec![UploadItem::from_bytes("x.txt", b"x".to_vec())])
            .await
            .unwrap();

        // Crash between the disk removal and the index step
        let journal = IntentJournal::new();
        let intent = journal
            .begin(&env.pool, "alice", IntentOp::Delete, None, "/A/x.txt")
            .await
            .unwrap();
        std::fs::remove_file(env.disk("/A/x.txt")).unwrap();
        journal.advance(&env.pool, &intent, IntentState::DiskApplied).await.unwrap();

        let report = mutator
            .recover_intents(&env.pool, &Principal::system())
            .await
            .unwrap();
        assert_eq!(report.recovered.len(), 1);
        assert!(PathIndex::new().get(&env.pool, "/A/x.txt").await.unwrap().is_none());
        let resolved = journal.get(&env.pool, &intent).await.unwrap().unwrap();
        assert_eq!(resolved.state, IntentState::Recovered);
    }

    #[tokio::test]
    async fn test_recovery_abandons_intents_that_never_reached_disk() {
        let env = TestEnv::new().await;
        let journal = IntentJournal::new();
        journal
            .begin(&env.pool, "alice", IntentOp::CreateFolder, None, "/Never")
            .await
            .unwrap();
        journal
            .begin(&env.pool, "alice", IntentOp::UploadFile, None, "/half.bin")
            .await
            .unwrap();
        std::fs::write(env.disk("/half.bin"), b"trunc").unwrap();

        let report = env
            .mutator()
            .recover_intents(&env.pool, &Principal::system())
            .await
            .unwrap();
        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(report.abandoned[0].target_path, "/Never");
        // A pending upload with bytes on disk may be truncated
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].target_path, "/half.bin");
    }

    #[tokio::test]
    async fn test_concurrent_mutations_keep_stores_consistent() {
        let env = TestEnv::new().await;
        let mutator = Arc::new(env.mutator());
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/", "B").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A", vec![UploadItem::from_bytes("x.txt", b"x".to_vec())])
            .await
            .unwrap();

        let mover = {
            let (mutator, pool, alice) = (Arc::clone(&mutator), env.pool.clone(), alice.clone());
            tokio::spawn(async move { mutator.move_entry(&pool, &alice, "/A", "/B").await })
        };
        let renamer = {
            let (mutator, pool, alice) = (Arc::clone(&mutator), env.pool.clone(), alice.clone());
            tokio::spawn(async move { mutator.rename(&pool, &alice, "/A/x.txt", "y.txt").await })
        };

        assert!(mover.await.unwrap().is_ok());
        // The rename either ran first or found its source already moved
        if let Err(e) = renamer.await.unwrap() {
            assert_eq!(e.kind(), ErrorKind::NotFound);
        }
        assert_eq!(index_paths(&env).await, disk_paths(&env));
    }
}
