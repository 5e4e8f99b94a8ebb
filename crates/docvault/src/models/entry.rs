//! Entry model: one file or folder in the index

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::paths;

/// A file or folder record in the relational index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub name: String,
    /// Canonical absolute path, `/`-separated, no trailing slash
    pub path: String,
    pub is_folder: bool,
    /// Bytes on disk; always 0 for folders
    pub size: i64,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Entry {
    /// Create a folder entry for a canonical path
    pub fn new_folder(path: &str, owner_id: &str) -> Self {
        Self::new(path, owner_id, true, 0)
    }

    /// Create a file entry for a canonical path
    pub fn new_file(path: &str, owner_id: &str, size: i64) -> Self {
        Self::new(path, owner_id, false, size)
    }

    fn new(path: &str, owner_id: &str, is_folder: bool, size: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: paths::name(path).to_string(),
            path: path.to_string(),
            is_folder,
            size,
            owner_id: owner_id.to_string(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Path of the containing folder ("/" for top-level entries)
    pub fn parent_path(&self) -> &str {
        paths::parent(&self.path).unwrap_or(paths::ROOT)
    }

    /// True for a folder directly under the root
    pub fn is_top_level_folder(&self) -> bool {
        self.is_folder && paths::depth(&self.path) == 1
    }
}

/// Filter for listing index entries
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub owner_id: Option<String>,
    pub is_folder: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &Entry) -> bool {
        if let Some(ref owner) = self.owner_id {
            if &entry.owner_id != owner {
                return false;
            }
        }
        if let Some(is_folder) = self.is_folder {
            if entry.is_folder != is_folder {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if entry.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if entry.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Aggregated numbers for one folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderStatistics {
    pub folder_name: String,
    pub path: String,
    pub owner_id: String,
    /// Folders anywhere below this one
    pub subfolder_count: u64,
    /// Files anywhere below this one
    pub file_count: u64,
    /// Sum of file sizes below this one
    pub total_size: i64,
}
