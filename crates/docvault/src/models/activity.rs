//! Activity log models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed vocabulary of audited actions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityAction {
    // Tree mutations
    CreateFolder,
    Upload,
    UploadFolderStructure,
    DeleteFile,
    DeleteFolder,
    RenameFile,
    RenameFolder,
    MoveFile,
    MoveFolder,
    // Sensitive reads
    Download,
    MetadataRead,
    // Pure reads
    ViewStatistics,
    ActivityView,
    // Team administration
    TeamCreate,
    TeamDelete,
    TeamMemberAdd,
    TeamMemberRemove,
    // Maintenance
    IndexRepair,
}

impl ActivityAction {
    pub const ALL: [ActivityAction; 18] = [
        ActivityAction::CreateFolder,
        ActivityAction::Upload,
        ActivityAction::UploadFolderStructure,
        ActivityAction::DeleteFile,
        ActivityAction::DeleteFolder,
        ActivityAction::RenameFile,
        ActivityAction::RenameFolder,
        ActivityAction::MoveFile,
        ActivityAction::MoveFolder,
        ActivityAction::Download,
        ActivityAction::MetadataRead,
        ActivityAction::ViewStatistics,
        ActivityAction::ActivityView,
        ActivityAction::TeamCreate,
        ActivityAction::TeamDelete,
        ActivityAction::TeamMemberAdd,
        ActivityAction::TeamMemberRemove,
        ActivityAction::IndexRepair,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::CreateFolder => "create-folder",
            ActivityAction::Upload => "upload",
            ActivityAction::UploadFolderStructure => "upload-folder-structure",
            ActivityAction::DeleteFile => "delete-file",
            ActivityAction::DeleteFolder => "delete-folder",
            ActivityAction::RenameFile => "rename-file",
            ActivityAction::RenameFolder => "rename-folder",
            ActivityAction::MoveFile => "move-file",
            ActivityAction::MoveFolder => "move-folder",
            ActivityAction::Download => "download",
            ActivityAction::MetadataRead => "metadata-read",
            ActivityAction::ViewStatistics => "view-statistics",
            ActivityAction::ActivityView => "activity-view",
            ActivityAction::TeamCreate => "team-create",
            ActivityAction::TeamDelete => "team-delete",
            ActivityAction::TeamMemberAdd => "team-member-add",
            ActivityAction::TeamMemberRemove => "team-member-remove",
            ActivityAction::IndexRepair => "index-repair",
        }
    }

    /// Pure reads that may be collapsed when repeated within the dedup window.
    /// Mutations and sensitive reads are always recorded.
    pub fn is_dedupable(&self) -> bool {
        matches!(
            self,
            ActivityAction::ViewStatistics | ActivityAction::ActivityView
        )
    }

    pub fn delete(is_folder: bool) -> Self {
        if is_folder {
            ActivityAction::DeleteFolder
        } else {
            ActivityAction::DeleteFile
        }
    }

    pub fn rename(is_folder: bool) -> Self {
        if is_folder {
            ActivityAction::RenameFolder
        } else {
            ActivityAction::RenameFile
        }
    }

    pub fn move_entry(is_folder: bool) -> Self {
        if is_folder {
            ActivityAction::MoveFolder
        } else {
            ActivityAction::MoveFile
        }
    }
}

impl std::fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivityAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityAction::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("Unknown activity action: {}", s))
    }
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: i64,
    pub user_id: String,
    pub action: ActivityAction,
    pub target_path: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Query parameters for listing activity records, newest first
#[derive(Debug, Clone, Default)]
pub struct ActivityQuery {
    pub user_id: Option<String>,
    pub action: Option<ActivityAction>,
    /// Only records whose target equals this path or lies below it
    pub target_prefix: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_strings_round_trip() {
        for action in ActivityAction::ALL {
            let parsed: ActivityAction = action.to_string().parse().unwrap();
            assert_eq!(parsed, action);
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
        assert!("rename".parse::<ActivityAction>().is_err());
    }

    #[test]
    fn test_only_pure_reads_are_dedupable() {
        let dedupable: Vec<_> = ActivityAction::ALL
            .iter()
            .filter(|a| a.is_dedupable())
            .collect();
        assert_eq!(
            dedupable,
            vec![&ActivityAction::ViewStatistics, &ActivityAction::ActivityView]
        );
        assert!(!ActivityAction::Download.is_dedupable());
    }
}
