//! Mutation results and write-ahead intent records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Failure;

/// Stages a tree mutation passes through, in order:
/// `Authorized -> DiskApplied -> IndexApplied -> Logged -> Done`.
/// A failure names the stage that could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStage {
    Authorized,
    DiskApplied,
    IndexApplied,
    Logged,
    Done,
}

impl std::fmt::Display for MutationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationStage::Authorized => write!(f, "authorized"),
            MutationStage::DiskApplied => write!(f, "disk_applied"),
            MutationStage::IndexApplied => write!(f, "index_applied"),
            MutationStage::Logged => write!(f, "logged"),
            MutationStage::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for MutationStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorized" => Ok(MutationStage::Authorized),
            "disk_applied" => Ok(MutationStage::DiskApplied),
            "index_applied" => Ok(MutationStage::IndexApplied),
            "logged" => Ok(MutationStage::Logged),
            "done" => Ok(MutationStage::Done),
            _ => Err(format!("Unknown mutation stage: {}", s)),
        }
    }
}

/// How a successful mutation was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Both stores were changed
    Applied,
    /// The item was already gone from disk; only the index was cleaned up
    IndexOnlyCleanup,
}

/// Result record returned for every successful mutation
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub success: bool,
    pub kind: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl MutationOutcome {
    pub fn applied(new_path: Option<String>) -> Self {
        Self {
            success: true,
            kind: OutcomeKind::Applied,
            new_path,
            warning: None,
        }
    }

    pub fn index_only_cleanup(warning: String) -> Self {
        Self {
            success: true,
            kind: OutcomeKind::IndexOnlyCleanup,
            new_path: None,
            warning: Some(warning),
        }
    }
}

/// A file that could not be stored during a multi-file upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadFailure {
    pub name: String,
    pub failure: Failure,
}

/// Per-file results of a multi-file upload. Files are committed
/// independently, so both lists may be non-empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadReport {
    pub uploaded: Vec<crate::models::Entry>,
    /// Intermediate folders created by a folder-structure upload
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub created_folders: Vec<String>,
    pub failed: Vec<UploadFailure>,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Operation recorded in the intent journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentOp {
    CreateFolder,
    UploadFile,
    Rename,
    Move,
    Delete,
}

impl std::fmt::Display for IntentOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentOp::CreateFolder => write!(f, "create_folder"),
            IntentOp::UploadFile => write!(f, "upload_file"),
            IntentOp::Rename => write!(f, "rename"),
            IntentOp::Move => write!(f, "move"),
            IntentOp::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for IntentOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_folder" => Ok(IntentOp::CreateFolder),
            "upload_file" => Ok(IntentOp::UploadFile),
            "rename" => Ok(IntentOp::Rename),
            "move" => Ok(IntentOp::Move),
            "delete" => Ok(IntentOp::Delete),
            _ => Err(format!("Unknown intent op: {}", s)),
        }
    }
}

/// Lifecycle of an intent record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    /// Written, disk not touched yet
    Pending,
    /// Disk step done, index step outstanding
    DiskApplied,
    /// Both stores updated
    Committed,
    /// A step failed; `failed_stage` says which
    Failed,
    /// Index converged to disk by replay
    Recovered,
    /// Replay found the disk step never happened
    Abandoned,
}

impl IntentState {
    /// States that replay still has to look at
    pub const UNRESOLVED: [IntentState; 3] = [
        IntentState::Pending,
        IntentState::DiskApplied,
        IntentState::Failed,
    ];

    /// Final states; journal retention may delete these
    pub const RESOLVED: [IntentState; 3] = [
        IntentState::Committed,
        IntentState::Recovered,
        IntentState::Abandoned,
    ];

    pub fn is_resolved(&self) -> bool {
        !Self::UNRESOLVED.contains(self)
    }
}

impl std::fmt::Display for IntentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentState::Pending => write!(f, "pending"),
            IntentState::DiskApplied => write!(f, "disk_applied"),
            IntentState::Committed => write!(f, "committed"),
            IntentState::Failed => write!(f, "failed"),
            IntentState::Recovered => write!(f, "recovered"),
            IntentState::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl std::str::FromStr for IntentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IntentState::Pending),
            "disk_applied" => Ok(IntentState::DiskApplied),
            "committed" => Ok(IntentState::Committed),
            "failed" => Ok(IntentState::Failed),
            "recovered" => Ok(IntentState::Recovered),
            "abandoned" => Ok(IntentState::Abandoned),
            _ => Err(format!("Unknown intent state: {}", s)),
        }
    }
}

/// Write-ahead record of one mutation
#[derive(Debug, Clone, Serialize)]
pub struct MutationIntent {
    pub id: String,
    pub user_id: String,
    pub op: IntentOp,
    /// Original location for rename and move
    pub source_path: Option<String>,
    pub target_path: String,
    pub state: IntentState,
    pub failed_stage: Option<MutationStage>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of replaying unresolved intents
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub recovered: Vec<MutationIntent>,
    pub abandoned: Vec<MutationIntent>,
    /// Intents whose disk state fits neither outcome; left unresolved
    pub unresolved: Vec<MutationIntent>,
}
