//! Team and membership models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A team bound to one top-level folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    /// Id of the backing top-level folder entry
    pub folder_id: String,
    pub created_at: DateTime<Utc>,
}

impl Team {
    /// Create a new team
    pub fn new(name: String, folder_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            folder_id,
            created_at: Utc::now(),
        }
    }
}

/// Membership of a user in a team
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMembership {
    pub user_id: String,
    pub team_id: String,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
}

/// Team with its folder path and members
#[derive(Debug, Clone, Serialize)]
pub struct TeamSummary {
    #[serde(flatten)]
    pub team: Team,
    pub folder_path: String,
    pub members: Vec<TeamMembership>,
}
