//! Team service - administration of teams and their backing folders

use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::error::{VaultError, VaultResult};
use crate::models::{
    ActivityAction, MutationOutcome, Principal, Team, TeamMembership, TeamSummary,
};
use crate::paths;
use crate::security::validate_entry_name;
use crate::services::{PathIndex, TeamRegistry, TreeMutator};

/// Team service
pub struct TeamService {
    mutator: Arc<TreeMutator>,
    index: PathIndex,
    teams: TeamRegistry,
}

impl TeamService {
    pub fn new(mutator: Arc<TreeMutator>) -> Self {
        Self {
            mutator,
            index: PathIndex::new(),
            teams: TeamRegistry::new(),
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

    /// Create a team backed by the top-level folder of the same name. An
    /// existing top-level folder that backs no team is adopted; otherwise
    /// the folder is created.
    pub async fn create_team(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        name: &str,
    ) -> VaultResult<Team> {
        Self::require_admin(principal, "creating a team")?;
        validate_entry_name(name)?;
        if self.teams.find_by_name(pool, name).await?.is_some() {
            return Err(VaultError::TeamExists {
                name: name.to_string(),
            });
        }

        let folder_path = paths::join(paths::ROOT, name);
        let folder = match self.index.get(pool, &folder_path).await? {
            Some(entry) if entry.is_folder => {
                if !self.mutator.storage_root().resolve(&folder_path)?.is_dir() {
                    return Err(VaultError::drift(&folder_path, "indexed but missing on disk"));
                }
                entry
            }
            Some(_) => return Err(VaultError::invalid_path(&folder_path, "not a folder")),
            None => {
                self.mutator
                    .create_folder(pool, principal, paths::ROOT, name)
                    .await?;
                self.index
                    .get(pool, &folder_path)
                    .await?
                    .ok_or_else(|| VaultError::not_found(&folder_path))?
            }
        };

        let team = Team::new(name.to_string(), folder.id);
        self.teams.insert(pool, &team).await?;

        self.mutator
            .recorder()
            .record(pool, &principal.user_id, ActivityAction::TeamCreate, &folder_path, None)
            .await;
        info!(team_id = %team.id, name = %team.name, "Team created");
        Ok(team)
    }

    /// Delete a team, its memberships and its folder subtree
    pub async fn delete_team(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        team_id: &str,
    ) -> VaultResult<MutationOutcome> {
        Self::require_admin(principal, "deleting a team")?;
        let team = self.teams.get(pool, team_id).await?;
        let folder_path = self
            .teams
            .list(pool)
            .await?
            .into_iter()
            .find(|summary| summary.team.id == team.id)
            .map(|summary| summary.folder_path)
            .ok_or_else(|| VaultError::TeamNotFound(team_id.to_string()))?;

        self.teams.delete(pool, &team.id).await?;
        let outcome = self
            .mutator
            .delete_released_team_folder(pool, principal, &folder_path)
            .await?;

        let details = format!("team={}", team.name);
        self.mutator
            .recorder()
            .record(
                pool,
                &principal.user_id,
                ActivityAction::TeamDelete,
                &folder_path,
                Some(&details),
            )
            .await;
        info!(team_id = %team.id, name = %team.name, kind = ?outcome.kind, "Team deleted");
        Ok(outcome)
    }

    pub async fn assign_user(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        team_id: &str,
        user_id: &str,
    ) -> VaultResult<TeamMembership> {
        Self::require_admin(principal, "assigning team members")?;
        let team = self.teams.get(pool, team_id).await?;
        let membership = self
            .teams
            .add_member(pool, &team.id, user_id, &principal.user_id)
            .await?;

        let details = format!("team={} user={}", team.name, user_id);
        self.mutator
            .recorder()
            .record(
                pool,
                &principal.user_id,
                ActivityAction::TeamMemberAdd,
                &paths::join(paths::ROOT, &team.name),
                Some(&details),
            )
            .await;
        info!(team_id = %team.id, user_id = %user_id, "Team member added");
        Ok(membership)
    }

    pub async fn remove_user(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        team_id: &str,
        user_id: &str,
    ) -> VaultResult<()> {
        Self::require_admin(principal, "removing team members")?;
        let team = self.teams.get(pool, team_id).await?;
        self.teams.remove_member(pool, &team.id, user_id).await?;

        let details = format!("team={} user={}", team.name, user_id);
        self.mutator
            .recorder()
            .record(
                pool,
                &principal.user_id,
                ActivityAction::TeamMemberRemove,
                &paths::join(paths::ROOT, &team.name),
                Some(&details),
            )
            .await;
        info!(team_id = %team.id, user_id = %user_id, "Team member removed");
        Ok(())
    }

    pub async fn list_teams(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
    ) -> VaultResult<Vec<TeamSummary>> {
        Self::require_admin(principal, "listing teams")?;
        self.teams.list(pool).await
    }

    /// Teams visible to `principal`: every team for an admin, otherwise the
    /// teams it belongs to
    pub async fn teams_for_user(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
    ) -> VaultResult<Vec<Team>> {
        if principal.is_admin() {
            let teams = self.teams.list(pool).await?;
            return Ok(teams.into_iter().map(|summary| summary.team).collect());
        }
        self.teams.teams_for_user(pool, &principal.user_id).await
    }
}
