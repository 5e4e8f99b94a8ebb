//! Team registry - binds top-level folders to teams and teams to members

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{is_unique_violation, VaultError, VaultResult};
use crate::models::{Principal, Team, TeamMembership, TeamSummary};
use crate::paths;

type TeamRow = (String, String, String, DateTime<Utc>);
type MembershipRow = (String, String, String, DateTime<Utc>);

fn into_team(row: TeamRow) -> Team {
    Team {
        id: row.0,
        name: row.1,
        folder_id: row.2,
        created_at: row.3,
    }
}

fn into_membership(row: MembershipRow) -> TeamMembership {
    TeamMembership {
        user_id: row.0,
        team_id: row.1,
        granted_by: row.2,
        granted_at: row.3,
    }
}

/// Team registry service
pub struct TeamRegistry;

impl TeamRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn is_admin(principal: &Principal) -> bool {
        principal.is_admin()
    }

    /// Team bound to the top-level folder `name`, if any.
    ///
    /// Only a folder entry at depth 1 whose id is some team's `folder_id`
    /// makes a path team-governed.
    pub async fn team_for_top_level_folder(
        &self,
        pool: &SqlitePool,
        name: &str,
    ) -> VaultResult<Option<Team>> {
        let row = sqlx::query_as::<_, TeamRow>(
            r#"
            SELECT t.id, t.name, t.folder_id, t.created_at
            FROM teams t
            JOIN entries e ON e.id = t.folder_id
            WHERE e.path = ? AND e.is_folder = 1
            "#,
        )
        .bind(paths::join(paths::ROOT, name))
        .fetch_optional(pool)
        .await?;
        Ok(row.map(into_team))
    }

    /// Team governing a canonical path through its first segment
    pub async fn team_for_path(&self, pool: &SqlitePool, path: &str) -> VaultResult<Option<Team>> {
        match paths::top_segment(path) {
            Some(top) => self.team_for_top_level_folder(pool, top).await,
            None => Ok(None),
        }
    }

    pub async fn is_member(
        &self,
        pool: &SqlitePool,
        user_id: &str,
        team_id: &str,
    ) -> VaultResult<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT user_id FROM team_memberships WHERE user_id = ? AND team_id = ?",
        )
        .bind(user_id)
        .bind(team_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn get(&self, pool: &SqlitePool, team_id: &str) -> VaultResult<Team> {
        sqlx::query_as::<_, TeamRow>(
            "SELECT id, name, folder_id, created_at FROM teams WHERE id = ?",
        )
        .bind(team_id)
        .fetch_optional(pool)
        .await?
        .map(into_team)
        .ok_or_else(|| VaultError::TeamNotFound(team_id.to_string()))
    }

    pub async fn find_by_name(&self, pool: &SqlitePool, name: &str) -> VaultResult<Option<Team>> {
        let row = sqlx::query_as::<_, TeamRow>(
            "SELECT id, name, folder_id, created_at FROM teams WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(into_team))
    }

    /// Team whose backing folder sits exactly at `path`
    pub async fn team_for_folder_path(
        &self,
        pool: &SqlitePool,
        path: &str,
    ) -> VaultResult<Option<Team>> {
        if paths::depth(path) != 1 {
            return Ok(None);
        }
        self.team_for_path(pool, path).await
    }

    /// Insert a team. The folder must be an indexed top-level folder.
    pub async fn insert(&self, pool: &SqlitePool, team: &Team) -> VaultResult<()> {
        let folder: Option<(String, i32)> =
            sqlx::query_as("SELECT path, is_folder FROM entries WHERE id = ?")
                .bind(&team.folder_id)
                .fetch_optional(pool)
                .await?;
        match folder {
            Some((path, 1)) if paths::depth(&path) == 1 => {}
            Some((path, _)) => {
                return Err(VaultError::Validation(format!(
                    "Team folder must be a top-level folder: {}",
                    path
                )))
            }
            None => return Err(VaultError::not_found(team.folder_id.clone())),
        }

        let result = sqlx::query(
            "INSERT INTO teams (id, name, folder_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&team.id)
        .bind(&team.name)
        .bind(&team.folder_id)
        .bind(team.created_at)
        .execute(pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(VaultError::TeamExists {
                name: team.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a team row; memberships cascade
    pub async fn delete(&self, pool: &SqlitePool, team_id: &str) -> VaultResult<()> {
        let result = sqlx::query("DELETE FROM teams WHERE id = ?")
            .bind(team_id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(VaultError::TeamNotFound(team_id.to_string()));
        }
        Ok(())
    }

    pub async fn add_member(
        &self,
        pool: &SqlitePool,
        team_id: &str,
        user_id: &str,
        granted_by: &str,
    ) -> VaultResult<TeamMembership> {
        // Surface a missing team as TeamNotFound rather than an FK error
        self.get(pool, team_id).await?;

        let membership = TeamMembership {
            user_id: user_id.to_string(),
            team_id: team_id.to_string(),
            granted_by: granted_by.to_string(),
            granted_at: Utc::now(),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO team_memberships (user_id, team_id, granted_by, granted_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&membership.user_id)
        .bind(&membership.team_id)
        .bind(&membership.granted_by)
        .bind(membership.granted_at)
        .execute(pool)
        .await;

        match result {
            Ok(_) => Ok(membership),
            Err(e) if is_unique_violation(&e) => Err(VaultError::MemberExists {
                user_id: user_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_member(
        &self,
        pool: &SqlitePool,
        team_id: &str,
        user_id: &str,
    ) -> VaultResult<()> {
        let result = sqlx::query("DELETE FROM team_memberships WHERE team_id = ? AND user_id = ?")
            .bind(team_id)
            .bind(user_id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(VaultError::MemberNotFound {
                user_id: user_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn members(&self, pool: &SqlitePool, team_id: &str) -> VaultResult<Vec<TeamMembership>> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT user_id, team_id, granted_by, granted_at
            FROM team_memberships
            WHERE team_id = ?
            ORDER BY user_id
            "#,
        )
        .bind(team_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(into_membership).collect())
    }

    /// Every team with its folder path and members, ordered by name
    pub async fn list(&self, pool: &SqlitePool) -> VaultResult<Vec<TeamSummary>> {
        let rows: Vec<(String, String, String, DateTime<Utc>, String)> = sqlx::query_as(
            r#"
            SELECT t.id, t.name, t.folder_id, t.created_at, e.path
            FROM teams t
            JOIN entries e ON e.id = t.folder_id
            ORDER BY t.name
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (id, name, folder_id, created_at, folder_path) in rows {
            let members = self.members(pool, &id).await?;
            summaries.push(TeamSummary {
                team: Team {
                    id,
                    name,
                    folder_id,
                    created_at,
                },
                folder_path,
                members,
            });
        }
        Ok(summaries)
    }

    /// Teams a user belongs to, ordered by name
    pub async fn teams_for_user(&self, pool: &SqlitePool, user_id: &str) -> VaultResult<Vec<Team>> {
        let rows = sqlx::query_as::<_, TeamRow>(
            r#"
            SELECT t.id, t.name, t.folder_id, t.created_at
            FROM teams t
            JOIN team_memberships m ON m.team_id = t.id
            WHERE m.user_id = ?
            ORDER BY t.name
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(into_team).collect())
    }
}

impl Default for TeamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
