//! Path-based authorization
//!
//! Decision order, first match wins:
//! 1. admins may do anything;
//! 2. a team-governed path (its top-level folder backs a team) is open to
//!    team members only, whoever owns the deeper entries;
//! 3. elsewhere the principal must own every ancestor folder between the
//!    root and the target, plus the target itself for rename/move/delete;
//! 4. the root and top-level creations need no ancestor.
//!
//! Every decision reads the registry and the index afresh.

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{VaultError, VaultResult};
use crate::models::{Entry, Principal};
use crate::paths;
use crate::services::{PathIndex, TeamRegistry};

/// What the caller wants to do with a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Create,
    Upload,
    Rename,
    Move,
    Delete,
    Read,
}

impl Intent {
    /// Intents that act on an existing entry and so require owning it
    pub fn addresses_existing_leaf(&self) -> bool {
        matches!(self, Intent::Rename | Intent::Move | Intent::Delete)
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::Create => write!(f, "create"),
            Intent::Upload => write!(f, "upload"),
            Intent::Rename => write!(f, "rename"),
            Intent::Move => write!(f, "move"),
            Intent::Delete => write!(f, "delete"),
            Intent::Read => write!(f, "read"),
        }
    }
}

/// Why a request was denied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Team-governed path and the principal is not a member
    NoTeamAccess { team: String },
    /// An ancestor folder or the addressed entry belongs to someone else
    NotAuthorised { path: String },
    /// An ancestor folder is not in the index
    MissingAncestor { path: String },
    /// An ancestor is a file
    NotAFolder { path: String },
    /// The addressed entry is not in the index
    MissingEntry { path: String },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::NoTeamAccess { team } => write!(f, "no team access ({})", team),
            DenyReason::NotAuthorised { path } => write!(f, "not authorised for {}", path),
            DenyReason::MissingAncestor { path } => write!(f, "folder {} does not exist", path),
            DenyReason::NotAFolder { path } => write!(f, "{} is not a folder", path),
            DenyReason::MissingEntry { path } => write!(f, "{} does not exist", path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Turn a denial into the matching error
    pub fn into_result(self) -> VaultResult<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(match reason {
                DenyReason::NoTeamAccess { .. } | DenyReason::NotAuthorised { .. } => {
                    VaultError::Forbidden {
                        reason: reason.to_string(),
                    }
                }
                DenyReason::MissingAncestor { path } | DenyReason::MissingEntry { path } => {
                    VaultError::not_found(path)
                }
                DenyReason::NotAFolder { path } => {
                    VaultError::invalid_path(path, "ancestor is not a folder")
                }
            }),
        }
    }
}

/// Authorization resolver backed by the path index and team registry
pub struct AuthorizationResolver {
    index: PathIndex,
    teams: TeamRegistry,
}

impl AuthorizationResolver {
    pub fn new() -> Self {
        Self {
            index: PathIndex::new(),
            teams: TeamRegistry::new(),
        }
    }

    /// Decide whether `principal` may perform `intent` on the canonical `path`
    pub async fn authorize(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
        intent: Intent,
    ) -> VaultResult<Decision> {
        if TeamRegistry::is_admin(principal) {
            return Ok(Decision::Allow);
        }

        if let Some(team) = self.teams.team_for_path(pool, path).await? {
            let decision = if self.teams.is_member(pool, &principal.user_id, &team.id).await? {
                Decision::Allow
            } else {
                Decision::Deny(DenyReason::NoTeamAccess { team: team.name })
            };
            debug!(
                user_id = %principal.user_id,
                path = %path,
                %intent,
                allowed = decision.is_allowed(),
                "Team-governed authorization"
            );
            return Ok(decision);
        }

        if paths::is_root(path) || intent == Intent::Read {
            return Ok(Decision::Allow);
        }

        let decision = self.check_ownership_chain(pool, principal, path, intent).await?;
        debug!(
            user_id = %principal.user_id,
            path = %path,
            %intent,
            allowed = decision.is_allowed(),
            "Ownership authorization"
        );
        Ok(decision)
    }

    /// Authorize and convert a denial into an error
    pub async fn require(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
        intent: Intent,
    ) -> VaultResult<()> {
        self.authorize(pool, principal, path, intent)
            .await?
            .into_result()
    }

    /// Ancestors and (for rename/move/delete) the leaf, fetched in one query
    async fn check_ownership_chain(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        path: &str,
        intent: Intent,
    ) -> VaultResult<Decision> {
        let chain = paths::ancestors(path);
        let mut lookup = chain.clone();
        if intent.addresses_existing_leaf() {
            lookup.push(path.to_string());
        }

        let found: HashMap<String, Entry> = self
            .index
            .get_many(pool, &lookup)
            .await?
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();

        // Walk from the top-level folder down to the immediate parent
        for ancestor in chain.iter().rev() {
            let Some(entry) = found.get(ancestor) else {
                return Ok(Decision::Deny(DenyReason::MissingAncestor {
                    path: ancestor.clone(),
                }));
            };
            if !entry.is_folder {
                return Ok(Decision::Deny(DenyReason::NotAFolder {
                    path: ancestor.clone(),
                }));
            }
            if entry.owner_id != principal.user_id {
                return Ok(Decision::Deny(DenyReason::NotAuthorised {
                    path: ancestor.clone(),
                }));
            }
        }

        if intent.addresses_existing_leaf() {
            match found.get(path) {
                None => {
                    return Ok(Decision::Deny(DenyReason::MissingEntry {
                        path: path.to_string(),
                    }))
                }
                Some(leaf) if leaf.owner_id != principal.user_id => {
                    return Ok(Decision::Deny(DenyReason::NotAuthorised {
                        path: path.to_string(),
                    }))
                }
                Some(_) => {}
            }
        }

        Ok(Decision::Allow)
    }
}

impl Default for AuthorizationResolver {
    fn default() -> Self {
        Self::new()
    }
}
