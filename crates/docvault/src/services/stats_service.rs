//! Folder statistics service
//!
//! Aggregates recursive subfolder counts, file counts and byte totals for
//! every folder in one pass over the index.

use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::error::VaultResult;
use crate::models::{ActivityAction, FolderStatistics, Principal};
use crate::paths;
use crate::services::{ActivityRecorder, PathIndex, TeamRegistry};

/// Stats service
pub struct StatsService {
    index: PathIndex,
    teams: TeamRegistry,
    recorder: ActivityRecorder,
}

impl StatsService {
    pub fn new(recorder: ActivityRecorder) -> Self {
        Self {
            index: PathIndex::new(),
            teams: TeamRegistry::new(),
            recorder,
        }
    }

    /// Statistics for every folder the principal may read, ordered by path.
    /// Team folders of teams the principal does not belong to are left out.
    pub async fn folder_statistics(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
    ) -> VaultResult<Vec<FolderStatistics>> {
        let entries = self.index.all_entries(pool).await?;

        let hidden: HashSet<String> = if principal.is_admin() {
            HashSet::new()
        } else {
            let own: HashSet<String> = self
                .teams
                .teams_for_user(pool, &principal.user_id)
                .await?
                .into_iter()
                .map(|team| team.id)
                .collect();
            self.teams
                .list(pool)
                .await?
                .into_iter()
                .filter(|summary| !own.contains(&summary.team.id))
                .map(|summary| summary.folder_path)
                .collect()
        };
        let visible = |path: &str| {
            paths::top_segment(path)
                .map(|top| !hidden.contains(&paths::join(paths::ROOT, top)))
                .unwrap_or(true)
        };

        let mut stats: BTreeMap<String, FolderStatistics> = entries
            .iter()
            .filter(|entry| entry.is_folder && visible(&entry.path))
            .map(|entry| {
                (
                    entry.path.clone(),
                    FolderStatistics {
                        folder_name: entry.name.clone(),
                        path: entry.path.clone(),
                        owner_id: entry.owner_id.clone(),
                        subfolder_count: 0,
                        file_count: 0,
                        total_size: 0,
                    },
                )
            })
            .collect();

        for entry in &entries {
            for ancestor in paths::ancestors(&entry.path) {
                if let Some(folder) = stats.get_mut(&ancestor) {
                    if entry.is_folder {
                        folder.subfolder_count += 1;
                    } else {
                        folder.file_count += 1;
                        folder.total_size += entry.size;
                    }
                }
            }
        }

        debug!(user_id = %principal.user_id, folders = stats.len(), "Folder statistics computed");
        self.recorder
            .record(pool, &principal.user_id, ActivityAction::ViewStatistics, paths::ROOT, None)
            .await;
        Ok(stats.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActivityQuery;
    use crate::services::{TeamService, UploadItem};
    use crate::testing::TestEnv;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_folder_statistics_are_recursive() {
        let env = TestEnv::new().await;
        let mutator = env.mutator();
        let alice = Principal::user("alice");
        mutator.create_folder(&env.pool, &alice, "/", "A").await.unwrap();
        mutator.create_folder(&env.pool, &alice, "/A", "B").await.unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A", vec![UploadItem::from_bytes("one.txt", b"12345".to_vec())])
            .await
            .unwrap();
        mutator
            .upload_files(&env.pool, &alice, "/A/B", vec![UploadItem::from_bytes("two.txt", b"123".to_vec())])
            .await
            .unwrap();

        let stats = StatsService::new(env.recorder())
            .folder_statistics(&env.pool, &alice)
            .await
            .unwrap();
        assert_eq!(stats.len(), 2);

        let a = &stats[0];
        assert_eq!(a.path, "/A");
        assert_eq!(a.subfolder_count, 1);
        assert_eq!(a.file_count, 2);
        assert_eq!(a.total_size, 8);

        let b = &stats[1];
        assert_eq!(b.folder_name, "B");
        assert_eq!(b.file_count, 1);
        assert_eq!(b.total_size, 3);
    }

    #[tokio::test]
    async fn test_foreign_team_folders_are_hidden() {
        let env = TestEnv::new().await;
        let mutator = Arc::new(env.mutator());
        let admin = Principal::admin("admin");
        TeamService::new(Arc::clone(&mutator))
            .create_team(&env.pool, &admin, "Eng")
            .await
            .unwrap();
        mutator.create_folder(&env.pool, &admin, "/", "Public").await.unwrap();

        let service = StatsService::new(env.recorder());
        let as_user = service
            .folder_statistics(&env.pool, &Principal::user("u"))
            .await
            .unwrap();
        assert_eq!(as_user.len(), 1);
        assert_eq!(as_user[0].path, "/Public");

        let as_admin = service.folder_statistics(&env.pool, &admin).await.unwrap();
        assert_eq!(as_admin.len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_views_are_logged_once() {
        let env = TestEnv::new().await;
        let service = StatsService::new(env.recorder());
        let user = Principal::user("u");
        service.folder_statistics(&env.pool, &user).await.unwrap();
        service.folder_statistics(&env.pool, &user).await.unwrap();

        let views = env
            .recorder()
            .query(
                &env.pool,
                ActivityQuery {
                    action: Some(ActivityAction::ViewStatistics),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
    }
}
