//! Path index - the relational record of the document tree
//!
//! One row per file or folder, keyed by canonical path. Subtree operations
//! match descendants with `substr` on the `prefix + "/"` string rather than
//! `LIKE`, which is case-insensitive in SQLite and treats `%`/`_` in names as
//! wildcards.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{is_unique_violation, VaultError, VaultResult};
use crate::models::{Entry, EntryFilter};
use crate::paths;

const ENTRY_COLUMNS: &str =
    "id, name, path, is_folder, size, owner_id, created_at, modified_at";

type EntryRow = (
    String,
    String,
    String,
    i32,
    i64,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn into_entry(row: EntryRow) -> Entry {
    Entry {
        id: row.0,
        name: row.1,
        path: row.2,
        is_folder: row.3 != 0,
        size: row.4,
        owner_id: row.5,
        created_at: row.6,
        modified_at: row.7,
    }
}

/// `prefix + "/"` and its length in characters, for `substr` matching
fn descendant_prefix(prefix: &str) -> (String, i64) {
    let child_prefix = if paths::is_root(prefix) {
        paths::ROOT.to_string()
    } else {
        format!("{}/", prefix)
    };
    let len = child_prefix.chars().count() as i64;
    (child_prefix, len)
}

/// Path index service
pub struct PathIndex;

impl PathIndex {
    pub fn new() -> Self {
        Self
    }

    /// Get the entry at a canonical path
    pub async fn get(&self, pool: &SqlitePool, path: &str) -> VaultResult<Option<Entry>> {
        let sql = format!("SELECT {} FROM entries WHERE path = ?", ENTRY_COLUMNS);
        let row = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(path)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(into_entry))
    }

    /// Get every entry among `paths` that is indexed, in one query
    pub async fn get_many(&self, pool: &SqlitePool, paths: &[String]) -> VaultResult<Vec<Entry>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; paths.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM entries WHERE path IN ({})",
            ENTRY_COLUMNS, placeholders
        );
        let mut query = sqlx::query_as::<_, EntryRow>(&sql);
        for path in paths {
            query = query.bind(path);
        }

        let rows = query.fetch_all(pool).await?;
        Ok(rows.into_iter().map(into_entry).collect())
    }

    /// Direct children of a folder, ordered by name
    pub async fn list_children(&self, pool: &SqlitePool, path: &str) -> VaultResult<Vec<Entry>> {
        let (child_prefix, len) = descendant_prefix(path);
        let sql = format!(
            r#"
            SELECT {} FROM entries
            WHERE substr(path, 1, ?) = ?
              AND length(path) > ?
              AND instr(substr(path, ? + 1), '/') = 0
            ORDER BY name
            "#,
            ENTRY_COLUMNS
        );
        let rows = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(len)
            .bind(&child_prefix)
            .bind(len)
            .bind(len)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(into_entry).collect())
    }

    /// True if anything is indexed below `path`
    pub async fn has_descendants(&self, pool: &SqlitePool, path: &str) -> VaultResult<bool> {
        let (child_prefix, len) = descendant_prefix(path);
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entries WHERE substr(path, 1, ?) = ? AND length(path) > ?",
        )
        .bind(len)
        .bind(&child_prefix)
        .bind(len)
        .fetch_one(pool)
        .await?;
        Ok(count > 0)
    }

    /// Insert a new entry. Fails with `DuplicatePath` if the path is taken.
    pub async fn insert(&self, pool: &SqlitePool, entry: &Entry) -> VaultResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO entries (id, name, path, is_folder, size, owner_id, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.name)
        .bind(&entry.path)
        .bind(entry.is_folder as i32)
        .bind(entry.size)
        .bind(&entry.owner_id)
        .bind(entry.created_at)
        .bind(entry.modified_at)
        .execute(pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(VaultError::DuplicatePath {
                path: entry.path.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a single entry to a new path, updating its name
    pub async fn update_path(
        &self,
        pool: &SqlitePool,
        old_path: &str,
        new_path: &str,
    ) -> VaultResult<()> {
        let result = sqlx::query(
            "UPDATE entries SET path = ?, name = ?, modified_at = ? WHERE path = ?",
        )
        .bind(new_path)
        .bind(paths::name(new_path))
        .bind(Utc::now())
        .bind(old_path)
        .execute(pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 0 => Err(VaultError::not_found(old_path)),
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(VaultError::DuplicatePath {
                path: new_path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite `old_prefix` and every path below it to live under
    /// `new_prefix`, keeping each suffix. Returns the number of rows
    /// rewritten (descendants plus the entry itself). All rows change in one
    /// transaction or none do.
    pub async fn bulk_reparent(
        &self,
        pool: &SqlitePool,
        old_prefix: &str,
        new_prefix: &str,
    ) -> VaultResult<u64> {
        let old_len = old_prefix.chars().count() as i64;
        let (child_prefix, child_len) = descendant_prefix(old_prefix);
        let now = Utc::now();

        let mut tx = pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE entries
            SET path = ? || substr(path, ? + 1), modified_at = ?
            WHERE path = ? OR substr(path, 1, ?) = ?
            "#,
        )
        .bind(new_prefix)
        .bind(old_len)
        .bind(now)
        .bind(old_prefix)
        .bind(child_len)
        .bind(&child_prefix)
        .execute(&mut *tx)
        .await;

        let rewritten = match result {
            Ok(r) => r.rows_affected(),
            Err(e) if is_unique_violation(&e) => {
                return Err(VaultError::DuplicatePath {
                    path: new_prefix.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        sqlx::query("UPDATE entries SET name = ? WHERE path = ?")
            .bind(paths::name(new_prefix))
            .bind(new_prefix)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            old_prefix = %old_prefix,
            new_prefix = %new_prefix,
            rewritten,
            "Reparented index subtree"
        );
        Ok(rewritten)
    }

    /// Remove a single entry. Returns false if nothing was indexed there.
    pub async fn delete(&self, pool: &SqlitePool, path: &str) -> VaultResult<bool> {
        let result = sqlx::query("DELETE FROM entries WHERE path = ?")
            .bind(path)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove an entry and every descendant. Returns the number of rows removed.
    pub async fn delete_subtree(&self, pool: &SqlitePool, prefix: &str) -> VaultResult<u64> {
        let (child_prefix, child_len) = descendant_prefix(prefix);
        let result = sqlx::query("DELETE FROM entries WHERE path = ? OR substr(path, 1, ?) = ?")
            .bind(prefix)
            .bind(child_len)
            .bind(&child_prefix)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn find_by_owner(&self, pool: &SqlitePool, owner_id: &str) -> VaultResult<Vec<Entry>> {
        let sql = format!(
            "SELECT {} FROM entries WHERE owner_id = ? ORDER BY path",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(owner_id)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(into_entry).collect())
    }

    /// Entries whose name starts with `prefix`, ignoring ASCII case
    pub async fn find_by_name_prefix(
        &self,
        pool: &SqlitePool,
        prefix: &str,
    ) -> VaultResult<Vec<Entry>> {
        let sql = format!(
            "SELECT {} FROM entries WHERE substr(lower(name), 1, ?) = lower(?) ORDER BY path",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(into_entry).collect())
    }

    /// Case-insensitive substring search over one owner's entries
    pub async fn search(
        &self,
        pool: &SqlitePool,
        owner_id: &str,
        text: &str,
    ) -> VaultResult<Vec<Entry>> {
        let sql = format!(
            r#"
            SELECT {} FROM entries
            WHERE owner_id = ? AND instr(lower(name), lower(?)) > 0
            ORDER BY path
            "#,
            ENTRY_COLUMNS
        );
        let rows = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(owner_id)
            .bind(text)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(into_entry).collect())
    }

    /// List entries matching a filter, ordered by path
    pub async fn filter(&self, pool: &SqlitePool, filter: &EntryFilter) -> VaultResult<Vec<Entry>> {
        let mut sql = format!("SELECT {} FROM entries WHERE 1=1", ENTRY_COLUMNS);
        let mut bindings: Vec<String> = vec![];

        if let Some(ref owner_id) = filter.owner_id {
            sql.push_str(" AND owner_id = ?");
            bindings.push(owner_id.clone());
        }
        match filter.is_folder {
            Some(true) => sql.push_str(" AND is_folder = 1"),
            Some(false) => sql.push_str(" AND is_folder = 0"),
            None => {}
        }
        sql.push_str(" ORDER BY path");

        let mut query = sqlx::query_as::<_, EntryRow>(&sql);
        for binding in bindings {
            query = query.bind(binding);
        }
        let rows = query.fetch_all(pool).await?;

        // Timestamp bounds are compared as instants, not as stored text
        Ok(rows
            .into_iter()
            .map(into_entry)
            .filter(|entry| filter.matches(entry))
            .collect())
    }

    /// Every indexed entry, ordered by path
    pub async fn all_entries(&self, pool: &SqlitePool) -> VaultResult<Vec<Entry>> {
        let sql = format!("SELECT {} FROM entries ORDER BY path", ENTRY_COLUMNS);
        let rows = sqlx::query_as::<_, EntryRow>(&sql).fetch_all(pool).await?;
        Ok(rows.into_iter().map(into_entry).collect())
    }
}

impl Default for PathIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;

    async fn seed(env: &TestEnv, folders: &[&str], files: &[&str]) {
        let index = PathIndex::new();
        for path in folders {
            index
                .insert(&env.pool, &Entry::new_folder(path, "alice"))
                .await
                .unwrap();
        }
        for path in files {
            index
                .insert(&env.pool, &Entry::new_file(path, "alice", 10))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_insert_and_duplicate() {
        let env = TestEnv::new().await;
        let index = PathIndex::new();

        index
            .insert(&env.pool, &Entry::new_folder("/Eng", "admin"))
            .await
            .unwrap();
        let entry = index.get(&env.pool, "/Eng").await.unwrap().unwrap();
        assert_eq!(entry.name, "Eng");
        assert!(entry.is_top_level_folder());

        let err = index
            .insert(&env.pool, &Entry::new_folder("/Eng", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::DuplicatePath { .. }));
    }

    #[tokio::test]
    async fn test_list_children_is_direct_and_ordered() {
        let env = TestEnv::new().await;
        seed(&env, &["/A", "/A/sub", "/AB"], &["/A/z.txt", "/A/b.txt", "/A/sub/deep.txt"]).await;

        let index = PathIndex::new();
        let names: Vec<String> = index
            .list_children(&env.pool, "/A")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["b.txt", "sub", "z.txt"]);

        let top: Vec<String> = index
            .list_children(&env.pool, "/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(top, vec!["/A", "/AB"]);
    }

    #[tokio::test]
    async fn test_bulk_reparent_rewrites_subtree_only() {
        let env = TestEnv::new().await;
        seed(
            &env,
            &["/A", "/A/sub", "/AB", "/B"],
            &["/A/x.txt", "/A/sub/y.txt", "/AB/keep.txt"],
        )
        .await;

        let index = PathIndex::new();
        let before: Vec<Entry> = index.all_entries(&env.pool).await.unwrap();
        let rewritten = index.bulk_reparent(&env.pool, "/A", "/B/A").await.unwrap();
        // 3 descendants + the folder itself
        assert_eq!(rewritten, 4);

        // Every row keeps its id and has its suffix carried under the new prefix
        let after: std::collections::HashMap<String, String> = index
            .all_entries(&env.pool)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.id, e.path))
            .collect();
        for entry in &before {
            let expected = paths::rebase(&entry.path, "/A", "/B/A").unwrap_or(entry.path.clone());
            assert_eq!(after[&entry.id], expected);
        }

        let paths: Vec<String> = index
            .all_entries(&env.pool)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(
            paths,
            vec!["/AB", "/AB/keep.txt", "/B", "/B/A", "/B/A/sub", "/B/A/sub/y.txt", "/B/A/x.txt"]
        );

        let moved = index.get(&env.pool, "/B/A").await.unwrap().unwrap();
        assert_eq!(moved.name, "A");
    }

    #[tokio::test]
    async fn test_bulk_reparent_rename_updates_name() {
        let env = TestEnv::new().await;
        seed(&env, &["/docs"], &["/docs/a.txt"]).await;

        let index = PathIndex::new();
        assert_eq!(index.bulk_reparent(&env.pool, "/docs", "/papers").await.unwrap(), 2);
        let renamed = index.get(&env.pool, "/papers").await.unwrap().unwrap();
        assert_eq!(renamed.name, "papers");
        assert!(index.get(&env.pool, "/papers/a.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bulk_reparent_collision_changes_nothing() {
        let env = TestEnv::new().await;
        seed(&env, &["/A", "/B"], &["/A/x.txt"]).await;

        let index = PathIndex::new();
        let err = index.bulk_reparent(&env.pool, "/A", "/B").await.unwrap_err();
        assert!(matches!(err, VaultError::DuplicatePath { .. }));
        assert!(index.get(&env.pool, "/A/x.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_subtree() {
        let env = TestEnv::new().await;
        seed(&env, &["/A", "/A/sub", "/AB"], &["/A/sub/y.txt"]).await;

        let index = PathIndex::new();
        assert_eq!(index.delete_subtree(&env.pool, "/A").await.unwrap(), 3);
        assert!(index.get(&env.pool, "/AB").await.unwrap().is_some());
        assert!(!index.has_descendants(&env.pool, "/A").await.unwrap());
        assert!(!index.delete(&env.pool, "/A").await.unwrap());
    }

    #[tokio::test]
    async fn test_search_and_filter() {
        let env = TestEnv::new().await;
        let index = PathIndex::new();
        index
            .insert(&env.pool, &Entry::new_folder("/Reports", "alice"))
            .await
            .unwrap();
        index
            .insert(&env.pool, &Entry::new_file("/Reports/Q1-report.pdf", "alice", 5))
            .await
            .unwrap();
        index
            .insert(&env.pool, &Entry::new_file("/Reports/q2-report.pdf", "bob", 7))
            .await
            .unwrap();

        let found = index.search(&env.pool, "alice", "REPORT").await.unwrap();
        assert_eq!(found.len(), 2);

        let by_prefix = index.find_by_name_prefix(&env.pool, "q").await.unwrap();
        assert_eq!(by_prefix.len(), 2);

        let bob_files = index
            .filter(
                &env.pool,
                &EntryFilter {
                    owner_id: Some("bob".into()),
                    is_folder: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(bob_files.len(), 1);
        assert_eq!(bob_files[0].path, "/Reports/q2-report.pdf");

        let future_only = index
            .filter(
                &env.pool,
                &EntryFilter {
                    created_after: Some(Utc::now() + chrono::Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(future_only.is_empty());
    }
}
