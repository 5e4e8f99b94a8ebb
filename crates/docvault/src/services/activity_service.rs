//! Activity recording service
//!
//! Appends one audit record per mutation and per sensitive read. Recording
//! never fails the caller: by the time it runs the mutation is already
//! committed, so a database error is logged and swallowed.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::VaultResult;
use crate::models::{ActivityAction, ActivityQuery, ActivityRecord};
use crate::paths;

type ActivityRow = (i64, String, String, String, DateTime<Utc>, Option<String>);

/// Activity recorder
#[derive(Debug, Clone)]
pub struct ActivityRecorder {
    read_dedup_window: Duration,
}

impl ActivityRecorder {
    pub fn new(read_dedup_window: Duration) -> Self {
        Self { read_dedup_window }
    }

    /// Append a record. Returns the new record id, or `None` when the record
    /// was deduplicated or could not be written.
    pub async fn record(
        &self,
        pool: &SqlitePool,
        user_id: &str,
        action: ActivityAction,
        target_path: &str,
        details: Option<&str>,
    ) -> Option<i64> {
        match self
            .try_record(pool, user_id, action, target_path, details)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    %action,
                    target_path = %target_path,
                    error = %e,
                    "Failed to write activity record"
                );
                None
            }
        }
    }

    /// Append a record, surfacing database errors
    pub async fn try_record(
        &self,
        pool: &SqlitePool,
        user_id: &str,
        action: ActivityAction,
        target_path: &str,
        details: Option<&str>,
    ) -> VaultResult<Option<i64>> {
        let now = Utc::now();
        let result = if action.is_dedupable() {
            // Check and insert in one statement so concurrent duplicates
            // serialize on the write lock
            let cutoff = chrono::Duration::from_std(self.read_dedup_window)
                .ok()
                .and_then(|window| now.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            sqlx::query(
                r#"
                INSERT INTO activity_log (user_id, action, target_path, timestamp, details)
                SELECT ?, ?, ?, ?, ?
                WHERE NOT EXISTS (
                    SELECT 1 FROM activity_log
                    WHERE user_id = ? AND action = ? AND timestamp > ?
                )
                "#,
            )
            .bind(user_id)
            .bind(action.as_str())
            .bind(target_path)
            .bind(now)
            .bind(details)
            .bind(user_id)
            .bind(action.as_str())
            .bind(cutoff)
            .execute(pool)
            .await?
        } else {
            sqlx::query(
                r#"
                INSERT INTO activity_log (user_id, action, target_path, timestamp, details)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(user_id)
            .bind(action.as_str())
            .bind(target_path)
            .bind(now)
            .bind(details)
            .execute(pool)
            .await?
        };

        if result.rows_affected() == 0 {
            debug!(user_id = %user_id, %action, "Suppressed duplicate read activity");
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    /// The `limit` most recent records, newest first
    pub async fn recent(&self, pool: &SqlitePool, limit: u32) -> VaultResult<Vec<ActivityRecord>> {
        self.query(
            pool,
            ActivityQuery {
                limit: Some(limit),
                ..Default::default()
            },
        )
        .await
    }

    /// Query activity records with filters, newest first
    pub async fn query(
        &self,
        pool: &SqlitePool,
        query: ActivityQuery,
    ) -> VaultResult<Vec<ActivityRecord>> {
        let mut sql = String::from(
            r#"
            SELECT id, user_id, action, target_path, timestamp, details
            FROM activity_log
            WHERE 1=1
            "#,
        );
        let mut bindings: Vec<String> = vec![];

        if let Some(ref user_id) = query.user_id {
            sql.push_str(" AND user_id = ?");
            bindings.push(user_id.clone());
        }

        if let Some(action) = query.action {
            sql.push_str(" AND action = ?");
            bindings.push(action.to_string());
        }

        if let Some(ref prefix) = query.target_prefix {
            if !paths::is_root(prefix) {
                let child_prefix = format!("{}/", prefix);
                sql.push_str(&format!(
                    " AND (target_path = ? OR substr(target_path, 1, {}) = ?)",
                    child_prefix.chars().count()
                ));
                bindings.push(prefix.clone());
                bindings.push(child_prefix);
            }
        }

        sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");
        let limit = query.limit.unwrap_or(100);
        let offset = query.offset.unwrap_or(0);

        let mut query_builder = sqlx::query_as::<_, ActivityRow>(&sql);
        for binding in bindings {
            query_builder = query_builder.bind(binding);
        }
        query_builder = query_builder.bind(limit as i64).bind(offset as i64);

        let rows = query_builder.fetch_all(pool).await?;

        let records = rows
            .into_iter()
            .filter_map(|row| match row.2.parse::<ActivityAction>() {
                Ok(action) => Some(ActivityRecord {
                    id: row.0,
                    user_id: row.1,
                    action,
                    target_path: row.3,
                    timestamp: row.4,
                    details: row.5,
                }),
                Err(e) => {
                    warn!(id = row.0, error = %e, "Skipping activity record with unknown action");
                    None
                }
            })
            .collect();

        Ok(records)
    }
}
