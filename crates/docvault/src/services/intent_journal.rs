//! Write-ahead intent journal
//!
//! Disk and index cannot share a transaction, so every tree mutation first
//! records what it is about to do. The record moves `pending ->
//! disk_applied -> committed`; a crash or error in between leaves it
//! unresolved, and replay converges the index to whatever the disk shows.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{VaultError, VaultResult};
use crate::models::{IntentOp, IntentState, MutationIntent, MutationStage};

type IntentRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const INTENT_COLUMNS: &str = "id, user_id, op, source_path, target_path, state, failed_stage, error, created_at, updated_at";

fn into_intent(row: IntentRow) -> VaultResult<MutationIntent> {
    Ok(MutationIntent {
        id: row.0,
        user_id: row.1,
        op: row.2.parse().map_err(VaultError::Internal)?,
        source_path: row.3,
        target_path: row.4,
        state: row.5.parse().map_err(VaultError::Internal)?,
        failed_stage: row
            .6
            .map(|s| s.parse::<MutationStage>())
            .transpose()
            .map_err(VaultError::Internal)?,
        error: row.7,
        created_at: row.8,
        updated_at: row.9,
    })
}

/// Intent journal service
pub struct IntentJournal;

impl IntentJournal {
    pub fn new() -> Self {
        Self
    }

    /// Record an intent before the disk is touched
    pub async fn begin(
        &self,
        pool: &SqlitePool,
        user_id: &str,
        op: IntentOp,
        source_path: Option<&str>,
        target_path: &str,
    ) -> VaultResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO mutation_intents (id, user_id, op, source_path, target_path, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(op.to_string())
        .bind(source_path)
        .bind(target_path)
        .bind(IntentState::Pending.to_string())
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        debug!(intent_id = %id, %op, target = %target_path, "Intent recorded");
        Ok(id)
    }

    /// Move an intent to a new state
    pub async fn advance(&self, pool: &SqlitePool, id: &str, state: IntentState) -> VaultResult<()> {
        let result = sqlx::query("UPDATE mutation_intents SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state.to_string())
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(VaultError::Internal(format!("Unknown intent: {}", id)));
        }
        debug!(intent_id = %id, %state, "Intent advanced");
        Ok(())
    }

    /// Mark an intent failed at `stage`
    pub async fn fail(
        &self,
        pool: &SqlitePool,
        id: &str,
        stage: MutationStage,
        error: &str,
    ) -> VaultResult<()> {
        sqlx::query(
            r#"
            UPDATE mutation_intents
            SET state = ?, failed_stage = ?, error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(IntentState::Failed.to_string())
        .bind(stage.to_string())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Best-effort state change once the disk has been touched. An intent
    /// left behind in an older state is picked up by replay.
    pub async fn note(&self, pool: &SqlitePool, id: &str, state: IntentState) {
        if let Err(e) = self.advance(pool, id, state).await {
            warn!(intent_id = %id, %state, error = %e, "Failed to update intent");
        }
    }

    /// Best-effort failure mark
    pub async fn note_failure(&self, pool: &SqlitePool, id: &str, stage: MutationStage, error: &str) {
        if let Err(e) = self.fail(pool, id, stage, error).await {
            warn!(intent_id = %id, %stage, error = %e, "Failed to mark intent failed");
        }
    }

    pub async fn get(&self, pool: &SqlitePool, id: &str) -> VaultResult<Option<MutationIntent>> {
        let sql = format!("SELECT {} FROM mutation_intents WHERE id = ?", INTENT_COLUMNS);
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.map(into_intent).transpose()
    }

    /// Intents replay still has to examine, oldest first
    pub async fn unresolved(&self, pool: &SqlitePool) -> VaultResult<Vec<MutationIntent>> {
        let sql = format!(
            "SELECT {} FROM mutation_intents WHERE state IN (?, ?, ?) ORDER BY rowid",
            INTENT_COLUMNS
        );
        let mut query = sqlx::query_as::<_, IntentRow>(&sql);
        for state in IntentState::UNRESOLVED {
            query = query.bind(state.to_string());
        }
        let rows = query.fetch_all(pool).await?;
        rows.into_iter().map(into_intent).collect()
    }

    /// Delete resolved intents last touched before `before`. Unresolved
    /// intents are kept whatever their age.
    pub async fn prune_resolved(&self, pool: &SqlitePool, before: DateTime<Utc>) -> VaultResult<u64> {
        let mut query = sqlx::query(
            "DELETE FROM mutation_intents WHERE state IN (?, ?, ?) AND updated_at < ?",
        );
        for state in IntentState::RESOLVED {
            query = query.bind(state.to_string());
        }
        let result = query.bind(before).execute(pool).await?;
        debug!(pruned = result.rows_affected(), before = %before, "Resolved intents pruned");
        Ok(result.rows_affected())
    }
}

impl Default for IntentJournal {
    fn default() -> Self {
        Self::new()
    }
}
