//! Database migrations for the vault index

/// Migration SQL for vault tables
pub const MIGRATION_SQL: &str = r#"
-- entries: one row per file or folder, keyed by canonical path
CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    path TEXT NOT NULL UNIQUE,
    is_folder INTEGER NOT NULL DEFAULT 0,
    size INTEGER NOT NULL DEFAULT 0,
    owner_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_owner ON entries(owner_id);
CREATE INDEX IF NOT EXISTS idx_entries_name ON entries(name);

-- teams: a team is bound to exactly one top-level folder
CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    folder_id TEXT NOT NULL UNIQUE REFERENCES entries(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL
);

-- team_memberships
CREATE TABLE IF NOT EXISTS team_memberships (
    user_id TEXT NOT NULL,
    team_id TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    granted_by TEXT NOT NULL,
    granted_at TEXT NOT NULL,
    PRIMARY KEY (user_id, team_id)
);
CREATE INDEX IF NOT EXISTS idx_memberships_team ON team_memberships(team_id);

-- activity_log: append-only audit trail
CREATE TABLE IF NOT EXISTS activity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    action TEXT NOT NULL,
    target_path TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_activity_user_action ON activity_log(user_id, action);

-- mutation_intents: written before a mutation touches disk
CREATE TABLE IF NOT EXISTS mutation_intents (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    op TEXT NOT NULL,
    source_path TEXT,
    target_path TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    failed_stage TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_intents_state ON mutation_intents(state)
"#;

/// Run migrations on the given SQLite pool
pub async fn run_migration(pool: &sqlx::SqlitePool) -> Result<(), sqlx::Error> {
    for statement in MIGRATION_SQL.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        // ALTER TABLE ADD COLUMN fails once the column exists
        let result = sqlx::query(statement).execute(pool).await;
        if let Err(ref e) = result {
            let is_alter_table = statement.to_uppercase().contains("ALTER TABLE");
            let is_duplicate_column = e.to_string().contains("duplicate column name");
            if !(is_alter_table && is_duplicate_column) {
                result?;
            }
        }
    }
    Ok(())
}
