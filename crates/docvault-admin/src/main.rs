//! Docvault admin - consistency checks and repairs for a document vault
//!
//! Runs against the same storage root and index database as the service,
//! acting as the built-in system administrator.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docvault::models::Principal;
use docvault::{VaultConfig, VaultState};

#[derive(Parser)]
#[command(name = "docvault-admin", version, about = "Docvault consistency tooling")]
struct Cli {
    /// Physical storage root of the document tree
    #[arg(long, global = true, env = "DOCVAULT_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Index database URL
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// List index entries missing on disk
    CheckIndex,
    /// List disk items missing from the index
    CheckDisk,
    /// Run both checks
    Check,
    /// Remove index entries whose disk item is gone
    CleanIndex {
        /// Apply the removal; without this flag only a preview is printed
        #[arg(long)]
        yes: bool,
    },
    /// Show the most recent activity records
    Logs {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Replay unresolved mutation intents, then prune old resolved ones
    Recover {
        /// Keep resolved intents younger than this many days
        #[arg(long, default_value_t = 30)]
        keep_days: u64,
    },
    /// List teams whose folder is missing on disk
    OrphanedTeams,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docvault=info,docvault_admin=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = VaultConfig::from_env();
    if let Some(root) = cli.storage_root {
        config.storage_root = root;
    }
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    let recent_limit = config.recent_activity_limit;

    let state = VaultState::open(config).await?;
    let pool = state.pool.as_ref();
    let admin = Principal::system();
    let reconciler = &state.reconciler;

    match cli.command {
        Command::CheckIndex => {
            let missing = reconciler.missing_on_disk(pool).await?;
            if cli.json {
                return print_json(&missing);
            }
            for entry in &missing {
                let kind = if entry.is_folder { "folder" } else { "file" };
                println!("missing on disk: {} ({}, owner {})", entry.path, kind, entry.owner_id);
            }
            println!("{} index entries without a disk item", missing.len());
        }
        Command::CheckDisk => {
            let missing = reconciler.missing_in_index(pool).await?;
            if cli.json {
                return print_json(&missing);
            }
            for item in &missing {
                let kind = if item.is_folder { "folder" } else { "file" };
                println!("missing in index: {} ({})", item.path, kind);
            }
            println!("{} disk items without an index entry", missing.len());
        }
        Command::Check => {
            let report = reconciler.check(pool).await?;
            if cli.json {
                return print_json(&report);
            }
            for entry in &report.missing_on_disk {
                println!("missing on disk:  {}", entry.path);
            }
            for item in &report.missing_in_index {
                println!("missing in index: {}", item.path);
            }
            for entry in &report.kind_mismatch {
                let kind = if entry.is_folder { "folder" } else { "file" };
                println!("kind mismatch:    {} (indexed as {})", entry.path, kind);
            }
            if report.is_consistent() {
                println!("disk and index agree");
            }
        }
        Command::CleanIndex { yes } => {
            let result = reconciler.repair_index(pool, &admin, !yes).await?;
            if cli.json {
                return print_json(&result);
            }
            let verb = if yes { "removed" } else { "would remove" };
            for path in &result.removed {
                println!("{}: {}", verb, path);
            }
            for path in &result.skipped_team_folders {
                println!("skipped team folder: {}", path);
            }
            for path in &result.skipped_no_longer_stale {
                println!("back on disk, kept: {}", path);
            }
            for failure in &result.failures {
                println!("failed: {} ({})", failure.path, failure.error);
            }
            if !yes && !result.removed.is_empty() {
                println!("dry run; pass --yes to apply");
            }
        }
        Command::Logs { limit } => {
            let records = reconciler
                .recent_activity(pool, &admin, limit.unwrap_or(recent_limit))
                .await?;
            if cli.json {
                return print_json(&records);
            }
            for record in &records {
                println!(
                    "{} {} {} {} {}",
                    record.timestamp.to_rfc3339(),
                    record.user_id,
                    record.action,
                    record.target_path,
                    record.details.as_deref().unwrap_or("")
                );
            }
        }
        Command::Recover { keep_days } => {
            let report = reconciler.replay_intents(pool, &admin).await?;
            let keep = Duration::from_secs(keep_days.saturating_mul(24 * 60 * 60));
            let pruned = reconciler.prune_intents(pool, &admin, keep).await?;
            if cli.json {
                return print_json(&report);
            }
            println!("pruned {} resolved intents older than {} days", pruned, keep_days);
            println!(
                "recovered {}, abandoned {}, unresolved {}",
                report.recovered.len(),
                report.abandoned.len(),
                report.unresolved.len()
            );
            for intent in &report.unresolved {
                println!(
                    "unresolved: {} {} ({})",
                    intent.op,
                    intent.target_path,
                    intent.state
                );
            }
        }
        Command::OrphanedTeams => {
            let orphaned = reconciler.orphaned_teams(pool).await?;
            if cli.json {
                return print_json(&orphaned);
            }
            for summary in &orphaned {
                println!(
                    "orphaned team {} ({}): folder {} missing, {} members",
                    summary.team.name,
                    summary.team.id,
                    summary.folder_path,
                    summary.members.len()
                );
            }
        }
    }

    info!("Done");
    Ok(())
}
