// ============================================================================
// memchat-db - CLI inspection tool for the memchat history DB and job broker
// ============================================================================
// Usage:
//   memchat-db stats                            Show history and queue statistics
//   memchat-db list-conversations [--user ID]   List conversations by recency
//   memchat-db history ID                       Print one conversation
//   memchat-db jobs [--state STATE]             List dispatcher jobs
//   memchat-db export --format json             Export everything as JSON
//   memchat-db prune --older-than 30            Prune old finished jobs
// ============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use memchat_core::config::parse_broker_url;
use memchat_core::dispatcher::JobState;
use memchat_core::{HistoryStore, JobQueue, MemchatError};

/// memchat database inspection tool
#[derive(Parser)]
#[command(name = "memchat-db", version, about = "Inspect and manage the memchat databases")]
struct Cli {
    /// Path to the history database (default: ~/.memchat/history.redb)
    #[arg(long, global = true, env = "MEMCHAT_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Job broker URL or path (default: MEMCHAT_BROKER_URL)
    #[arg(long, global = true, env = "MEMCHAT_BROKER_URL")]
    broker: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show conversation, message and job counts
    Stats,

    /// List conversations, most recently active first
    ListConversations {
        /// Only conversations owned by this user id
        #[arg(long)]
        user: Option<String>,
    },

    /// Print the messages of one conversation
    History {
        conversation_id: u64,
    },

    /// List dispatcher jobs with optional state filter
    Jobs {
        /// Filter by state: enqueued, running, completed, failed
        #[arg(long)]
        state: Option<String>,
    },

    /// Export full database contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Prune finished jobs from the broker
    Prune {
        /// Delete finished jobs older than this many days
        #[arg(long, default_value = "30")]
        older_than: i64,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_state(s: &str) -> Result<JobState> {
    s.parse::<JobState>().map_err(|_| {
        anyhow::anyhow!(
            "Unknown state '{}'. Valid values: enqueued, running, completed, failed",
            s
        )
    })
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn preview(text: &str, width: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > width {
        format!("{}…", flat.chars().take(width).collect::<String>())
    } else {
        flat
    }
}

fn prune_cutoff(now: DateTime<Utc>, older_than: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(older_than)
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| anyhow::anyhow!("--older-than {} days is out of range", older_than))
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let history = || {
        HistoryStore::open(cli.db_path.as_deref()).context("Failed to open history database")
    };
    let broker = || -> Result<JobQueue> {
        let url = cli
            .broker
            .as_deref()
            .context("No broker configured (set MEMCHAT_BROKER_URL or pass --broker)")?;
        let path = parse_broker_url(url)?;
        JobQueue::open(&path).context("Failed to open job broker")
    };

    match &cli.command {
        Commands::Stats => cmd_stats(&history()?, broker().ok().as_ref()),
        Commands::ListConversations { user } => {
            cmd_list_conversations(&history()?, user.as_deref())
        }
        Commands::History { conversation_id } => cmd_history(&history()?, *conversation_id),
        Commands::Jobs { state } => cmd_jobs(&broker()?, state.as_deref()),
        Commands::Export { format } => cmd_export(&history()?, broker().ok().as_ref(), format),
        Commands::Prune {
            older_than,
            dry_run,
        } => cmd_prune(&broker()?, *older_than, *dry_run),
    }
}

fn cmd_stats(db: &HistoryStore, queue: Option<&JobQueue>) -> Result<()> {
    let stats = db.stats()?;

    println!("=== memchat Database Stats ===");
    println!("History: {}", db.path().display());
    println!();
    println!("Conversations: {}", stats.total_conversations);
    println!("Messages:      {}", stats.total_messages);
    println!("Applied jobs:  {}", stats.applied_jobs);

    match queue {
        Some(queue) => {
            let jobs = queue.stats()?;
            println!();
            println!("Broker: {}", queue.path().display());
            println!("Jobs:   {} total", jobs.total());
            println!("  {:12} {}", "enqueued", jobs.enqueued);
            println!("  {:12} {}", "running", jobs.running);
            println!("  {:12} {}", "completed", jobs.completed);
            println!("  {:12} {}", "failed", jobs.failed);
        }
        None => println!("\nBroker: not configured"),
    }

    Ok(())
}

fn cmd_list_conversations(db: &HistoryStore, user: Option<&str>) -> Result<()> {
    let conversations = db.list_conversations(user)?;

    if conversations.is_empty() {
        println!("No conversations found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<24}  {}",
        "ID", "USER", "UPDATED AT", "TITLE"
    );
    println!("{}", "-".repeat(90));

    for convo in &conversations {
        println!(
            "{:<8}  {:<20}  {:<24}  {}",
            convo.id,
            preview(&convo.user_id, 20),
            format_timestamp(&convo.updated_at),
            convo.title
        );
    }

    println!("\nTotal: {} conversations", conversations.len());
    Ok(())
}

fn cmd_history(db: &HistoryStore, conversation_id: u64) -> Result<()> {
    let convo = db
        .get_conversation(conversation_id)?
        .ok_or_else(|| anyhow::anyhow!("Conversation {} not found", conversation_id))?;

    let messages = match db.get_history(conversation_id) {
        Ok(messages) => messages,
        Err(MemchatError::NotFound(_)) => vec![],
        Err(e) => return Err(e.into()),
    };

    println!("=== {} (#{}, user {}) ===", convo.title, convo.id, convo.user_id);
    for message in &messages {
        println!();
        println!("[{}] {}", format_timestamp(&message.created_at), message.role);
        println!("{}", message.content);
    }
    println!("\n{} messages", messages.len());
    Ok(())
}

fn cmd_jobs(queue: &JobQueue, state_filter: Option<&str>) -> Result<()> {
    let filter = state_filter.map(parse_state).transpose()?;
    let jobs = queue.list(filter)?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<9}  {:<8}  {:<24}  {}",
        "JOB ID", "STATE", "ROLE", "CONVO", "ENQUEUED AT", "OUTCOME"
    );
    println!("{}", "-".repeat(100));

    for job in &jobs {
        println!(
            "{:<8}  {:<10}  {:<9}  {:<8}  {:<24}  {}",
            job.id,
            job.state.as_str(),
            job.job.role.as_str(),
            job.job.conversation_id,
            format_timestamp(&job.enqueued_at),
            preview(job.outcome.as_deref().unwrap_or("-"), 40)
        );
    }

    println!("\nTotal: {} jobs", jobs.len());
    Ok(())
}

fn cmd_export(db: &HistoryStore, queue: Option<&JobQueue>, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let mut conversations = Vec::new();
    for convo in db.list_conversations(None)? {
        let messages = db.recent_messages(convo.id, usize::MAX)?;
        conversations.push(serde_json::json!({
            "conversation": convo,
            "messages": messages,
        }));
    }

    let (jobs, queue_stats) = match queue {
        Some(queue) => (Some(queue.list(None)?), Some(queue.stats()?)),
        None => (None, None),
    };

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": db.stats()?,
        "queue_stats": queue_stats,
        "conversations": conversations,
        "jobs": jobs,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_prune(queue: &JobQueue, older_than: i64, dry_run: bool) -> Result<()> {
    let cutoff = prune_cutoff(Utc::now(), older_than)?;

    if dry_run {
        println!("=== DRY RUN - no data will be deleted ===\n");

        let finished: Vec<_> = queue
            .list(None)?
            .into_iter()
            .filter(|j| j.state.is_finished() && j.finished_at.map_or(false, |t| t < cutoff))
            .collect();

        println!(
            "Would prune {} finished jobs older than {} days",
            finished.len(),
            older_than
        );
        for job in &finished {
            println!(
                "  - {} ({}, finished: {})",
                job.id,
                job.state,
                job.finished_at
                    .as_ref()
                    .map(format_timestamp)
                    .unwrap_or_else(|| "N/A".into())
            );
        }
    } else {
        let pruned = queue.prune_finished(cutoff, false)?;
        println!("Pruned {} finished jobs (older than {} days)", pruned, older_than);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_cutoff() {
        let now = Utc::now();
        assert_eq!(prune_cutoff(now, 30).unwrap(), now - Duration::days(30));
        assert_eq!(prune_cutoff(now, 0).unwrap(), now);
    }

    #[test]
    fn test_prune_cutoff_out_of_range() {
        let now = Utc::now();
        assert!(prune_cutoff(now, i64::MAX).is_err());
        assert!(prune_cutoff(now, 1_000_000_000).is_err());
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("failed").unwrap(), JobState::Failed);
        assert!(parse_state("exploded").is_err());
    }
}
