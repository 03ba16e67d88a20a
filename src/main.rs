use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use archivist::config::{expand_tilde, ArchivistConfig};
use archivist::librarian::Librarian;
use archivist::memory::types::{ListFilter, ListOrder};
use archivist::provider;
use archivist::ranker::Ranker;
use archivist::service::{ContextMode, MemoryService};
use archivist::{db, failover};

#[derive(Parser)]
#[command(name = "archivist", version, about = "Durable memory store for AI agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a memory
    Add {
        content: String,
        /// Store under this user instead of the configured one
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long = "type")]
        memory_type: Option<String>,
        /// JSON object merged into the row's metadata
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Show a memory by id
    Get { id: i64 },
    /// List memories, newest first
    List {
        #[arg(long)]
        namespace: Option<String>,
        /// Only rows created at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value = "created_at")]
        order: ListOrder,
    },
    /// Semantic search over embedded memories
    Search {
        query: String,
        #[arg(short, default_value_t = 10)]
        k: usize,
        /// Restrict to these namespaces (repeatable)
        #[arg(long = "namespace")]
        namespaces: Vec<String>,
    },
    /// Assemble a token-budgeted context bundle
    Context {
        /// Token budget; defaults to the configured value
        #[arg(long)]
        budget: Option<usize>,
        #[arg(long, default_value = "priority")]
        mode: ContextMode,
        /// Query text, required for semantic mode
        #[arg(long)]
        query: Option<String>,
    },
    /// Rank unranked memories with the configured LLM
    Rank {
        #[arg(long, default_value_t = 500)]
        max_rows: usize,
        /// Clear existing ranks first (full re-rank)
        #[arg(long)]
        clear: bool,
    },
    /// Run the background vectorizer
    Librarian {
        /// Run a single full sweep and exit
        #[arg(long)]
        once: bool,
    },
    /// Pull recent primary rows into the local store
    Sync,
    /// Show store, index, and provider health
    Status,
    /// Index maintenance operations
    Maintenance {
        #[command(subcommand)]
        action: MaintenanceAction,
    },
    /// Soft-delete a memory (tombstone); --hard removes it entirely
    Forget {
        id: i64,
        #[arg(long)]
        hard: bool,
    },
}

#[derive(Subcommand)]
enum MaintenanceAction {
    /// Remove index entries whose memory row is gone
    PurgeOrphans,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ArchivistConfig::load()?;

    // Log to stderr so stdout stays clean for piped output.
    let filter = EnvFilter::try_new(&config.general.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Add {
            content,
            user,
            namespace,
            memory_type,
            metadata,
        } => {
            let metadata = metadata
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()
                .context("--metadata must be valid JSON")?;
            let service = MemoryService::open(config)?;
            let id = service.add_memory(
                user.as_deref(),
                &content,
                namespace.as_deref(),
                memory_type.as_deref(),
                metadata.as_ref(),
            )?;
            println!("{id}");
        }
        Command::Get { id } => {
            let service = MemoryService::open(config)?;
            let record = service.get_memory(id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::List {
            namespace,
            since,
            limit,
            order,
        } => {
            let service = MemoryService::open(config)?;
            let filter = ListFilter {
                namespace,
                since,
                limit,
                order,
            };
            for record in service.list_memories(&filter)? {
                let preview: String = record
                    .content
                    .as_deref()
                    .unwrap_or("(tombstone)")
                    .chars()
                    .take(80)
                    .collect();
                println!("{:>6}  {:<18} {:<20} {}", record.id, record.namespace, record.created_at, preview);
            }
        }
        Command::Search {
            query,
            k,
            namespaces,
        } => {
            let service = MemoryService::open(config)?;
            let namespaces = if namespaces.is_empty() {
                None
            } else {
                Some(namespaces.as_slice())
            };
            for (record, similarity) in service.search_memories(&query, k, namespaces)? {
                let preview: String = record
                    .content
                    .as_deref()
                    .unwrap_or("(tombstone)")
                    .chars()
                    .take(80)
                    .collect();
                println!("{similarity:.4}  [{}] {}", record.id, preview);
            }
        }
        Command::Context {
            budget,
            mode,
            query,
        } => {
            let service = MemoryService::open(config)?;
            let bundle = service.load_context(budget, mode, query.as_deref())?;
            eprintln!(
                "{} memories, ~{} tokens",
                bundle.memory_ids.len(),
                bundle.used_tokens
            );
            println!("{}", bundle.text);
        }
        Command::Rank { max_rows, clear } => {
            let service = MemoryService::open(config.clone())?;
            let llm = provider::create_llm_provider(&config.ranker)?;
            let ranker = Ranker::new(service.connection(), llm, config.ranker);

            if clear {
                let cleared = ranker.clear_ranks()?;
                println!("Cleared {cleared} existing ranks");
            }

            let pending = (ranker.unranked_count()? as usize).min(max_rows);
            if pending == 0 {
                println!("Nothing to rank");
                return Ok(());
            }

            let pb = ProgressBar::new(pending as u64);
            pb.set_style(
                ProgressStyle::with_template("{bar:40} {pos}/{len} ranked ({eta})")
                    .expect("valid progress template"),
            );
            let report = tokio::task::block_in_place(|| {
                ranker.rank_unranked(max_rows, |done| pb.set_position(done as u64))
            })?;
            pb.finish_and_clear();

            println!("Ranked {} memories ({} errors)", report.ranked, report.error_count);
            for (level, count) in report.distribution.iter().enumerate() {
                println!("  level {}: {}", level + 1, count);
            }
        }
        Command::Librarian { once } => {
            let service = MemoryService::open(config.clone())?;
            let mut librarian = Librarian::new(
                service.connection(),
                service.embedding_provider(),
                config.librarian,
            );

            if once {
                let stats = tokio::task::block_in_place(|| librarian.run_once(true))?;
                println!(
                    "scanned {} embedded {} skipped {} failed {}",
                    stats.scanned, stats.embedded, stats.skipped, stats.failed
                );
                return Ok(());
            }

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(true);
                }
            });
            librarian.run(shutdown_rx).await;
        }
        Command::Sync => {
            let Some(primary_path) = config.storage.primary_db_path.as_deref() else {
                bail!("no primary_db_path configured; nothing to sync from");
            };
            let dimensions = config.embedding.dimensions;
            let primary = db::open_database(expand_tilde(primary_path), dimensions)
                .context("failed to open primary store")?;
            let local = db::open_database(config.resolved_local_db_path(), dimensions)
                .context("failed to open local store")?;

            let report = failover::sync_from_primary(
                &primary,
                &local,
                config.storage.retention_sync_window_days,
            )?;
            println!(
                "fetched {} synced {} skipped {}",
                report.fetched, report.synced, report.skipped
            );
        }
        Command::Status => {
            let service = MemoryService::open(config)?;
            let health = service.health();

            println!("Archivist Status");
            println!("{}", "=".repeat(40));
            println!("  Store ({}):   {}", health.role, ok_fail(health.store));
            println!("  Index:          {}", ok_fail(health.index));
            println!("  Provider:       {}", ok_fail(health.provider));
            match health.lag_p90_s {
                Some(lag) => println!("  Freshness p90:  {lag:.1}s"),
                None => println!("  Freshness p90:  n/a (empty index)"),
            }
            println!("  Memories:       {}", health.total_memories);
            println!("  Vectors:        {}", health.vector_entries);
            println!();

            println!("By Namespace:");
            for (namespace, count) in service.count_by_namespace()? {
                println!("  {namespace:<20} {count}");
            }
        }
        Command::Maintenance { action } => match action {
            MaintenanceAction::PurgeOrphans => {
                let service = MemoryService::open(config)?;
                let purged = service.purge_orphans()?;
                println!("Purged {purged} orphan entries");
            }
        },
        Command::Forget { id, hard } => {
            let service = MemoryService::open(config)?;
            service.forget(id, hard)?;
            println!("{}", if hard { "deleted" } else { "tombstoned" });
        }
    }

    Ok(())
}

fn ok_fail(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "FAIL"
    }
}
