use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use signal_core::usage::{RateTable, UsageTotals};
use signal_core::{
    default_config_path, default_database_path, try_load_dotenv, ConverterKind, DirectHtmlClient,
    Disposition, FileConfig, JinaReaderClient, OpenAiClient, Persistence, ReadStatus,
    ResourceFilter, ResourceQuery, SessionState, SortOrder, SourceStatus, SqliteStore, SyncEvent,
    SyncOrchestrator, TokenUsageLedger,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "signal-sync")]
#[command(about = "Collect, rank, and curate links from the sources you follow")]
struct Args {
    /// Configuration file (defaults to <config_dir>/signal-sync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database (defaults to <data_dir>/signal-sync/signal.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a sync pass over every configured source
    Sync,

    /// List curated resources
    List {
        /// Only resources in any of these categories
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Only resources found on these sources
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Only unread resources
        #[arg(long, conflicts_with = "read")]
        unread: bool,

        /// Only read resources
        #[arg(long)]
        read: bool,

        /// Only resources with this disposition
        #[arg(long, value_enum)]
        status: Vec<StatusArg>,

        #[arg(long, value_enum, default_value = "created")]
        sort: SortArg,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Mark a resource as read (or unread)
    MarkRead {
        link: String,

        #[arg(long)]
        unread: bool,
    },

    /// Attach a note to a resource
    Note { link: String, text: String },

    /// Show usage and cost totals
    Usage,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Accepted,
    Pending,
    Rejected,
}

impl From<StatusArg> for Disposition {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Accepted => Disposition::Accepted,
            StatusArg::Pending => Disposition::PendingReview,
            StatusArg::Rejected => Disposition::Rejected,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Created,
    Score,
    ScoreDate,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Created => SortOrder::CreatedAt,
            SortArg::Score => SortOrder::CombinedScore,
            SortArg::ScoreDate => SortOrder::CombinedThenDate,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,signal_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_orchestrator(args: &Args) -> Result<SyncOrchestrator> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path().context("Could not determine config directory")?,
    };
    let file_config = FileConfig::new(config_path);

    // Prices come from the file when it exists; listing works without one.
    let rates = if file_config.path().exists() {
        file_config.settings()?.rate_table()
    } else {
        RateTable::default()
    };

    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => default_database_path()?,
    };
    let store: Arc<dyn Persistence> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );
    tracing::debug!(path = %db_path.display(), "Opened database");
    let ledger = Arc::new(TokenUsageLedger::with_store(rates, store.clone()));

    let orchestrator = SyncOrchestrator::builder(Arc::new(file_config), Arc::new(OpenAiClient::new()?))
        .converter(ConverterKind::Jina, Arc::new(JinaReaderClient::new()?))
        .converter(ConverterKind::Direct, Arc::new(DirectHtmlClient::new()?))
        .ledger(ledger)
        .store(store)
        .build();

    orchestrator
        .load_state()
        .context("Failed to load stored resources")?;
    Ok(orchestrator)
}

async fn run_sync(orchestrator: &SyncOrchestrator) -> Result<()> {
    let mut handle = orchestrator
        .start_sync()
        .context("Cannot start sync")?;

    let sources = handle.snapshot().sources.len();
    println!("\n🌐 Syncing {} sources...", sources);

    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⏹ Stopping after in-flight calls finish...");
            token.cancel();
        }
    });

    while let Some(event) = handle.next_event().await {
        match event {
            SyncEvent::StatusChanged { source, to, .. } => match to {
                SourceStatus::Fetching => println!("  📥 {}", source),
                SourceStatus::Analyzing => println!("  🤖 {}", source),
                SourceStatus::Done => println!("  ✓ {}", source),
                _ => {}
            },
            SyncEvent::SourceFailed { source, reason } => {
                println!("  ✗ {}", source);
                println!("    {}", reason);
            }
            SyncEvent::ItemsProcessed { counts, .. } => {
                println!(
                    "    {} items: {} new, {} updated, {} malformed",
                    counts.seen, counts.new, counts.updated, counts.malformed
                );
            }
            SyncEvent::Finished { .. } => {}
        }
    }

    let session = handle.wait().await?;
    let icon = match session.state {
        SessionState::Completed => "✅",
        SessionState::Cancelled => "⏹",
        _ => "⚠",
    };
    println!(
        "\n{} Sync {}: {}/{} sources done",
        icon,
        session.state.as_str(),
        session.done_count(),
        session.sources.len()
    );
    for progress in session.sources.iter().filter(|p| p.skipped_unchanged) {
        println!("  (unchanged, skipped analysis: {})", progress.source);
    }
    println!(
        "  {} accepted, {} pending review, {} rejected, {} duplicates, {} malformed",
        session.counts.accepted,
        session.counts.pending_review,
        session.counts.rejected,
        session.counts.duplicate,
        session.counts.malformed
    );

    if !session.persistence_errors.is_empty() {
        println!(
            "\n⚠ {} writes to the database failed:",
            session.persistence_errors.len()
        );
        for error in &session.persistence_errors {
            println!("  {}", error);
        }
    }

    let usage = orchestrator.usage_summary()?;
    println!("\n💰 This run: ${:.4}", usage.session.cost_usd());
    Ok(())
}

fn print_totals(label: &str, totals: &UsageTotals) {
    println!(
        "{}: {} calls, ${:.4}",
        label,
        totals.overall.calls,
        totals.cost_usd()
    );
    for (service, row) in &totals.by_service {
        print!(
            "  {:<24} {:>6} calls  {:>10} in  {:>10} out  ${:.4}",
            service,
            row.calls,
            row.input_units,
            row.output_units,
            row.cost_nanos as f64 / 1e9
        );
        if row.unpriced_calls > 0 {
            print!("  ({} unpriced)", row.unpriced_calls);
        }
        println!();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    try_load_dotenv();
    init_tracing();

    let args = Args::parse();
    let orchestrator = build_orchestrator(&args)?;

    match args.command {
        Command::Sync => run_sync(&orchestrator).await?,

        Command::List {
            categories,
            sources,
            unread,
            read,
            status,
            sort,
            offset,
            limit,
        } => {
            let read_status = match (read, unread) {
                (true, _) => Some(ReadStatus::Read),
                (_, true) => Some(ReadStatus::Unread),
                _ => None,
            };
            let query = ResourceQuery {
                filter: ResourceFilter {
                    categories: (!categories.is_empty()).then_some(categories),
                    sources: (!sources.is_empty()).then_some(sources),
                    read_status,
                    dispositions: (!status.is_empty())
                        .then(|| status.into_iter().map(Disposition::from).collect()),
                },
                sort: sort.into(),
                offset,
                limit,
            };

            let resources = orchestrator.current_resources(&query);
            if resources.is_empty() {
                println!("No resources match.");
            }
            for resource in resources {
                let marker = if resource.read { " " } else { "•" };
                println!(
                    "{} [{:.2}] {} ({})",
                    marker,
                    resource.combined_score,
                    resource.title,
                    resource.disposition.as_str()
                );
                println!("    {}", resource.link);
                if !resource.categories.is_empty() {
                    println!("    {}", resource.categories.join(", "));
                }
                println!(
                    "    added {}",
                    resource.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
                );
                if !resource.notes.is_empty() {
                    println!("    📝 {}", resource.notes);
                }
            }
        }

        Command::MarkRead { link, unread } => match orchestrator.set_read(&link, !unread)? {
            Some(resource) => {
                let state = if unread { "unread" } else { "read" };
                println!("✓ {} marked {}", resource.link, state);
            }
            None => anyhow::bail!("No resource with link {}", link),
        },

        Command::Note { link, text } => match orchestrator.set_notes(&link, &text)? {
            Some(resource) => println!("✓ Note saved for {}", resource.link),
            None => anyhow::bail!("No resource with link {}", link),
        },

        Command::Usage => {
            let usage = orchestrator.usage_summary()?;
            print_totals("All time", &usage.all_time);
        }
    }

    Ok(())
}
