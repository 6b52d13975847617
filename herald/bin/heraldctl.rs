//! Command-line utility for operating herald queues
//!
//! This tool works directly against the configured store:
//! - Run a single mail or notice drain cycle
//! - Retry deferred mail
//! - Inspect the queue, the suppression list and the delivery log
//! - Queue mail by hand

use std::{path::PathBuf, sync::Arc, time::SystemTime};

use clap::{Parser, Subcommand, ValueEnum};
use herald::Herald;
use herald_delivery::CycleOutcome;
use herald_store::{
    AttemptResult, BackingStore, DeliveryLog, MessageQueue, NoticeQueue, Priority,
    SuppressionList, decode_notices,
};

/// Command-line utility for operating herald queues
#[derive(Parser, Debug)]
#[command(name = "heraldctl")]
#[command(about = "Operate the herald delivery queues", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file; defaults to the daemon's lookup order
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one drain cycle now
    SendAll {
        /// Drain the notice queue instead of the mail queue
        #[arg(long)]
        notices: bool,
    },
    /// Move every deferred item back into a tier
    RetryDeferred {
        #[arg(long, value_enum, default_value = "medium")]
        priority: Tier,
    },
    /// Mail queue inspection
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Suppression list management
    Suppress {
        #[command(subcommand)]
        action: SuppressAction,
    },
    /// Show delivery log entries, newest last
    Log {
        /// Only show the last N entries
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, value_enum)]
        result: Option<ResultFilter>,
    },
    /// Notice batch inspection
    Notices {
        #[command(subcommand)]
        action: NoticeAction,
    },
    /// Queue a mail to one or more recipients
    Enqueue {
        #[arg(long)]
        subject: String,

        #[arg(long, default_value = "")]
        body: String,

        /// Sender; defaults to the configured `default_from`
        #[arg(long)]
        from: Option<String>,

        #[arg(long, value_enum, default_value = "medium")]
        priority: Tier,

        #[arg(required = true)]
        recipients: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// List queued mail
    List {
        /// Filter by tier (`deferred` included)
        #[arg(long, value_enum)]
        priority: Option<TierFilter>,
    },
    /// Show per-tier counts
    Stats,
}

#[derive(Subcommand, Debug)]
enum SuppressAction {
    /// Add an address
    Add { address: String },
    /// List every suppressed address
    List,
    /// Check whether an address is suppressed
    Check { address: String },
}

#[derive(Subcommand, Debug)]
enum NoticeAction {
    /// List pending batches
    List,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Tier {
    High,
    Medium,
    Low,
}

impl From<Tier> for Priority {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::High => Self::High,
            Tier::Medium => Self::Medium,
            Tier::Low => Self::Low,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum TierFilter {
    High,
    Medium,
    Low,
    Deferred,
}

impl From<TierFilter> for Priority {
    fn from(tier: TierFilter) -> Self {
        match tier {
            TierFilter::High => Self::High,
            TierFilter::Medium => Self::Medium,
            TierFilter::Low => Self::Low,
            TierFilter::Deferred => Self::Deferred,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ResultFilter {
    Success,
    Suppressed,
    Failure,
}

impl From<ResultFilter> for AttemptResult {
    fn from(result: ResultFilter) -> Self {
        match result {
            ResultFilter::Success => Self::Success,
            ResultFilter::Suppressed => Self::Suppressed,
            ResultFilter::Failure => Self::Failure,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => herald::find_config_file()?,
    };
    let herald = Herald::from_file(&config_path)?;
    herald_common::audit::init(herald.audit.clone());
    let store = herald.open_store()?;

    match cli.command {
        Commands::SendAll { notices } => cmd_send_all(&herald, store, notices).await?,
        Commands::RetryDeferred { priority } => {
            let promoted = MessageQueue::new(store)
                .retry_deferred(priority.into())
                .await?;
            println!("Promoted {promoted} deferred message(s) to {}", Priority::from(priority));
        }
        Commands::Queue { action } => match action {
            QueueAction::List { priority } => cmd_queue_list(store, priority).await?,
            QueueAction::Stats => cmd_queue_stats(store).await?,
        },
        Commands::Suppress { action } => cmd_suppress(store, action).await?,
        Commands::Log { limit, result } => cmd_log(store, limit, result).await?,
        Commands::Notices {
            action: NoticeAction::List,
        } => cmd_notices_list(store).await?,
        Commands::Enqueue {
            subject,
            body,
            from,
            priority,
            recipients,
        } => {
            let ids = herald
                .mailer(store)
                .send_mail(&subject, &body, from.as_deref(), &recipients, priority.into())
                .await?;
            for id in &ids {
                println!("{id}");
            }
        }
    }

    Ok(())
}

fn format_time(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

async fn cmd_send_all(
    herald: &Herald,
    store: Arc<dyn BackingStore>,
    notices: bool,
) -> anyhow::Result<()> {
    let outcome = if notices {
        herald.notice_worker(store).run_cycle().await?
    } else {
        herald.mail_worker(store).run_cycle().await?
    };

    match outcome {
        CycleOutcome::Completed(summary) => println!("{summary}"),
        CycleOutcome::Skipped => println!("Another process is draining this queue, skipped"),
    }

    Ok(())
}

async fn cmd_queue_list(
    store: Arc<dyn BackingStore>,
    priority: Option<TierFilter>,
) -> anyhow::Result<()> {
    let queue = MessageQueue::new(store);
    let messages = match priority {
        Some(priority) => queue.iterate(priority.into()).await?,
        None => queue.all().await?,
    };

    println!(
        "{:<28} {:<9} {:<20} {:<30} SUBJECT",
        "MESSAGE ID", "PRIORITY", "ENQUEUED", "TO"
    );
    println!("{}", "-".repeat(100));

    for message in &messages {
        println!(
            "{:<28} {:<9} {:<20} {:<30} {}",
            message.id,
            message.priority,
            format_time(message.enqueued_at),
            message.to_address,
            message.subject
        );
    }

    println!("\nTotal: {} message(s)", messages.len());

    Ok(())
}

async fn cmd_queue_stats(store: Arc<dyn BackingStore>) -> anyhow::Result<()> {
    let queue = MessageQueue::new(store.clone());

    println!("{:<10} {:>8}", "TIER", "COUNT");
    println!("{}", "-".repeat(19));
    for priority in Priority::SCHEDULED.into_iter().chain([Priority::Deferred]) {
        println!("{:<10} {:>8}", priority.as_str(), queue.count(priority).await?);
    }

    let batches = NoticeQueue::new(store).count().await?;
    println!("\nEligible mail: {}", queue.eligible().await?);
    println!("Notice batches: {batches}");

    Ok(())
}

async fn cmd_suppress(store: Arc<dyn BackingStore>, action: SuppressAction) -> anyhow::Result<()> {
    let list = SuppressionList::new(store);

    match action {
        SuppressAction::Add { address } => {
            if list.add(&address).await? {
                println!("Suppressed {address}");
            } else {
                println!("{address} was already suppressed");
            }
        }
        SuppressAction::List => {
            let entries = list.list().await?;
            for entry in &entries {
                println!("{:<40} {}", entry.address, format_time(entry.added_at));
            }
            println!("\nTotal: {} address(es)", entries.len());
        }
        SuppressAction::Check { address } => {
            if list.contains(&address).await? {
                println!("{address} is suppressed");
            } else {
                println!("{address} is not suppressed");
            }
        }
    }

    Ok(())
}

async fn cmd_log(
    store: Arc<dyn BackingStore>,
    limit: Option<usize>,
    result: Option<ResultFilter>,
) -> anyhow::Result<()> {
    let log = DeliveryLog::new(store);
    let entries = match result {
        Some(result) => log.entries_with(result.into()).await?,
        None => log.entries().await?,
    };

    let skip = limit.map_or(0, |limit| entries.len().saturating_sub(limit));

    for entry in entries.iter().skip(skip) {
        println!(
            "{} {:<10} {:<28} {:<30} {}",
            format_time(entry.attempted_at),
            entry.result,
            entry.message.id,
            entry.message.to_address,
            entry.detail
        );
    }

    Ok(())
}

async fn cmd_notices_list(store: Arc<dyn BackingStore>) -> anyhow::Result<()> {
    let batches = NoticeQueue::new(store).batches().await?;

    println!("{:<28} {:<20} NOTICES", "BATCH ID", "CREATED");
    println!("{}", "-".repeat(60));

    for batch in &batches {
        let notices = decode_notices(&batch.payload).map_or_else(
            |e| format!("undecodable: {e}"),
            |notices| notices.len().to_string(),
        );
        println!(
            "{:<28} {:<20} {notices}",
            batch.id,
            format_time(batch.created_at)
        );
    }

    println!("\nTotal: {} batch(es)", batches.len());

    Ok(())
}
