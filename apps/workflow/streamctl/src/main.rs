//! streamctl
//!
//! Operator tool for workflow event streams. Connection and stream settings
//! come from the same `REDIS_*` / `WORKFLOW_STREAM_*` environment the
//! services use, so commands act on exactly what they see.

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use std::net::SocketAddr;
use tracing::info;
use workflow_streams::{RedisSettings, StreamSettings, WorkflowStreams, metrics};

mod commands;

#[derive(Parser)]
#[command(name = "streamctl")]
#[command(about = "Inspect and operate workflow event streams")]
struct Cli {
    /// Serve Prometheus metrics on this address while the command runs
    #[arg(long, global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one event to an execution's stream
    Publish {
        execution_id: String,

        /// Event name, e.g. TICKET_CREATED
        #[arg(short, long)]
        name: String,

        /// Payload fields as a JSON object
        #[arg(short, long, default_value = "{}")]
        data: String,

        /// Use a fixed event id instead of a generated one
        #[arg(long)]
        event_id: Option<String>,
    },

    /// Consume an execution's events and print them until Ctrl-C
    Tail {
        execution_id: String,

        /// Deliveries buffered between the consumer loop and the printer
        #[arg(short, long, default_value_t = 16)]
        capacity: usize,
    },

    /// Dead letter queue operations
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Show stream, group and DLQ state for an execution
    Info { execution_id: String },

    /// Distributed lock operations
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead-lettered messages, oldest first
    List {
        execution_id: String,

        #[arg(short, long, default_value_t = 20)]
        count: usize,
    },

    /// Show DLQ length and boundary ids
    Stats { execution_id: String },

    /// Replay a dead-lettered message onto the live stream
    Reprocess {
        execution_id: String,
        dlq_message_id: String,
    },
}

#[derive(Subcommand)]
enum LockCommands {
    /// Take the lock if free
    Acquire {
        key: String,
        owner: String,

        #[arg(long, default_value_t = 30_000)]
        ttl_ms: u64,
    },

    /// Release the lock if held by owner
    Release { key: String, owner: String },

    /// Reset the TTL if held by owner
    Extend {
        key: String,
        owner: String,

        #[arg(long, default_value_t = 30_000)]
        ttl_ms: u64,
    },

    /// Show the current holder and remaining TTL
    Show { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr {
        let bound = metrics::serve_metrics(addr)?;
        info!(address = %bound, "Serving metrics");
    }

    let redis = RedisSettings::from_env().wrap_err("invalid Redis configuration")?;
    let settings = StreamSettings::from_env().wrap_err("invalid stream configuration")?;

    info!(redis = %redis.display_address(), "Connecting to Redis...");
    let streams = WorkflowStreams::connect(&redis, settings)
        .await
        .wrap_err("Redis connection failed")?;

    match cli.command {
        Commands::Publish {
            execution_id,
            name,
            data,
            event_id,
        } => commands::publish(&streams, &execution_id, &name, &data, event_id).await?,

        Commands::Tail {
            execution_id,
            capacity,
        } => commands::tail(&streams, &execution_id, capacity).await?,

        Commands::Dlq { command } => match command {
            DlqCommands::List {
                execution_id,
                count,
            } => commands::dlq_list(&streams, &execution_id, count).await?,
            DlqCommands::Stats { execution_id } => {
                commands::dlq_stats(&streams, &execution_id).await?
            }
            DlqCommands::Reprocess {
                execution_id,
                dlq_message_id,
            } => commands::dlq_reprocess(&streams, &execution_id, &dlq_message_id).await?,
        },

        Commands::Info { execution_id } => commands::info(&streams, &execution_id).await?,

        Commands::Lock { command } => match command {
            LockCommands::Acquire { key, owner, ttl_ms } => {
                commands::lock_acquire(&streams, &key, &owner, ttl_ms).await?
            }
            LockCommands::Release { key, owner } => {
                commands::lock_release(&streams, &key, &owner).await?
            }
            LockCommands::Extend { key, owner, ttl_ms } => {
                commands::lock_extend(&streams, &key, &owner, ttl_ms).await?
            }
            LockCommands::Show { key } => commands::lock_show(&streams, &key).await?,
        },
    }

    Ok(())
}
