// Oncepay CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Starter and worker share one SQLite database; the worker
// discovers instances the `start` command created.

mod commands;
mod engine;
mod output;

use std::time::Duration;

use clap::{Parser, Subcommand};
use oncepay_durable::Amount;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "oncepay")]
#[command(about = "Oncepay - Durable, at-most-once customer charges")]
#[command(version)]
pub struct Cli {
    /// SQLite database URL
    #[arg(
        long,
        env = "ONCEPAY_DATABASE_URL",
        default_value = "sqlite://oncepay.db"
    )]
    pub database_url: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the dispatch loop until Ctrl-C
    Worker {
        /// Simulated payment processor latency in milliseconds
        #[arg(long, env = "ONCEPAY_CHARGE_LATENCY_MS", default_value = "5000")]
        latency_ms: u64,
    },

    /// Start a charge workflow
    Start {
        /// Customer to charge
        #[arg(long, short)]
        customer: String,

        /// Amount to charge, e.g. 99.99
        #[arg(long, short)]
        amount: Amount,

        /// Seconds to wait before charging
        #[arg(long, short, default_value = "10")]
        wait: u64,

        /// Instance ID (generated if omitted)
        #[arg(long)]
        id: Option<Uuid>,

        /// Wait up to this many seconds for the result
        #[arg(long)]
        wait_for_result: Option<u64>,
    },

    /// Show the status and result of a workflow
    Result {
        /// Workflow instance ID
        id: Uuid,
    },

    /// Show the event history of a workflow
    History {
        /// Workflow instance ID
        id: Uuid,
    },

    /// List recorded charges
    Charges,

    /// Clear the idempotency ledger
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },

    /// Cancel a workflow
    Cancel {
        /// Workflow instance ID
        id: Uuid,

        /// Reason recorded in the history
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL"))
                .unwrap_or_else(|_| "oncepay=info,oncepay_durable=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let output_format = output::OutputFormat::parse(&cli.output);

    let latency = match &cli.command {
        Commands::Worker { latency_ms } => Duration::from_millis(*latency_ms),
        _ => Duration::ZERO,
    };
    let runtime = engine::open(&cli.database_url, latency).await?;

    match cli.command {
        Commands::Worker { .. } => commands::worker::run(runtime).await,
        Commands::Start {
            customer,
            amount,
            wait,
            id,
            wait_for_result,
        } => {
            commands::workflows::start(
                &runtime,
                output_format,
                cli.quiet,
                customer,
                amount,
                wait,
                id,
                wait_for_result,
            )
            .await
        }
        Commands::Result { id } => commands::workflows::result(&runtime, output_format, id).await,
        Commands::History { id } => commands::workflows::history(&runtime, output_format, id).await,
        Commands::Charges => commands::charges::list(&runtime, output_format).await,
        Commands::Reset { yes } => commands::charges::reset(&runtime, cli.quiet, yes).await,
        Commands::Cancel { id, reason } => {
            commands::workflows::cancel(&runtime, output_format, id, reason).await
        }
    }
}
