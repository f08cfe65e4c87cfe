use crate::demo::{run_demo, DemoArgs};
use crate::infra::open_store;
use crate::server;
use application_review::config::AppConfig;
use application_review::error::AppError;
use application_review::review::{run_blocking, sweep_processed_markers, ReviewStore};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "Application Review",
    about = "Poll form submissions and run reviewer votes to a final decision",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service and poller (default command)
    Serve(ServeArgs),
    /// Print application counts by status
    Stats,
    /// Delete processed-response markers older than the retention period
    Sweep(SweepArgs),
    /// Run the review scenario against an in-memory store and print every event
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

#[derive(Args, Debug)]
pub(crate) struct SweepArgs {
    /// Retention in days (defaults to PROCESSED_MARKER_TTL_DAYS)
    #[arg(long)]
    pub(crate) older_than_days: Option<u32>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Stats => print_stats().await,
        Command::Sweep(args) => sweep(args).await,
        Command::Demo(args) => run_demo(args).await,
    }
}

async fn print_stats() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let store = open_store(&config.storage)?;
    let stats = run_blocking(&store, |store| store.stats()).await?;

    println!("Applications: {}", stats.total);
    println!("  pending:  {}", stats.pending);
    println!("  accepted: {}", stats.accepted);
    println!("  denied:   {}", stats.denied);
    Ok(())
}

async fn sweep(args: SweepArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let store = open_store(&config.storage)?;
    let days = args
        .older_than_days
        .unwrap_or(config.storage.processed_marker_ttl_days);
    let removed = sweep_processed_markers(&store, days).await?;
    println!("Removed {removed} processed markers older than {days} days");
    Ok(())
}
