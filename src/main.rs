use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence::api::{self, AppState};
use cadence::config::Config;
use cadence::control::ControlService;
use cadence::dispatch::{transport::LoggingTransport, Dispatcher};
use cadence::metrics;
use cadence::store::{open_database, JobStore, ScheduleStore, SqliteJobStore, SqliteScheduleStore};
use cadence::telemetry::TelemetryService;
use cadence::throttle::GovernorRegistry;

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "Send scheduler and throttled dispatch engine for email campaigns",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML); environment variables otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher loop and the control API
    Serve,

    /// Run a single dispatch pass and exit
    Tick,

    /// Print schedule and queue status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Tick => tick(config).await?,
        Commands::Status => status(config).await?,
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("cadence=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("cadence=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

struct Services {
    schedules: Arc<SqliteScheduleStore>,
    jobs: Arc<SqliteJobStore>,
    dispatcher: Arc<Dispatcher>,
    control: Arc<ControlService>,
    telemetry: Arc<TelemetryService>,
}

fn build_services(config: &Config) -> Result<Services> {
    if let Some(parent) = config.database.sqlite_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = open_database(&config.database.sqlite_path)?;
    let schedules = Arc::new(SqliteScheduleStore::new(conn.clone()));
    let jobs = Arc::new(SqliteJobStore::new(conn));
    let governors = Arc::new(GovernorRegistry::new());

    let dispatcher = Arc::new(Dispatcher::new(
        schedules.clone(),
        jobs.clone(),
        Arc::new(LoggingTransport),
        governors.clone(),
        config.dispatcher_config(),
    ));
    let control = Arc::new(ControlService::new(
        schedules.clone(),
        jobs.clone(),
        governors,
    ));
    let telemetry = Arc::new(TelemetryService::new(schedules.clone(), jobs.clone()));

    Ok(Services {
        schedules,
        jobs,
        dispatcher,
        control,
        telemetry,
    })
}

async fn serve(config: Config) -> Result<()> {
    metrics::init_metrics();
    let services = build_services(&config)?;

    let state = AppState {
        schedules: services.schedules.clone(),
        control: services.control,
        telemetry: services.telemetry,
        dispatcher: services.dispatcher.clone(),
        start_time: std::time::Instant::now(),
    };

    let dispatcher = services.dispatcher.clone();
    let loop_handle = tokio::spawn(async move { dispatcher.run().await });

    tokio::select! {
        result = api::serve(config.server.bind_addr, state) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    services.dispatcher.stop().await;
    let _ = loop_handle.await;
    Ok(())
}

async fn tick(config: Config) -> Result<()> {
    let services = build_services(&config)?;
    let summary = services.dispatcher.tick().await?;
    println!("Tick complete");
    println!("  Examined:   {}", summary.examined);
    println!("  Dispatched: {}", summary.dispatched);
    println!("  Deferred:   {}", summary.deferred);
    println!("  Denied:     {}", summary.denied);
    println!("  Conflicts:  {}", summary.conflicts);
    println!("  Stalled:    {}", summary.stalled);
    println!("  Completed:  {}", summary.completed);
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let services = build_services(&config)?;
    let schedules = services.schedules.list_all()?;
    if schedules.is_empty() {
        println!("No schedules");
        return Ok(());
    }

    for schedule in schedules {
        let counts = services.jobs.counts(&schedule.id)?;
        let paused = if schedule.paused { " [paused]" } else { "" };
        println!(
            "{} {} ({}){}",
            schedule.id, schedule.name, schedule.status, paused
        );
        println!(
            "  scheduled {}  processing {}  sent {}  failed {}",
            counts.scheduled, counts.processing, counts.sent, counts.failed
        );
        if let Some(next) = schedule.next_run_at {
            println!("  next run at {next}");
        }
    }
    Ok(())
}
