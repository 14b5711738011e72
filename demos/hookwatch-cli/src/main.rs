//! Diagnostics CLI for hookwatch backends.
//!
//! Reads `HOOKWATCH_*` variables (and a `.env` file if present).
//!
//! Run with: cargo run -p hookwatch-cli -- tail

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use hookwatch_backend::{BackendConfig, BackendRegistry, validate_backend_config};
use hookwatch_core::{Event, EventFilter, SessionFilter};
use hookwatch_monitor::{Monitor, MonitorConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hookwatch", version, about = "Inspect a hookwatch backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the configuration without connecting.
    Validate,
    /// Connect and print backend metadata as JSON.
    Info,
    /// List recent sessions.
    Sessions {
        /// Only sessions started within this many minutes.
        #[arg(long)]
        minutes: Option<u32>,
        /// Include sessions that have ended.
        #[arg(long)]
        all: bool,
    },
    /// Stream live events until interrupted.
    Tail {
        /// Number of historical events to print first.
        #[arg(long, default_value_t = 20)]
        history: usize,
        /// Only print events for these sessions.
        #[arg(long = "session")]
        sessions: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to read .env");
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = BackendConfig::from_env().context("invalid HOOKWATCH_* environment")?;

    match cli.command {
        Command::Validate => validate(&config),
        Command::Info => info(config).await,
        Command::Sessions { minutes, all } => sessions(config, minutes, all).await,
        Command::Tail { history, sessions } => tail(config, history, sessions).await,
    }
}

fn validate(config: &BackendConfig) -> anyhow::Result<()> {
    let report = validate_backend_config(config);
    if report.is_valid {
        println!("configuration ok");
        return Ok(());
    }
    for error in &report.errors {
        println!("error: {error}");
    }
    bail!("configuration has {} error(s)", report.errors.len())
}

async fn info(config: BackendConfig) -> anyhow::Result<()> {
    let registry = BackendRegistry::new(config);
    let created = registry.get(false).await.context("backend unavailable")?;
    println!("{}", serde_json::to_string_pretty(&created.metadata)?);
    registry.clear().await;
    Ok(())
}

async fn sessions(config: BackendConfig, minutes: Option<u32>, all: bool) -> anyhow::Result<()> {
    let registry = BackendRegistry::new(config);
    let created = registry.get(false).await.context("backend unavailable")?;
    let filter = SessionFilter {
        time_range_minutes: minutes,
        include_ended: all,
    };
    let sessions = created.backend.get_sessions(&filter).await?;
    for session in &sessions {
        println!(
            "{:<36} {:<10} {:>5}m  {}",
            session.id,
            format!("{:?}", session.status).to_lowercase(),
            session.minutes_since_last_event,
            session.project_path
        );
    }
    println!("{} session(s)", sessions.len());
    registry.clear().await;
    Ok(())
}

fn print_event(event: &Event) {
    println!(
        "{} {:<8} {:<20} {}",
        event.timestamp.format("%H:%M:%S%.3f"),
        event.session_id.chars().take(8).collect::<String>(),
        event.event_type,
        event.tool_name.as_deref().unwrap_or("-")
    );
}

async fn tail(config: BackendConfig, history: usize, sessions: Vec<String>) -> anyhow::Result<()> {
    let registry = BackendRegistry::new(config);
    let created = registry.get(false).await.context("backend unavailable")?;

    let monitor = Monitor::start(
        created.backend.clone(),
        MonitorConfig::from_tuning(&created.tuning),
    )
    .await;

    let filter = EventFilter {
        session_ids: sessions,
        ..EventFilter::default()
    };

    let recent = match filter.session_ids.as_slice() {
        [only] => monitor.store().events_for_session(only),
        _ => monitor.store().snapshot(),
    };
    let mut backlog: Vec<Event> = recent
        .into_iter()
        .filter(|e| filter.matches(e))
        .take(history)
        .collect();
    backlog.reverse();
    backlog.iter().for_each(print_event);

    let _printer = monitor.store().subscribe(move |batch| {
        batch
            .iter()
            .filter(|e| filter.matches(e))
            .for_each(print_event);
    });
    let _status = monitor.connection().on_status_change(|status| {
        tracing::info!(
            state = %status.state,
            attempts = status.reconnect_attempts,
            error = status.error.as_deref().unwrap_or(""),
            "connection status"
        );
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    monitor.shutdown().await;
    registry.clear().await;
    Ok(())
}
