//! tap-clickup CLI - incremental ClickUp extractor.

use clap::Parser;
use clickup_tap::{
    CursorStore, HttpSource, JsonLinesSink, STATE_DB_FILE, SqliteCursorStore, StreamStatus, Tap, TapConfig,
    TapError, clickup_registry,
};
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

mod cli;

use cli::{Cli, Command};

/// Route diagnostics away from stdout, which carries the record stream.
///
/// Logs go to stderr unless `--log-file` names a file to append to.
/// `RUST_LOG` overrides the level picked by `--verbose`.
fn setup_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.format_timestamp_millis().format_target(cli.verbose);

    match &cli.log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir).context("Failed to create log directory")?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(env_logger::Target::Stderr);
        }
    }

    builder.init();
    Ok(())
}

fn get_state_db(cli: &Cli) -> PathBuf {
    cli.state_db
        .clone()
        .unwrap_or_else(|| PathBuf::from(".clickup-tap").join(STATE_DB_FILE))
}

fn format_status(status: &StreamStatus) -> ColoredString {
    match status {
        StreamStatus::Completed(stats) => format!("completed ({} records)", stats.records).green(),
        StreamStatus::Aborted { kind, .. } => format!("aborted ({})", kind).red(),
        StreamStatus::Cancelled => "cancelled".yellow(),
    }
}

async fn sync(config_path: PathBuf, streams: Vec<String>, state_db: PathBuf) -> Result<i32> {
    let config = TapConfig::load(&config_path)?;
    let registry = clickup_registry()?;
    let source = Arc::new(HttpSource::new(&config.base_url, &config.api_token)?);
    let cursors = Arc::new(SqliteCursorStore::open(&state_db).context("Failed to open cursor database")?);
    let sink = Arc::new(JsonLinesSink::new(std::io::stdout()));

    let tap = Tap::new(&config, registry, source, cursors, sink);

    let stop = tap.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current page");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let report = tap.run(&streams).await?;

    for outcome in &report.outcomes {
        eprintln!("{} {}", outcome.stream.cyan(), format_status(&outcome.status));
        if let StreamStatus::Aborted { error, .. } = &outcome.status {
            eprintln!("    {}", error.dimmed());
        }
    }
    eprintln!(
        "{} {} records, {}/{} streams completed",
        "→".blue(),
        report.records(),
        report.completed().len(),
        report.outcomes.len()
    );

    Ok(report.exit_code())
}

fn run(cli: Cli) -> Result<i32> {
    let state_db = get_state_db(&cli);

    match cli.command {
        Command::Sync { config, streams } => {
            let rt = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
            return rt.block_on(sync(config, streams, state_db));
        }

        Command::Streams => {
            let registry = clickup_registry()?;
            for stream in registry.streams() {
                let mode = match &stream.replication_key {
                    Some(key) => format!("incremental on {}", key).yellow(),
                    None => "full table".dimmed(),
                };
                let children: Vec<&str> = registry
                    .children_of(&stream.name)
                    .iter()
                    .map(|child| child.name.as_str())
                    .collect();
                println!(
                    "{} parent={} children=[{}] key=[{}] {}",
                    stream.name.cyan(),
                    stream.parent.as_deref().unwrap_or("-"),
                    children.join(", "),
                    stream.primary_key.join(", "),
                    mode
                );
            }
        }

        Command::State => {
            let cursors = SqliteCursorStore::open(&state_db).context("Failed to open cursor database")?;
            let saved = cursors.list()?;
            println!("{}", serde_json::to_string_pretty(&saved).context("Failed to render state")?);
        }

        Command::Reset { stream } => {
            clickup_registry()?.require(&stream)?;
            let cursors = SqliteCursorStore::open(&state_db).context("Failed to open cursor database")?;
            if cursors.remove(&stream)? {
                println!("{} Reset cursor for {}", "✓".green(), stream.cyan());
            } else {
                println!("{} No saved cursor for {}", "✗".red(), stream);
            }
        }
    }

    Ok(0)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli).context("Failed to setup logging")?;
    info!("Command: {:?}", std::env::args().collect::<Vec<_>>());

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            let code = match TapError::find(&e) {
                Some(TapError::Configuration(_)) => 2,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}
