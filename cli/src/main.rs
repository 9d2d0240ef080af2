//! Relay CLI - open files against configured language servers and print
//! their diagnostics.
//!
//! # Event Loop
//!
//! The LSP manager is single-threaded and tick-driven. The CLI drives it on a
//! fixed 8ms cadence:
//!
//! 1. Wait for frame tick
//! 2. `manager.tick(now)`: every session reads, dispatches and writes
//! 3. Stop once diagnostics settle, the timeout passes, or every server is gone
//!
//! ```text
//! main() -> open_files() -> wait_for_diagnostics() -> report() -> shutdown()
//! ```

mod config;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{
    env, fs, io,
    path::PathBuf,
    process::ExitCode,
    time::{Duration, Instant},
};
use tokio::{
    signal,
    time::{MissedTickBehavior, interval},
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use relay_lsp::LspManager;

use crate::config::{RelayConfig, config_path};

const FRAME_DURATION: Duration = Duration::from_millis(8);

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Report language server diagnostics for files")]
#[command(version)]
struct Cli {
    /// Files to open
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Config file (default: ~/.relay/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workspace root used when no root marker is found
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Give up waiting for diagnostics after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Quiet period, in milliseconds, after which diagnostics count as settled
    #[arg(long, default_value_t = 3000)]
    settle: u64,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries the report; logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

/// Open every file with its server. Returns the paths a server accepted.
fn open_files(manager: &mut LspManager, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut opened = Vec::new();
    for file in files {
        let path = fs::canonicalize(file)
            .with_context(|| format!("cannot resolve {}", file.display()))?;
        let text = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        match manager.open_document(&path, None, &text) {
            Some(server) => {
                tracing::debug!(server = %server, path = %path.display(), "Opened document");
                opened.push(path);
            }
            None => tracing::warn!("No language server handles {}", path.display()),
        }
    }
    Ok(opened)
}

async fn wait_for_diagnostics(manager: &mut LspManager, settle: Duration, timeout: Duration) {
    let mut frames = interval(FRAME_DURATION);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();
    let mut last_event: Option<Instant> = None;

    loop {
        frames.tick().await;
        let now = Instant::now();
        if manager.tick(now) > 0 {
            last_event = Some(now);
        }

        if !manager.has_running_servers() {
            tracing::warn!("All language servers stopped");
            break;
        }
        if last_event.is_some_and(|at| now.duration_since(at) >= settle) {
            break;
        }
        if now.duration_since(started) >= timeout {
            tracing::warn!("Timed out waiting for diagnostics");
            break;
        }
    }
}

/// Print diagnostics for `files`. Returns whether any of them has errors.
fn report(manager: &LspManager, files: &[PathBuf]) -> bool {
    let mut has_errors = false;
    for path in files {
        for diag in manager.diagnostics_for(path) {
            has_errors |= diag.severity().is_error();
            println!("{}", diag.display_with_path(path));
        }
    }

    let status = manager.snapshot().status_string();
    if status.is_empty() {
        eprintln!("No diagnostics");
    } else {
        eprintln!("{status}");
    }
    has_errors
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let config = RelayConfig::load(cli.config.as_deref())?.unwrap_or_default();
    if !config.lsp.enabled {
        let location = cli
            .config
            .clone()
            .or_else(config_path)
            .map_or_else(|| "the config file".to_string(), |p| p.display().to_string());
        bail!("LSP is disabled; set `enabled = true` under [lsp] in {location}");
    }

    let workspace = match cli.workspace.or(config.workspace) {
        Some(dir) => dir,
        None => env::current_dir().context("cannot determine current directory")?,
    };
    let mut manager = LspManager::new(config.lsp, &workspace)?;

    let files = open_files(&mut manager, &cli.files)?;
    if files.is_empty() {
        bail!("No configured language server handles the given files");
    }

    tokio::select! {
        () = wait_for_diagnostics(
            &mut manager,
            Duration::from_millis(cli.settle),
            Duration::from_secs(cli.timeout),
        ) => {}
        _ = signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    let has_errors = report(&manager, &files);
    manager.shutdown();

    Ok(if has_errors {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
