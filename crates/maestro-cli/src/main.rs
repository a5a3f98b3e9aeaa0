//! # maestro-cli
//!
//! Binary entry point for the Maestro session server.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - The stdio serve loop feeding the protocol server
//! - Offline session replay via `maestro --replay`

use anyhow::{Context, Result};
use clap::Parser;
use maestro_adapters::CommandRunner;
use maestro_core::{replay_session, session_dir, MaestroConfig, RunnerFactory, Server};
use maestro_proto::LineCodec;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::info;

/// CodeMaestro - deterministic editor-integration session server
#[derive(Parser, Debug)]
#[command(name = "maestro", version, about)]
struct Cli {
    /// Replay a recorded session to stdout instead of serving
    #[arg(long, value_name = "SESSION_ID")]
    replay: Option<String>,

    /// Workspace root (defaults to the current directory)
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, default_value = "maestro.yml")]
    config: PathBuf,

    /// Retry with a corrective edit after a failed verification
    #[arg(long)]
    gated: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol; all logging goes to stderr.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = MaestroConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load config from {:?}", cli.config))?;
    if cli.gated {
        config.gated = true;
    }

    let workspace = match cli.workspace {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    match cli.replay {
        Some(session_id) => replay_command(&workspace, &session_id),
        None => serve(workspace, config).await,
    }
}

/// Re-emits a recorded session's outbound stream and writes its report.
fn replay_command(workspace: &Path, session_id: &str) -> Result<()> {
    let dir = session_dir(workspace, session_id);
    let mut stdout = std::io::stdout();
    let summary = replay_session(&dir, &mut stdout).with_context(|| {
        format!(
            "failed to replay session {session_id} from {}",
            dir.display()
        )
    })?;
    info!(
        emitted = summary.emitted,
        events = summary.sequence.len(),
        "replay complete"
    );
    Ok(())
}

/// Serves the protocol over stdio until stdin closes.
async fn serve(workspace: PathBuf, config: MaestroConfig) -> Result<()> {
    let timeout = Duration::from_secs(config.command_timeout_secs);
    let truncate_bytes = config.truncate_bytes;
    let factory: RunnerFactory = Box::new(move |root| {
        Box::new(
            CommandRunner::new(root)
                .with_timeout(timeout)
                .with_truncate_bytes(truncate_bytes),
        )
    });

    let max_line_bytes = config.max_line_bytes;
    let mut server = Server::new(std::io::stdout(), config, factory, env!("CARGO_PKG_VERSION"))
        .with_workspace(workspace);

    info!("serving on stdio");
    let mut codec = LineCodec::new(max_line_bytes);
    let mut stdin = tokio::io::stdin();
    let mut chunk = [0u8; 8192];
    let mut pending = Vec::new();
    loop {
        let n = stdin.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        codec.feed(&chunk[..n], |value| pending.push(value));
        // Strictly sequential: each message is fully handled before the next.
        for value in pending.drain(..) {
            server.handle_line(value).await?;
        }
    }
    info!("stdin closed, shutting down");
    Ok(())
}
