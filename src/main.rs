use anyhow::Context;
use clap::{Parser, Subcommand};
use domekit::audit::{AuditEvent, AuditLog, QueryFilter};
use domekit::manifest::Manifest;
use domekit::runtime::Runtime;
use domekit::transport::{serve_http, serve_stdio};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "domekit",
    version,
    about = "Local-first AI runtime gateway with manifest-driven tool policy and audit"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a manifest and exit
    Validate {
        /// Manifest path (or $DOMEKIT_MANIFEST)
        #[arg(env = "DOMEKIT_MANIFEST")]
        manifest: PathBuf,
    },
    /// Run the gateway
    Run {
        /// Manifest path (or $DOMEKIT_MANIFEST)
        #[arg(env = "DOMEKIT_MANIFEST")]
        manifest: PathBuf,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Serve the JSON-RPC tool surface on stdio instead of HTTP
        #[arg(long)]
        stdio: bool,
    },
    /// Inspect an audit log
    Logs {
        path: PathBuf,
        #[arg(short = 'r', long)]
        request_id: Option<Uuid>,
        #[arg(short = 'e', long)]
        event: Option<String>,
        #[arg(short = 'n', long, default_value_t = 100)]
        limit: usize,
        /// Print raw JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Validate { manifest } => validate(&manifest),
        Command::Run {
            manifest,
            host,
            port,
            stdio,
        } => run(&manifest, &host, port, stdio).await,
        Command::Logs {
            path,
            request_id,
            event,
            limit,
            json,
        } => logs(&path, request_id, event.as_deref(), limit, json).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let manifest = Manifest::load(path)?;
    println!(
        "manifest OK: app '{}' v{}, policy_mode {}, {} allowed tool(s)",
        manifest.app.name,
        manifest.app.version,
        manifest.runtime.policy_mode.as_str(),
        manifest.policy.tools.allow.len()
    );
    Ok(())
}

async fn run(path: &Path, host: &str, port: u16, stdio: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(path)?;
    let runtime = Runtime::from_manifest(manifest).await?;
    spawn_reload_on_sighup(runtime.clone(), path.to_path_buf());

    if stdio {
        serve_stdio(runtime).await?;
    } else {
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;
        serve_http(runtime, addr).await?;
    }
    Ok(())
}

/// SIGHUP swaps in a freshly loaded manifest; a load failure keeps the
/// current snapshot.
#[cfg(unix)]
fn spawn_reload_on_sighup(runtime: Arc<Runtime>, path: PathBuf) {
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "cannot install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!(path = %path.display(), "SIGHUP: reloading manifest");
            match Manifest::load(&path) {
                Ok(manifest) => {
                    if let Err(e) = runtime.reload_manifest(manifest).await {
                        error!(error = %e, "manifest reload rejected");
                    }
                }
                Err(e) => error!(error = %e, "manifest reload failed"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_sighup(_runtime: Arc<Runtime>, _path: PathBuf) {}

async fn logs(
    path: &Path,
    request_id: Option<Uuid>,
    event: Option<&str>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    anyhow::ensure!(path.exists(), "audit log {} does not exist", path.display());

    let event = match event {
        Some(raw) => Some(
            AuditEvent::parse(raw)
                .ok_or_else(|| anyhow::anyhow!("unknown event kind '{}'", raw))?,
        ),
        None => None,
    };

    let log = AuditLog::open(path).await?;
    let filter = QueryFilter {
        event,
        request_id,
        limit: Some(limit),
        ..QueryFilter::default()
    };
    let (entries, total) = log.query(&filter).await?;

    if json {
        for entry in &entries {
            println!("{}", serde_json::to_string(entry)?);
        }
    } else {
        for entry in &entries {
            let tool = entry
                .detail
                .get("tool")
                .and_then(|v| v.as_str())
                .unwrap_or("-");
            println!(
                "{}  {:<14}  {}  {}",
                entry.ts.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
                entry.event.as_str(),
                entry.request_id,
                tool
            );
        }
        println!("{} of {} matching entries", entries.len(), total);
    }
    Ok(())
}
