//! rinterrupt CLI entry point.
//!
//! Resolves the identity of remote SSH kernels and interrupts them through
//! the notebook server's `/interrupt` endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use remote_interrupt::{
    Feedback, IdentityResolver, InterruptClient, InterruptTrigger, JupyterIntrospector,
    KernelInfo, RemoteIdentity, ResolutionOutcome, SessionHandle, SessionHub, SessionStatus,
    SessionTracker, Settings, TrackerState,
};

#[derive(Parser, Debug)]
#[command(name = "rinterrupt")]
#[command(about = "Interrupt Jupyter kernels running on remote hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Notebook server base URL (overrides settings and environment)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Notebook server token (overrides settings and environment)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Settings file (default: <config dir>/remote-interrupt/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interrupt a kernel whose address is already known
    Interrupt {
        /// Kernel id (backend looks the process up)
        #[arg(long, conflicts_with_all = ["host", "pid"])]
        id: Option<String>,

        /// Remote host name
        #[arg(long, requires = "pid")]
        host: Option<String>,

        /// Remote process id
        #[arg(long, requires = "host")]
        pid: Option<u32>,

        /// Kernel display name (default: the remote marker)
        #[arg(long)]
        kernel_name: Option<String>,
    },

    /// Introspect a running kernel and print its remote identity
    Resolve {
        /// Path to the kernel's connection file
        #[arg(long)]
        connection_file: PathBuf,

        /// Kernel display name (default: the remote marker)
        #[arg(long)]
        kernel_name: Option<String>,
    },

    /// Resolve a running kernel, then interrupt it
    Run {
        /// Path to the kernel's connection file
        #[arg(long)]
        connection_file: PathBuf,

        /// Kernel display name (default: the remote marker)
        #[arg(long)]
        kernel_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = Settings::load(cli.config.as_deref());
    if let Some(base_url) = cli.base_url {
        settings.base_url = base_url;
    }
    if let Some(token) = cli.token {
        settings.token = Some(token);
    }

    match cli.command {
        Commands::Interrupt {
            id,
            host,
            pid,
            kernel_name,
        } => {
            let display_name = kernel_name.unwrap_or_else(|| settings.remote_marker.clone());
            let identity = match (id, host, pid) {
                (Some(id), _, _) => RemoteIdentity::from_kernel_id(id, display_name),
                (None, Some(host), Some(pid)) => {
                    RemoteIdentity::from_host_pid(host, pid, display_name)
                }
                _ => bail!("Pass either --id or both --host and --pid"),
            };
            interrupt(&settings, &identity).await
        }
        Commands::Resolve {
            connection_file,
            kernel_name,
        } => resolve(&settings, &connection_file, kernel_name).await,
        Commands::Run {
            connection_file,
            kernel_name,
        } => run(&settings, &connection_file, kernel_name).await,
    }
}

fn build_client(settings: &Settings) -> Result<InterruptClient> {
    let mut client = InterruptClient::new(&settings.base_url)
        .with_context(|| format!("Invalid base URL {}", settings.base_url))?
        .with_remote_marker(settings.remote_marker.clone())
        .with_timeout(settings.request_timeout());
    if let Some(token) = &settings.token {
        client = client.with_token(token.clone());
    }
    Ok(client)
}

fn build_resolver(settings: &Settings) -> Arc<IdentityResolver> {
    Arc::new(
        IdentityResolver::new(Arc::new(JupyterIntrospector::new()), settings.scheme)
            .with_introspection_timeout(settings.introspection_timeout()),
    )
}

/// A connected session for the kernel behind `connection_file`.
fn session_for(
    settings: &Settings,
    connection_file: &Path,
    kernel_name: Option<String>,
) -> Result<SessionHandle> {
    if !connection_file.exists() {
        bail!("Connection file not found: {}", connection_file.display());
    }
    // Jupyter names connection files kernel-<id>.json
    let kernel_id = connection_file
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.strip_prefix("kernel-").unwrap_or(s).to_string())
        .context("Connection file has no usable name")?;
    let display_name = kernel_name.unwrap_or_else(|| settings.remote_marker.clone());

    let session = SessionHandle::new(kernel_id.clone(), connection_file.display().to_string());
    session.set_kernel(Some(
        KernelInfo::new(kernel_id, display_name).with_connection_file(connection_file),
    ));
    session.set_status(SessionStatus::Connected);
    session.set_visible(true);
    Ok(session)
}

async fn interrupt(settings: &Settings, identity: &RemoteIdentity) -> Result<()> {
    let client = build_client(settings)?;
    let receipt = client
        .interrupt(identity)
        .await
        .with_context(|| format!("Failed to interrupt {identity}"))?;
    println!("Interrupted {} (code {})", receipt.identity, receipt.code);
    Ok(())
}

async fn resolve(
    settings: &Settings,
    connection_file: &Path,
    kernel_name: Option<String>,
) -> Result<()> {
    let session = session_for(settings, connection_file, kernel_name)?;
    let resolver = build_resolver(settings);

    match resolver.resolve(&session).await {
        ResolutionOutcome::Resolved(identity) => {
            println!("{}", serde_json::to_string_pretty(&identity)?);
            Ok(())
        }
        other => bail!("Could not resolve kernel identity ({other:?})"),
    }
}

async fn run(
    settings: &Settings,
    connection_file: &Path,
    kernel_name: Option<String>,
) -> Result<()> {
    let session = session_for(settings, connection_file, kernel_name)?;
    let tracker = SessionTracker::new(build_resolver(settings), settings.tracker_config());
    let trigger = InterruptTrigger::new(tracker.clone(), build_client(settings)?);

    let hub = Arc::new(SessionHub::new());
    hub.open(session);
    let _subscription = tracker.attach(hub.clone());
    hub.mark_restored();

    let deadline = settings.ready_timeout() + settings.introspection_timeout();
    let started = Instant::now();
    loop {
        if let ResolutionOutcome::Resolved(identity) = tracker.outcome() {
            info!("Resolved {}", identity);
            break;
        }
        if matches!(tracker.state(), TrackerState::Bound { .. }) {
            bail!("Could not resolve kernel identity");
        }
        if started.elapsed() > deadline {
            bail!("Timed out resolving kernel identity");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    match trigger.activate().await {
        Feedback::Success { message } => {
            println!("{message}");
            Ok(())
        }
        Feedback::Error { title, message } => bail!("{title}: {message}"),
        Feedback::Neutral => Ok(()),
    }
}
