use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_core::app::{ControlServer, OrchestratorBuilder};
use conductor_core::config::{OrchestratorConfig, WorkerConfig};
use conductor_core::worker::WorkerClient;

#[derive(Debug, Parser)]
#[command(name = "conductor", version, about = "Priority-queued task orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the orchestrator: control server, dispatcher, watchdog.
    Serve {
        /// Control server bind address.
        #[arg(long)]
        listen: Option<String>,
        /// Redis URL for the shared queue and dispatch lease.
        #[arg(long)]
        redis_url: Option<String>,
        /// Lease owner name (must be unique per instance).
        #[arg(long)]
        instance_id: Option<String>,
    },
    /// Run a worker: connect to the orchestrator and execute tasks.
    Worker {
        /// Orchestrator address (`host:port` or `tcp://host:port`).
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        max_parallel: Option<usize>,
        #[arg(long)]
        shell: Option<String>,
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conductor_core=info,conductor_cli=info")),
        )
        .init();

    let cli = Cli::parse();
    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());

    match cli.command {
        Command::Serve {
            listen,
            redis_url,
            instance_id,
        } => {
            let mut config = OrchestratorConfig::from_env().context("orchestrator config")?;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(url) = redis_url {
                config.redis_url = Some(url);
            }
            if let Some(id) = instance_id {
                config.instance_id = id;
            }
            serve(config, shutdown).await
        }
        Command::Worker {
            url,
            max_parallel,
            shell,
            workdir,
        } => {
            let mut config = WorkerConfig::from_env().context("worker config")?;
            if let Some(url) = url {
                config.orchestrator_url = url;
            }
            if let Some(n) = max_parallel {
                anyhow::ensure!(n > 0, "--max-parallel must be positive");
                config.max_parallel = n;
            }
            if let Some(shell) = shell {
                config.shell = shell;
            }
            if workdir.is_some() {
                config.workdir = workdir;
            }
            info!(url = %config.orchestrator_url, max_parallel = config.max_parallel, "starting worker");
            WorkerClient::new(config).run(shutdown).await?;
            Ok(())
        }
    }
}

async fn serve(config: OrchestratorConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listen = config.listen_addr.clone();
    let orchestrator = Arc::new(
        OrchestratorBuilder::new(config)
            .redis_backends()
            .await
            .context("connect to redis")?
            .build()?,
    );

    let report = orchestrator.start().await?;
    info!(removed = report.removed, requeued = report.requeued, "startup reconciliation done");

    let watchdog = orchestrator.spawn_watchdog(shutdown.clone());

    let mut events = orchestrator.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server = ControlServer::bind(&listen, Arc::clone(&orchestrator))
        .await
        .with_context(|| format!("bind {listen}"))?;
    server.run(shutdown).await?;

    if let Err(e) = watchdog.await {
        warn!(error = %e, "watchdog task failed");
    }
    event_log.abort();
    info!("orchestrator stopped");
    Ok(())
}

fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });
}
