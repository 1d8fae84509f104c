use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use clipboard_relay::broker::Broker;
use clipboard_relay::config::{BrokerConfig, WorkerConfig};
use clipboard_relay::ollama::OllamaGenerator;
use clipboard_relay::server;
use clipboard_relay::worker_agent::{AgentError, WorkerAgent};
use clipboard_relay::worker_http::{self, WorkerSurface};

#[derive(Debug, Parser)]
#[command(name = "clipboard-relay")]
#[command(about = "Clipboard code-generation broker and worker agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Accept client and worker connections and relay requests between them.
    Broker(BrokerConfig),
    /// Connect to a broker and serve its requests from a local Ollama.
    Worker(WorkerConfig),
}

fn init_tracing(default_level: &str) {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Broker(config) => {
            init_tracing(&config.log_level);
            run_broker(config).await
        }
        Commands::Worker(config) => {
            init_tracing(&config.log_level);
            run_worker(config).await
        }
    }
}

async fn run_broker(config: BrokerConfig) -> Result<()> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind broker on {addr}"))?;
    tracing::info!(
        target = "clipboard_relay::main",
        %addr,
        selection = ?config.selection,
        default_model = %config.default_model,
        "starting broker"
    );

    let broker = Broker::new(config);
    server::run(broker, listener, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(target = "clipboard_relay::main", "shutdown requested");
    })
    .await
    .context("broker server failed")
}

async fn run_worker(config: WorkerConfig) -> Result<()> {
    let generator = Arc::new(
        OllamaGenerator::from_config(&config).context("failed to build ollama client")?,
    );
    let http_addr = config.http_addr();
    let agent = Arc::new(WorkerAgent::new(config, generator.clone()));
    tracing::info!(
        target = "clipboard_relay::main",
        worker_id = %agent.worker_id(),
        "starting worker agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind worker api on {http_addr}"))?;
    let mut http_shutdown = shutdown_rx.clone();
    let http = tokio::spawn(worker_http::run(
        WorkerSurface::new(agent.clone(), generator),
        listener,
        async move {
            let _ = http_shutdown.wait_for(|stop| *stop).await;
        },
    ));

    let outcome = agent.run(shutdown_rx).await;
    http.abort();
    match outcome {
        Ok(()) => Ok(()),
        Err(err @ AgentError::ReconnectExhausted { .. }) => {
            tracing::error!(target = "clipboard_relay::main", error = %err, code = err.code(), "worker agent failed permanently");
            Err(err).context("worker agent stopped")
        }
        Err(err) => Err(err).context("worker agent could not start"),
    }
}
