use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use simple_tom::config::{Args, NodeConfig};
use simple_tom::network::Node;
use simple_tom::ordering::{Event, ShutdownCause};
use simple_tom::sink::LogFileSink;
use simple_tom::Error;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Missing peers make clap print usage and exit non-zero here.
    let args = Args::parse();
    match run(args).await {
        Ok(cause) => {
            info!(?cause, "exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ShutdownCause, Error> {
    let config = NodeConfig::try_from(args)?;
    info!(id = %config.id, peers = config.peers.len(), "starting node");

    let sink = LogFileSink::open(&config.log_dir, &config.id)?;
    info!(path = %sink.path().display(), "delivery log");
    let node = Node::new(config, sink).bind().await?;

    let events = node.events.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, shutting down");
        let _ = events.send(Event::Shutdown);
    });

    node.wait().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
