use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

use beach_pier::{
    cli::{self, Cli, Commands},
    telemetry::{self, Telemetry},
    RelayConfig, RelayState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Watch { url, identity }) => {
            telemetry::init_tracing()?;
            return cli::run_watch(url, identity).await;
        }
        Some(Commands::Signal {
            url,
            identity,
            to,
            kind,
            data,
        }) => {
            telemetry::init_tracing()?;
            return cli::run_signal(url, identity, to, kind, data).await;
        }
        None => {}
    }

    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        outbound_buffer = config.outbound_buffer,
        idle_timeout_secs = config.idle_timeout.map(|d| d.as_secs()),
        ping_interval_secs = config.ping_interval.map(|d| d.as_secs()),
        "starting beach-pier relay"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let shutdown_grace = config.shutdown_grace;
    let state = RelayState::new(config).with_metrics(metrics);

    info!(
        "beach-pier listening on {}",
        listener.local_addr().context("listener has no local address")?
    );

    beach_pier::serve(listener, state.clone(), shutdown_signal(state))
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal(state: RelayState) {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
    state.begin_shutdown();
}
