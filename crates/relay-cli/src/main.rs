mod config;
mod runner;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_core::app::IngestExit;
use relay_core::impls::NatsClient;
use relay_core::ports::SystemClock;
use relay_core::store::SqliteTaskStore;
use relay_core::{Relay, RelayBuilder};
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::runner::Runner;

/// Delayed message relay: reads envelopes from a JetStream consumer and
/// forwards them now, later, or not at all.
#[derive(Debug, Parser)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Overrides RELAY_LOG_LEVEL.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    if let Err(e) = telemetry::init_tracing(&config.log_level, config.log_json) {
        eprintln!("Failed to initialize tracing: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        subject = %config.source_subject,
        consumer = %config.consumer_group,
        store = %config.store_path,
        workers = config.worker_concurrency,
        "starting delayed message relay"
    );

    let (relay, nats) = match start(&config).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let relay = Arc::new(relay);
    let stream = config.source_stream.clone();
    let subject = config.source_subject.clone();
    let durable = config.consumer_group.clone();

    Runner::new()
        .with_process("relay", {
            let relay = Arc::clone(&relay);
            move |token| async move {
                let mut source = nats
                    .source(&stream, &subject, &durable)
                    .await
                    .context("opening source consumer")?;
                match relay.run(&mut source, token).await {
                    IngestExit::EndOfStream => info!("relay stopped after end of source stream"),
                    IngestExit::Shutdown => info!("relay stopped on shutdown"),
                }
                Ok(())
            }
        })
        .with_closer(move || async move {
            let counts = relay.counts().await.context("reading queue counts")?;
            info!(
                scheduled = counts.scheduled,
                running = counts.running,
                retry_scheduled = counts.retry_scheduled,
                dead = counts.dead,
                "final queue counts"
            );
            Ok(())
        })
        .with_closer_timeout(config.shutdown_timeout())
        .run()
        .await
        .exit_code()
}

/// Connect the broker, open the store and assemble the relay.
async fn start(config: &RelayConfig) -> anyhow::Result<(Relay, NatsClient)> {
    let nats = NatsClient::connect(
        &config.nats_url,
        config.nats_connect_timeout(),
        config.nats_token.clone(),
    )
    .await
    .context("connecting to NATS")?;

    nats.ensure_stream(&config.source_stream, &config.source_subject)
        .await
        .context("ensuring source stream")?;

    let store = SqliteTaskStore::open(
        &config.store_path,
        config.store_busy_timeout(),
        Arc::new(SystemClock),
        config.store_options(),
    )
    .await
    .with_context(|| format!("opening task store at {}", config.store_path))?;

    let relay = RelayBuilder::new()
        .sink(Arc::new(nats.sink()))
        .store(Arc::new(store))
        .workers(config.worker_concurrency)
        .build()
        .context("assembling relay")?;

    Ok((relay, nats))
}
