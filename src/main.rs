//! deltastreamer entry point.

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use futures_util::future::join_all;
use log::{error, info};
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use deltastreamer::config::{Config, Mode, OutputFormat};
use deltastreamer::emitter::{run_emitter, ConsoleSink, EventSink, JsonSink};
use deltastreamer::poller::{Poller, ServiceCatalog, ServiceHealth};
use deltastreamer::registry::{ConsulGateway, RegistryGateway};

/// Deltas buffered between the pollers and the sink.
const EVENT_BUFFER: usize = 128;

#[derive(Parser)]
#[command(name = "deltastreamer")]
#[command(about = "A tool to monitor and stream deltas of service changes in Consul")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Monitor changes in service states within Consul.
    ///
    /// Streams only the deltas of service changes instead of the
    /// entire payload.
    Monitor(MonitorArgs),
}

/// Command-line overrides; unset flags fall through to files and env.
#[derive(Args, Serialize)]
struct MonitorArgs {
    /// Config file (defaults to deltastreamer.toml)
    #[arg(short, long)]
    #[serde(skip)]
    config: Option<String>,

    /// Consul address
    #[arg(long = "consul-addr")]
    #[serde(rename = "registry_address", skip_serializing_if = "Option::is_none")]
    consul_addr: Option<String>,

    /// Polling interval in seconds
    #[arg(long)]
    #[serde(rename = "poll_interval_secs", skip_serializing_if = "Option::is_none")]
    poll_interval: Option<u64>,

    /// Index to start from (0 starts from the registry's current state)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_index: Option<u64>,

    /// Longest time a blocking query may wait, in seconds
    #[arg(long)]
    #[serde(rename = "max_wait_secs", skip_serializing_if = "Option::is_none")]
    max_wait: Option<u64>,

    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<Mode>,

    /// Service to watch in instances mode (repeatable)
    #[arg(long = "service")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    services: Vec<String>,

    /// Consul ACL token
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    datacenter: Option<String>,

    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<OutputFormat>,

    /// Report the first observation as additions
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    report_initial: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let Command::Monitor(args) = Cli::parse().command;

    // Load configuration
    let cfg = Config::load(args.config.as_deref(), &args)?;
    cfg.validate()?;
    info!(
        "Monitoring {:?} at {} (tick {}s, max wait {}s)",
        cfg.mode, cfg.registry_address, cfg.poll_interval_secs, cfg.max_wait_secs
    );

    let gateway: Arc<dyn RegistryGateway> = Arc::new(
        ConsulGateway::new(&cfg.registry_address, cfg.max_wait())?
            .with_token(cfg.token.clone())
            .with_datacenter(cfg.datacenter.clone()),
    );

    // Event channel
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();

    let mut sink: Box<dyn EventSink> = match cfg.output {
        OutputFormat::Text => Box::new(ConsoleSink::stdout()),
        OutputFormat::Json => Box::new(JsonSink::stdout()),
    };
    let emitter_handle = tokio::spawn(async move { run_emitter(event_rx, sink.as_mut()).await });

    // One poller per monitored target, each with its own state
    let mut monitors = Vec::new();
    match cfg.mode {
        Mode::Services => {
            let poller = Poller::new(
                Arc::clone(&gateway),
                ServiceCatalog,
                cfg.poll_interval(),
                cfg.initial_index(),
            )
            .report_initial(cfg.report_initial);
            monitors.push(tokio::spawn(poller.run(event_tx.clone(), cancel.clone())));
        }
        Mode::Instances => {
            for service in &cfg.services {
                let poller = Poller::new(
                    Arc::clone(&gateway),
                    ServiceHealth::new(service.clone()),
                    cfg.poll_interval(),
                    cfg.initial_index(),
                )
                .report_initial(cfg.report_initial);
                monitors.push(tokio::spawn(poller.run(event_tx.clone(), cancel.clone())));
            }
        }
    }
    // The emitter stops once the last poller drops its sender.
    drop(event_tx);

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }
    cancel.cancel();

    for result in join_all(monitors).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Monitor stopped with error: {}", e),
            Err(e) => error!("Monitor task failed: {}", e),
        }
    }
    let emitted = emitter_handle.await?;

    info!("Shutdown complete, {} deltas emitted.", emitted);
    Ok(())
}
