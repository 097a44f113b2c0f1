//! Alert manager entry point: parse flags, load config, assemble the
//! components, then run until a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use alertmgr_core::config::{ConfigHandle, OutputConfig};
use alertmgr_core::engine::AlertEngine;
use alertmgr_core::notifier::Notifier;
use alertmgr_core::output::{spawn_output, WebhookOutput};
use alertmgr_core::pipeline::{Aggregator, Inhibitor, ProcessorPipeline};
use alertmgr_core::stats::{run_exporter, StatsRegistry};
use alertmgr_core::store::{MemStore, PgStore, Store};
use alertmgr_core::suppressor::Suppressor;
use alertmgr_core::listener;
use alertmgr_core::transform::TransformRegistry;

/// Capacity of the shared inbound channel listeners push onto.
const LISTEN_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "alertmgr", about = "Alert lifecycle manager")]
struct Args {
    /// Full path to the alert definition file.
    #[arg(long = "alert-config")]
    alert_config: PathBuf,

    /// Address the JSON-lines event listener binds to.
    #[arg(long, default_value = "127.0.0.1:8585")]
    listen_addr: String,

    /// Run against the in-memory store instead of Postgres.
    #[arg(long)]
    memory_store: bool,

    /// Log filter, e.g. `info` or `alertmgr_core=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    let config = ConfigHandle::load(&args.alert_config)
        .with_context(|| format!("loading alert config {}", args.alert_config.display()))?;
    let snapshot = config.snapshot();

    let store: Arc<dyn Store> = if args.memory_store {
        info!("using in-memory store");
        Arc::new(MemStore::new())
    } else {
        Arc::new(
            PgStore::connect(&snapshot.db)
                .await
                .context("connecting to database")?,
        )
    };

    let token = CancellationToken::new();
    let stats_registry = Arc::new(StatsRegistry::new());

    // outputs feed off per-output channels registered with the notifier
    let mut notifier = Notifier::new(config.clone(), &stats_registry);
    for (name, output_config) in &snapshot.outputs {
        let rx = notifier.register_output(name);
        let output = match output_config {
            OutputConfig::Webhook { url } => WebhookOutput::new(name.clone(), url.clone())
                .map_err(|e| anyhow::anyhow!("output {name}: {e}"))?,
        };
        spawn_output(
            Arc::new(output),
            rx,
            token.clone(),
            stats_registry.counter("output.errors"),
        );
    }
    let notifier = Arc::new(notifier);

    let suppressor = Arc::new(Suppressor::new());
    suppressor.seed(snapshot.seed_rules());
    {
        let mut tx = store.begin().await.context("loading suppression rules")?;
        suppressor.load(tx.as_mut()).await?;
        tx.commit().await?;
    }

    let mut pipeline = ProcessorPipeline::new();
    if !snapshot.inhibit_rules.is_empty() {
        pipeline.add(Arc::new(Inhibitor::new(config.clone(), &stats_registry)));
    }
    if !snapshot.agg_rules.is_empty() {
        pipeline.add(Arc::new(Aggregator::new(config.clone(), &stats_registry)));
    }

    let engine = Arc::new(AlertEngine::new(
        store.clone(),
        notifier,
        suppressor,
        TransformRegistry::new(),
        config.clone(),
        &stats_registry,
        token.clone(),
    ));

    let (listen_tx, listen_rx) = mpsc::channel(LISTEN_CHANNEL_CAPACITY);
    let tcp = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("binding listener to {}", args.listen_addr))?;
    tokio::spawn(listener::serve(tcp, listen_tx, token.clone()));

    tokio::spawn(run_exporter(
        stats_registry.clone(),
        snapshot.agent.stats_export_interval,
        token.clone(),
    ));
    drop(snapshot);

    let engine_task = tokio::spawn(engine.run(listen_rx, pipeline));

    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("alert manager shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("alert manager shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("reloading alert config");
                if let Err(e) = config.reload() {
                    error!("config reload failed, keeping previous config: {e}");
                }
            }
        }
    }

    token.cancel();
    engine_task.await.context("engine task panicked")?;
    Ok(())
}
