#![cfg(feature = "daemon")]

mod config;
mod device;
mod error;
mod protocol;
mod server;
mod utils;

use async_std::channel::{self, Sender};
use clap::Parser;
use config::{Config, DEFAULT_CONFIG_PATH};
use device::DeviceRegistry;
use futures::StreamExt;
use protocol::register::IoLayout;
use server::acceptor::Acceptor;
use server::commands::init_commands;
use server::router::Context;
use server::workers::{Service, WorkerPool};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_async_std::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use utils::journal::Journal;
use utils::tracing::setup_tracing;

/// Command and control server for instrument mechanisms
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// TCP listen address, overrides the configuration
    #[arg(short, long)]
    listen: Option<String>,

    /// Message bus endpoint, overrides the configuration; an empty value disables the bus
    #[arg(short, long)]
    bus: Option<String>,

    /// Number of worker tasks
    #[arg(short, long)]
    workers: Option<usize>,

    /// Log file
    #[arg(long)]
    log: Option<PathBuf>,
}

/// Forward SIGINT and SIGTERM to the shutdown channel
async fn forward_signals(mut signals: Signals, shutdown: Sender<()>) {
    if let Some(signal) = signals.next().await {
        info!("Received signal {}, shutting down", signal);
        let _ = shutdown.try_send(());
    }
}

#[async_std::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (mut config, missing) = if args.config.exists() {
        (Config::load(&args.config)?, false)
    } else {
        (Config::default(), true)
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(bus) = args.bus {
        config.server.bus_endpoint = bus;
    }
    if let Some(workers) = args.workers {
        config.server.workers = workers.max(1);
    }
    let log_path = args
        .log
        .unwrap_or_else(|| PathBuf::from(&config.server.log_path));

    setup_tracing(&log_path);
    if missing {
        warn!(
            "Configuration {} not found, running with defaults and no devices",
            args.config.display()
        );
    }

    let registry = Arc::new(DeviceRegistry::from_configs(&config.devices));
    if registry.is_empty() {
        warn!("No devices configured");
    } else {
        info!("{} devices configured", registry.len());
    }

    let (shutdown_tx, shutdown_rx) = channel::bounded(1);
    let signals = Signals::new([SIGINT, SIGTERM])?;
    let signal_handle = signals.handle();
    let signal_task = async_std::task::spawn(forward_signals(signals, shutdown_tx.clone()));

    let router = Arc::new(init_commands(Journal::new(&config.server.journal_path)));
    let ctx = Arc::new(Context::new(
        registry.clone(),
        IoLayout::from_config(&config),
        shutdown_tx,
    ));

    let bus_name = match &config.server.bus_name {
        Some(name) => name.clone(),
        None => hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "mechd".to_string()),
    };

    let (reply_tx, reply_rx) = channel::unbounded();
    let service = Arc::new(Service::new(
        router,
        ctx,
        bus_name,
        Duration::from_millis(config.server.client_timeout_ms),
        reply_tx,
    ));
    let pool = WorkerPool::start(config.server.workers, config.server.queue_depth, service);

    let acceptor = Acceptor::bind(
        &config.server.listen,
        &config.server.bus_endpoint,
        pool,
        reply_rx,
        shutdown_rx,
    )
    .await?;
    acceptor.run().await?;

    signal_handle.close();
    signal_task.await;
    registry.close_all().await;
    info!("mechd stopped");
    Ok(())
}
