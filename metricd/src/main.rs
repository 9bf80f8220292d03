//! metricd: a metrics ingestion and storage service
//!
//! Receives StatsD samples over UDP, stores them in memory or in per-metric
//! logs on disk, and serves them back over an HTTP query api.

mod config;
mod listener;
mod servlet;

use anyhow::{Context, Result}; // alias std::result::Result with dynamic error type
use async_std::net::SocketAddr;
use futures::channel::oneshot;
use futures::stream::StreamExt;
use std::cell::Cell;
use tide::listener::Listener;
use tracing_subscriber::EnvFilter;

use metricd_core::debug::DEBUG;
use metricd_core::error::debug_error_enabled;
use metricd_storage::{MetricService, Scheduler};

use crate::config::Config;
use crate::listener::StatsdListener;

/// The program's main entry point.
fn main() -> Result<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}\n", err);
            Config::print_usage();
            std::process::exit(2);
        }
    };

    // Use RUST_LOG if it is set, otherwise log at info (or debug when verbose)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    debug_error_enabled(config.error_logger);

    let (send_shutdown, recv_shutdown) = oneshot::channel::<()>();

    // When we receive a SIGINT (or SIGTERM) signal, begin exiting.
    let signal_once = Cell::new(Some(send_shutdown));
    ctrlc::set_handler(move || {
        // The first time we receive the signal, shutdown gracefully
        if let Some(sender) = signal_once.take() {
            sender.send(()).ok();
        }
        // The second time we receive the signal, shutdown immediately
        else {
            std::process::exit(1);
        }
    })?;

    // Start the main event loop
    async_std::task::block_on(run(config, recv_shutdown))
}

/// Starts the worker threads and opens (recovering, for disk) the configured backend
fn make_metric_service(config: &Config) -> Result<MetricService> {
    let scheduler = Scheduler::new(config.workers, config.queue_depth)?;
    let service = MetricService::open(config.backend.clone(), scheduler)
        .context("opening the storage backend")?;
    tracing::info!(
        backend = service.backend_name(),
        series = service.list_metrics().len(),
        "Opened storage backend"
    );
    Ok(service)
}

/// The main thread's event loop
async fn run(config: Config, shutdown: oneshot::Receiver<()>) -> Result<()> {
    let service = make_metric_service(&config)?;

    // Serve the query api
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let mut http_listener = servlet::app(service.clone())
        .bind(http_addr)
        .await
        .with_context(|| format!("binding the http server to {}", http_addr))?;
    tracing::info!(addr = %http_addr, "Serving the query api");
    let http = async_std::task::spawn(async move {
        if let Err(err) = http_listener.accept().await {
            tracing::error!("http server stopped: {}", err);
        }
    });

    // Receive samples from statsd clients
    let statsd = match config.statsd_port {
        Some(port) => {
            let statsd_addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = StatsdListener::bind(statsd_addr, service.clone(), config.verbose)
                .await
                .with_context(|| format!("binding the statsd listener to {}", statsd_addr))?;
            tracing::info!(addr = %listener.local_addr()?, "Listening for statsd samples");
            Some(async_std::task::spawn(async move { listener.run().await }))
        }
        None => None,
    };

    // Every debug interval, log debug information
    let debug_interval = match config.debug_interval {
        Some(duration) => Some(async_std::task::spawn(async move {
            let mut interval = async_std::stream::interval(duration);
            while interval.next().await.is_some() {
                DEBUG.publish();
            }
        })),
        None => None,
    };

    // Shutdown when the process is killed
    shutdown.await?;
    tracing::info!("Shutting down");
    if let Some(statsd) = statsd {
        statsd.cancel().await;
    }
    http.cancel().await;
    if let Some(debug_interval) = debug_interval {
        debug_interval.cancel().await;
    }

    // Let queued inserts finish, then make them durable
    service.shutdown().await?;
    DEBUG.publish();

    Ok(())
}
