//! hlwatch
//!
//! Reports Habana accelerator inventory and watches the accelerators for
//! critical hardware errors. Runs as a DaemonSet next to the device plugin;
//! devices that fail are flagged so they can be pulled from scheduling.

mod cli;
mod config;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use hlwatch_core::{
    create_monitor, DeviceRegistry, HardwareMonitor, HealthWatcher, MetricsRegistry,
    UnhealthyDevice,
};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Drain the unhealthy queue, flagging each device once
async fn consume_unhealthy(
    mut rx: mpsc::UnboundedReceiver<UnhealthyDevice>,
    metrics: Arc<MetricsRegistry>,
) -> HashSet<String> {
    let mut unhealthy = HashSet::new();

    while let Some(item) = rx.recv().await {
        let serial = item.device.serial().to_string();
        if unhealthy.insert(serial.clone()) {
            warn!(
                serial = %serial,
                bus_id = %item.device.device.bus_id,
                reason = %item.reason,
                detected_at = %item.detected_at,
                "Device marked unhealthy"
            );
            metrics.set_device_unhealthy(&serial, true);
        } else {
            debug!(serial = %serial, reason = %item.reason, "Device already unhealthy");
        }
    }

    unhealthy
}

/// Run the health watcher until shutdown
async fn run(
    config: Config,
    monitor: Arc<dyn HardwareMonitor>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    match monitor.device_type_name().await {
        Ok(family) => info!(family = %family, "Detected accelerator family"),
        Err(e) => warn!(error = %e, "Could not classify accelerators"),
    }

    let devices = DeviceRegistry::new(Arc::clone(&monitor))
        .list_devices()
        .await
        .context("Failed to enumerate devices")?;
    info!(count = devices.len(), "Discovered accelerators");

    if devices.is_empty() {
        warn!("No accelerators found on this node");
    }

    let metrics = Arc::new(MetricsRegistry::new());
    metrics.set_device_count(devices.len() as i64);
    for info in &devices {
        metrics.set_device_unhealthy(info.serial(), false);
    }

    // Start metrics server if enabled
    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let (unhealthy_tx, unhealthy_rx) = mpsc::unbounded_channel();
    let consumer = tokio::spawn(consume_unhealthy(unhealthy_rx, Arc::clone(&metrics)));

    let watcher = HealthWatcher::new(
        monitor,
        devices,
        config.watch.clone(),
        unhealthy_tx,
        metrics,
    );
    watcher.run(shutdown_rx).await;

    // Closes the queue so the consumer drains and exits
    drop(watcher);
    let unhealthy = consumer.await.context("Unhealthy queue consumer failed")?;

    info!(unhealthy = unhealthy.len(), "hlwatch shutdown complete");
    Ok(())
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, "Metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let request = String::from_utf8_lossy(&buf);
            let response = if request.starts_with("GET /metrics") {
                let body = prometheus::TextEncoder::new()
                    .encode_to_string(&prometheus::gather())
                    .unwrap_or_default();
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                )
            } else {
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
            };

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

/// Flip `shutdown_tx` on Ctrl+C or SIGTERM
async fn wait_for_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }

    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "hlwatch starting");

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(provider) = cli.provider {
        config.provider = provider;
    }
    if cli.verbose_hlml {
        config.verbose_hlml = true;
    }

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    info!(
        provider = %config.provider,
        verbose_hlml = config.verbose_hlml,
        "Configuration loaded"
    );

    let monitor = create_monitor(config.provider, config.verbose_hlml)
        .context("Failed to create hardware monitor")?;
    monitor
        .initialize()
        .await
        .context("Failed to initialize hardware monitor")?;
    info!(provider = %monitor.provider(), "Hardware monitor initialized");

    let result = if cli.once {
        list_once(Arc::clone(&monitor)).await
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(wait_for_signal(shutdown_tx));
        run(config, Arc::clone(&monitor), shutdown_rx).await
    };

    if let Err(e) = monitor.shutdown().await {
        warn!(error = %e, "Failed to shut down hardware monitor");
    }

    result
}

/// Print the device listing as JSON (--once mode)
async fn list_once(monitor: Arc<dyn HardwareMonitor>) -> Result<()> {
    info!("Listing devices (--once mode)");

    let devices = DeviceRegistry::new(monitor)
        .list_devices()
        .await
        .context("Failed to enumerate devices")?;

    let output = serde_json::to_string_pretty(&devices).context("Failed to encode devices")?;
    println!("{}", output);
    Ok(())
}
