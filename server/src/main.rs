mod command;
mod config;
mod session;
mod transport;

use clap::Parser;
use command::{Dispatcher, HandlerRegistry, StallMonitor};
use config::{Args, ServerConfig};
use transport::RouterSocket;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let config = ServerConfig::from_args(&args)?;

    let registry = HandlerRegistry::from_config(&config);
    info!(
        "Handlers: {}",
        registry.command_types().collect::<Vec<_>>().join(", ")
    );
    info!(
        "OS allow-list: {}",
        config.allowed_commands.iter().cloned().collect::<Vec<_>>().join(", ")
    );

    let socket = RouterSocket::bind(config.listen_addr, config.max_frame_size).await?;
    info!("Server listening on {}", socket.local_addr());
    info!(
        "  workers={} queue={} command_timeout={:?}",
        config.worker_pool_size,
        config
            .queue_capacity
            .map_or_else(|| "unbounded".to_string(), |capacity| capacity.to_string()),
        config.command_timeout
    );

    let dispatcher = Dispatcher::new(&config, registry);

    // Spawn stall monitor
    let monitor = StallMonitor::new(dispatcher.correlator(), config.stall_warning);
    let monitor_task = tokio::spawn(async move { monitor.run().await });

    dispatcher.run(socket, shutdown_signal()).await;

    monitor_task.abort();
    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
