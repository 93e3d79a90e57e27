use anyhow::Result;
use lib_common::Orchestrator;
use std::sync::Arc;
use tokio::signal;

mod relay_logic;
use relay_logic::{config, downstream, logger, upstreams};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;

    let upstreams = upstreams::connect(&config).await?;
    let engine = Arc::new(Orchestrator::initialize(config.relay_config(), upstreams).await?);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let downstream_handle = tokio::spawn(downstream::run(
        config.port.unwrap_or(9003),
        engine.clone(),
        shutdown_tx.subscribe(),
    ));

    wait_for_signal().await?;

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    engine.shutdown().await;
    downstream_handle.await??;

    log::info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                log::info!("Ctrl-C received, initiating shutdown.");
            }
            _ = term_signal.recv() => {
                log::info!("SIGTERM received, initiating shutdown.");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        log::info!("Ctrl-C received, initiating shutdown.");
    }
    Ok(())
}
