use anyhow::{Context, Result};
use lib_catalog::{MatchFanout, connect};
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod scanner_logic;
use scanner_logic::{config, logger};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    let _log_guard = logger::setup_logging(&config.log_dir, &config.log_level)?;

    tracing::info!(
        base_url = %config.scan.base_url,
        window = config.scan.window_size,
        proxies = config.scan.proxies.len(),
        webhooks = config.scan.webhook_urls.len(),
        "starting catalog scanner"
    );

    let site = config.scan.parsed_base_url()?;
    let (fanout, sink_handles) = MatchFanout::from_settings(&config.scan, site)?;
    let mut scan_loop = connect(&config.scan, fanout)
        .await
        .context("scanner start-up failed")?;

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { scan_loop.run(cancel).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        tracing::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "SIGTERM handler unavailable");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Stop the loop; in-flight probes are left to finish on their own
    cancel.cancel();
    let sweeps = loop_handle.await.context("scan loop task failed")?;

    // The loop dropped its fanout, so the sinks drain and exit
    for handle in sink_handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "sink task ended abnormally");
        }
    }

    tracing::info!(sweeps, "Shutdown complete.");
    Ok(())
}
