use std::sync::Arc;

use tracing::{info, warn};

use onduty::config::Config;
use onduty::notify::{Notifier, NotifyHub};
use onduty::service::AvailabilityService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    onduty::observability::init(config.metrics_port)?;

    let hub = Arc::new(NotifyHub::new());
    let service = AvailabilityService::open(&config, Some(hub.clone() as Arc<dyn Notifier>))?;
    info!("onduty started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  reconcile mode: {:?}", config.reconcile.mode);
    info!("  conflict policy: {:?}", config.conflict_policy);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let professionals = service.start(&config).await;
    info!(professionals, "availability tracking active");

    // Status changes are only logged here; embedders subscribe to the hub.
    let mut changes = hub.subscribe_all();
    let log_changes = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => info!(payload = %change.to_json(), "availability changed"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("status change log lagged, skipped {n}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await?;
    info!("shutdown signal received");
    log_changes.abort();

    let stale = service
        .engine()
        .professional_ids()
        .into_iter()
        .filter(|id| service.reconciler().is_stale(id))
        .count();
    if stale > 0 {
        warn!(stale, "stopping with stale professionals; they are re-resolved on next start");
    }
    info!("onduty stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
