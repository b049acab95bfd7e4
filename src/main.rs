use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use bunkbook::clock::SystemClock;
use bunkbook::compactor;
use bunkbook::config::Config;
use bunkbook::engine::Engine;
use bunkbook::notify::NotifyHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = Config::from_env();
    bunkbook::observability::init(cfg.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&cfg.data_dir)?;

    let engine = Arc::new(Engine::new(
        cfg.wal_path(),
        Arc::new(NotifyHub::new()),
        cfg.policy.clone(),
        Arc::new(SystemClock),
    )?);
    info!("bunkbook engine ready");
    info!("  wal: {}", cfg.wal_path().display());
    info!(
        "  rooms: {}, guests: {}, reservations: {}",
        engine.room_count(),
        engine.guest_count(),
        engine.reservation_count()
    );
    info!(
        "  extra guest fee: {}, horizon: {} months, freeze after check-in: {}",
        cfg.policy.default_extra_guest_fee,
        cfg.policy.booking_horizon_months,
        cfg.policy.freeze_after_check_in
    );
    info!("  metrics: {}", cfg.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let compactor = tokio::spawn(compactor::run_compactor(engine.clone(), cfg.compact_threshold));

    // Run until SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");

    compactor.abort();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("bunkbook stopped");
    Ok(())
}
