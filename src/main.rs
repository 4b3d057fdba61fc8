use std::sync::Arc;

use anyhow::Result;
use tracing::*;

use vehicle_flow_counter::{
    cli,
    counter::{CounterManager, Scope},
    detection::SharedDetector,
    logger,
    replay::{ReplayDetector, ReplayFrameSource},
    settings,
};

#[tokio::main]
async fn main() -> Result<()> {
    // CLI should be started before logger to allow control over verbosity
    cli::manager::init();
    // Logger should start before everything else to register any log information
    logger::manager::init();

    let mut settings = settings::manager::load(&cli::manager::settings_path())?;
    if let Some(data_dir) = cli::manager::data_dir() {
        settings.data_dir = Some(data_dir);
    }

    let frame_source = Arc::new(ReplayFrameSource::new(settings.replay_loop));
    let manager = CounterManager::start_with(
        settings,
        frame_source,
        SharedDetector::new(ReplayDetector),
        cli::manager::is_reset(),
    )
    .await?;

    let mut report = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping workers...");
                break;
            }
            _ = report.tick() => {
                let global = manager.get_global().await;
                info!(
                    "Global: {} vehicles counted, {} on screen",
                    global.accumulated_flux, global.current_density
                );
                match manager.get_window_stats(&Scope::Global).await {
                    Ok(windows) => debug!("Windows: {windows:?}"),
                    Err(error) => warn!("Failed to compute window stats: {error}"),
                }
            }
        }
    }

    manager.shutdown().await?;

    Ok(())
}
