mod logging;

use std::sync::Arc;
use std::time::Duration;

use pmoconfig::{TaskSourceKind, get_config};
use pmomedia::{
    ControlPlane, LogSink, MachineInfo, MediaConfigExt, SnapshotTaskSource, StatusSink,
    SyncAgent, SystemdService, TaskSource,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== PHASE 1 : Configuration et journalisation ==========
    let config = get_config();
    logging::init_logging(&config);

    // ========== PHASE 2 : Identité de l'appareil ==========
    let device = tokio::task::spawn_blocking(pmoutils::probe_device).await?;
    info!(
        "Device: {} {} ({}, {})",
        device.model.as_deref().unwrap_or("unknown model"),
        device.hostname.as_deref().unwrap_or("-"),
        device.os,
        device.ip
    );

    let mut displays = config.get_displays();
    if displays.is_empty() {
        displays = device.displays.clone();
    } else {
        info!("Using configured displays {:?}", displays);
    }
    if displays.is_empty() {
        warn!("No display detected, promotions will be rejected");
    }

    let serial = config.get_device_serial(device.serial.as_deref())?;
    info!("Device serial {}", serial);

    let machine = MachineInfo {
        serial: serial.clone(),
        model: device.model.clone(),
        revision: device.revision.clone(),
        displays,
        ..MachineInfo::default()
    };

    // ========== PHASE 3 : Magasin de médias ==========
    let service = Arc::new(SystemdService::new(config.get_service_use_sudo()?));
    let store = Arc::new(config.open_media_store(machine, service).await?);
    info!("Media store ready in {}", store.working_dir().display());

    // ========== PHASE 4 : Boucles de synchronisation ==========
    let timeout = Duration::from_secs(config.get_download_timeout_secs()?);
    let agent = match config.get_task_source() {
        TaskSourceKind::Remote => {
            let plane = Arc::new(ControlPlane::new(&config.get_server_url(), &serial, timeout)?);
            info!("Polling tasks from {}", plane.device_url());
            let source: Arc<dyn TaskSource> = plane.clone();
            let sink: Arc<dyn StatusSink> = plane;
            SyncAgent::new(store.clone(), source, sink)
        }
        TaskSourceKind::Local => {
            info!("Replaying tasks from {}", store.snapshot_path().display());
            let source: Arc<dyn TaskSource> =
                Arc::new(SnapshotTaskSource::new(store.snapshot_path()));
            SyncAgent::new(store.clone(), source, Arc::new(LogSink)).with_fallback(None)
        }
    }
    .with_intervals(config.poll_interval()?, config.scheduler_interval()?);

    info!("PMOSignage is ready, press Ctrl+C to stop...");
    tokio::select! {
        _ = agent.run() => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Unable to listen for Ctrl+C: {}", e);
            }
            info!("Shutting down");
        }
    }

    if let Err(e) = store.persist().await {
        error!("Final snapshot failed: {}", e);
    }
    Ok(())
}
