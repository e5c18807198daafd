//! Long-running mode: periodically drives running rollouts and drains
//! expired actions until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_rollout::{BroadcastSink, DeploymentEvent, DeploymentManagement, EngineConfig};
use fleetgrid_state::StateStore;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub async fn run(store: StateStore, config: EngineConfig) -> anyhow::Result<()> {
    info!(tenant = %config.tenant.name, "fleetgrid daemon starting");

    let sink = Arc::new(BroadcastSink::new(EVENT_CHANNEL_CAPACITY));
    let events = sink.subscribe();
    let dm = DeploymentManagement::new(store, &config, sink);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let logger_handle = tokio::spawn(log_events(events, shutdown_rx.clone()));

    let interval = Duration::from_secs(config.scheduler.poll_interval_secs.max(1));
    info!(interval_secs = interval.as_secs(), cleanup = config.cleanup.enabled, "rollout driver starting");
    let driver_handle = tokio::spawn(drive(dm, config, interval, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = driver_handle.await;
    let _ = logger_handle.await;

    info!("fleetgrid daemon stopped");
    Ok(())
}

/// One tick per interval; the engine is synchronous so every tick runs on
/// the blocking pool.
async fn drive(
    dm: DeploymentManagement,
    config: EngineConfig,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let dm = dm.clone();
                let config = config.clone();
                match tokio::task::spawn_blocking(move || tick(&dm, &config)).await {
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "rollout driver tick panicked"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("rollout driver stopped");
}

fn tick(dm: &DeploymentManagement, config: &EngineConfig) {
    match dm.handle_running_rollouts() {
        Ok(0) => {}
        Ok(handled) => debug!(handled, "running rollouts checked"),
        Err(e) => warn!(error = %e, "rollout check failed"),
    }
    if config.cleanup.enabled
        && let Err(e) = dm.run_cleanup(&config.cleanup)
    {
        warn!(error = %e, "action cleanup failed");
    }
}

async fn log_events(mut events: broadcast::Receiver<DeploymentEvent>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    info!(kind = event.kind(), %payload, "deployment event");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_rollout::{AssignmentStrategy, TargetWithActionType};
    use fleetgrid_state::{
        ActionType, DistributionSet, DistributionSetType, SoftwareModule, Target,
    };

    #[tokio::test]
    async fn driver_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let dm = DeploymentManagement::new(
            store,
            &EngineConfig::default(),
            Arc::new(BroadcastSink::new(8)),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(drive(dm, EngineConfig::default(), Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn event_logger_drains_until_channel_closes() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_distribution_set(&DistributionSet {
                id: 1,
                tenant: "default".to_string(),
                name: "base".to_string(),
                version: "1".to_string(),
                set_type: DistributionSetType {
                    key: "os".to_string(),
                    mandatory_module_types: vec!["os".to_string()],
                    optional_module_types: vec![],
                },
                modules: vec![SoftwareModule {
                    id: 1,
                    module_type: "os".to_string(),
                    name: "linux".to_string(),
                    version: "6.1".to_string(),
                }],
            })
            .unwrap();
        store.put_target(&mut Target::new("default", "dev")).unwrap();

        let sink = Arc::new(BroadcastSink::new(8));
        let events = sink.subscribe();
        let (_tx, rx) = watch::channel(false);
        let logger = tokio::spawn(log_events(events, rx));

        let dm = DeploymentManagement::new(store, &EngineConfig::default(), sink);
        dm.assign(
            1,
            &[TargetWithActionType::new("dev", ActionType::Soft, 0)],
            None,
            AssignmentStrategy::Online,
        )
        .unwrap();
        drop(dm);

        tokio::time::timeout(Duration::from_secs(5), logger)
            .await
            .unwrap()
            .unwrap();
    }
}
