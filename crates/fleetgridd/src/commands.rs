//! One-shot deployment commands. Each prints its result as JSON on stdout.

use std::sync::Arc;

use fleetgrid_rollout::{
    AssignmentStrategy, DeploymentManagement, EngineConfig, RecordingSink, TargetWithActionType,
};
use fleetgrid_state::{ActionType, StateStore};
use serde_json::json;
use tracing::info;

pub struct AssignRequest {
    pub distribution_set_id: u64,
    pub controller_ids: Vec<String>,
    pub offline: bool,
    pub action_type: ActionType,
    pub forced_time: u64,
    pub message: Option<String>,
}

/// Engine whose events are logged once the command finishes.
fn engine(store: StateStore, config: &EngineConfig) -> (DeploymentManagement, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    (DeploymentManagement::new(store, config, sink.clone()), sink)
}

fn log_events(sink: &RecordingSink) {
    for event in sink.events() {
        info!(kind = event.kind(), ?event, "event published");
    }
}

fn print(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn assign(store: StateStore, config: &EngineConfig, request: AssignRequest) -> anyhow::Result<()> {
    let (dm, sink) = engine(store, config);
    let result = if request.offline {
        dm.offline_assign(request.distribution_set_id, &request.controller_ids)?
    } else {
        let targets: Vec<TargetWithActionType> = request
            .controller_ids
            .iter()
            .map(|id| TargetWithActionType::new(id.as_str(), request.action_type, request.forced_time))
            .collect();
        dm.assign(
            request.distribution_set_id,
            &targets,
            request.message.as_deref(),
            AssignmentStrategy::Online,
        )?
    };
    log_events(&sink);
    print(&result)
}

pub fn cancel(store: StateStore, config: &EngineConfig, action_id: u64) -> anyhow::Result<()> {
    let (dm, sink) = engine(store, config);
    let action = dm.cancel_action(action_id)?;
    log_events(&sink);
    print(&action)
}

pub fn force_quit(store: StateStore, config: &EngineConfig, action_id: u64) -> anyhow::Result<()> {
    let (dm, sink) = engine(store, config);
    let action = dm.force_quit_action(action_id)?;
    log_events(&sink);
    print(&action)
}

pub fn cleanup(store: StateStore, config: &EngineConfig) -> anyhow::Result<()> {
    let (dm, _) = engine(store, config);
    let deleted = dm.run_cleanup(&config.cleanup)?;
    print(&json!({ "deleted": deleted }))
}
