//! Action state machine.
//!
//! ```text
//! SCHEDULED ──► RUNNING ──► FINISHED | ERROR
//!                  │
//!                  └──► CANCELING ──► CANCELED
//! ```
//!
//! `active` is true exactly while an action is RUNNING or CANCELING. Every
//! transition here is applied inside a caller-owned [`UnitOfWork`] and appends
//! an [`ActionStatus`] history entry.

use fleetgrid_state::{
    Action, ActionField, ActionId, ActionState, ActionStatus, ActionType, Predicate, TargetField,
    TargetId, TargetUpdateStatus,
};
use tracing::{debug, info, warn};

use crate::error::{DeploymentError, DeploymentResult};
use crate::events::DeploymentEvent;
use crate::tx::UnitOfWork;

/// Prefix of history messages written by the server rather than a device.
pub const SERVER_MESSAGE_PREFIX: &str = "Update Server: ";

/// `cancel` is legal for active actions that are not already being cancelled.
pub fn check_cancel(action: &Action) -> DeploymentResult<()> {
    if !action.active || action.is_canceling_or_canceled() {
        return Err(invalid(action, "cancel"));
    }
    Ok(())
}

/// `force quit` is legal only for active actions waiting in CANCELING.
pub fn check_force_quit(action: &Action) -> DeploymentResult<()> {
    if !action.active || action.status != ActionState::Canceling {
        return Err(invalid(action, "force quit"));
    }
    Ok(())
}

fn invalid(action: &Action, operation: &'static str) -> DeploymentError {
    DeploymentError::InvalidTransition {
        action_id: action.id,
        status: action.status,
        active: action.active,
        operation,
    }
}

fn server_message(text: &str) -> String {
    format!("{SERVER_MESSAGE_PREFIX}{text}")
}

/// Append one history entry for `action_id`.
pub(crate) fn append_status(
    uow: &mut UnitOfWork,
    action_id: ActionId,
    status: ActionState,
    occurred_at: u64,
    messages: Vec<String>,
) -> DeploymentResult<ActionStatus> {
    let mut entry = ActionStatus {
        id: 0,
        action_id,
        status,
        occurred_at,
        messages,
    };
    uow.insert_action_status(&mut entry)?;
    Ok(entry)
}

/// Notification asking the device to abandon `action`.
pub(crate) fn cancellation_event(action: &Action) -> DeploymentEvent {
    DeploymentEvent::CancelTargetAssignment {
        tenant: action.tenant.clone(),
        distribution_set_id: action.distribution_set_id,
        controller_id: action.controller_id.clone(),
        action_id: action.id,
    }
}

/// Move an active action to CANCELING and ask its device to confirm.
pub fn cancel(uow: &mut UnitOfWork, action: &mut Action, now: u64) -> DeploymentResult<()> {
    check_cancel(action)?;
    debug!(action = action.id, "action still active, switching to canceling");
    action.status = ActionState::Canceling;
    action.last_modified_at = now;
    uow.update_action(action)?;
    append_status(
        uow,
        action.id,
        ActionState::Canceling,
        now,
        vec![server_message("manual cancelation requested")],
    )?;
    uow.defer(cancellation_event(action));
    Ok(())
}

/// Terminate a CANCELING action without waiting for its device.
pub fn force_quit(uow: &mut UnitOfWork, action: &mut Action, now: u64) -> DeploymentResult<()> {
    check_force_quit(action)?;
    warn!(action = action.id, target = %action.controller_id, "action force quit");
    append_status(
        uow,
        action.id,
        ActionState::Canceled,
        now,
        vec![server_message("A force quit has been performed.")],
    )?;
    success_cancellation(uow, action, now)
}

/// Record a completed cancellation: the action becomes CANCELED and inactive,
/// and the target's assignment falls back to the oldest remaining active
/// action, or to its installed set when none is left.
pub fn success_cancellation(
    uow: &mut UnitOfWork,
    action: &mut Action,
    now: u64,
) -> DeploymentResult<()> {
    action.status = ActionState::Canceled;
    action.active = false;
    action.last_modified_at = now;
    uow.update_action(action)?;

    let next_active = uow
        .find_actions(
            &Predicate::eq(ActionField::TargetId, action.target_id)
                .and(Predicate::eq(ActionField::Active, true))
                .and(Predicate::ne(ActionField::Id, action.id)),
            1,
        )?
        .items
        .into_iter()
        .next();

    let mut target = uow
        .get_target(&action.tenant, &action.controller_id)?
        .ok_or_else(|| DeploymentError::not_found("target", &action.controller_id))?;
    match next_active {
        Some(next) => target.assigned_distribution_set = Some(next.distribution_set_id),
        None => {
            target.assigned_distribution_set = target.installed_distribution_set;
            target.update_status = TargetUpdateStatus::InSync;
        }
    }
    target.last_modified_at = now;
    uow.update_target(&mut target)?;
    uow.defer(DeploymentEvent::TargetUpdated {
        tenant: target.tenant.clone(),
        controller_id: target.controller_id.clone(),
        update_status: target.update_status,
        assigned_distribution_set: target.assigned_distribution_set,
    });
    Ok(())
}

/// Escalate an action to FORCED. Returns whether anything changed.
pub fn force_to_forced_type(uow: &mut UnitOfWork, action: &mut Action, now: u64) -> DeploymentResult<bool> {
    if action.is_forced() {
        return Ok(false);
    }
    action.action_type = ActionType::Forced;
    action.last_modified_at = now;
    uow.update_action(action)?;
    info!(action = action.id, "action escalated to forced");
    Ok(true)
}

/// Finish an action whose target already carries its distribution set.
pub fn close_already_assigned(
    uow: &mut UnitOfWork,
    action: &mut Action,
    now: u64,
) -> DeploymentResult<()> {
    action.status = ActionState::Finished;
    action.active = false;
    action.last_modified_at = now;
    uow.update_action(action)?;
    append_status(
        uow,
        action.id,
        ActionState::Finished,
        now,
        vec![server_message(
            "Distribution Set is already assigned. Skipping this action.",
        )],
    )?;
    debug!(action = action.id, "action closed, set already assigned");
    Ok(())
}

fn obsolete_actions(tenant: &str, target_ids: &[TargetId]) -> Predicate<ActionField> {
    Predicate::eq(ActionField::Tenant, tenant)
        .and(Predicate::is_in(ActionField::TargetId, target_ids.iter().copied()))
        .and(Predicate::eq(ActionField::Active, true))
        .and(Predicate::ne(ActionField::Status, ActionState::Canceling))
}

/// Switch every active, not yet canceling action of the targets to CANCELING,
/// queueing a cancellation request per action. Returns the affected actions.
pub fn cancel_active_actions(
    uow: &mut UnitOfWork,
    tenant: &str,
    target_ids: &[TargetId],
    now: u64,
) -> DeploymentResult<Vec<Action>> {
    let canceled = uow.update_actions_where(&obsolete_actions(tenant, target_ids), |a| {
        a.status = ActionState::Canceling;
        a.last_modified_at = now;
    })?;
    for action in &canceled {
        append_status(
            uow,
            action.id,
            ActionState::Canceling,
            now,
            vec![server_message("cancel obsolete action due to new update")],
        )?;
        uow.defer(cancellation_event(action));
    }
    if !canceled.is_empty() {
        debug!(count = canceled.len(), "obsolete actions switched to canceling");
    }
    Ok(canceled)
}

/// Close every active, not yet canceling action of the targets straight to
/// CANCELED without involving the device. Returns the affected actions.
pub fn close_active_actions(
    uow: &mut UnitOfWork,
    tenant: &str,
    target_ids: &[TargetId],
    now: u64,
) -> DeploymentResult<Vec<Action>> {
    let closed = uow.update_actions_where(&obsolete_actions(tenant, target_ids), |a| {
        a.status = ActionState::Canceled;
        a.active = false;
        a.last_modified_at = now;
    })?;
    for action in &closed {
        append_status(
            uow,
            action.id,
            ActionState::Canceled,
            now,
            vec![server_message("close obsolete action due to new update")],
        )?;
    }
    if !closed.is_empty() {
        debug!(count = closed.len(), "obsolete actions closed");
    }
    Ok(closed)
}

/// Cancel inactive SCHEDULED actions of the targets; a manual assignment
/// overrides rollout work that has not started yet.
pub fn cancel_scheduled_actions(
    uow: &mut UnitOfWork,
    tenant: &str,
    target_ids: &[TargetId],
    now: u64,
) -> DeploymentResult<Vec<Action>> {
    let canceled = uow.update_actions_where(
        &Predicate::eq(ActionField::Tenant, tenant)
            .and(Predicate::is_in(ActionField::TargetId, target_ids.iter().copied()))
            .and(Predicate::eq(ActionField::Active, false))
            .and(Predicate::eq(ActionField::Status, ActionState::Scheduled)),
        |a| {
            a.status = ActionState::Canceled;
            a.last_modified_at = now;
        },
    )?;
    if !canceled.is_empty() {
        debug!(count = canceled.len(), "scheduled actions canceled by manual assignment");
    }
    Ok(canceled)
}

/// Predicate selecting one target's actions by id, for target-scoped queries.
pub(crate) fn by_target(target_id: TargetId) -> Predicate<ActionField> {
    Predicate::eq(ActionField::TargetId, target_id)
}

/// Predicate selecting targets by numeric id.
pub(crate) fn targets_by_id(tenant: &str, ids: &[TargetId]) -> Predicate<TargetField> {
    Predicate::eq(TargetField::Tenant, tenant)
        .and(Predicate::is_in(TargetField::Id, ids.iter().copied()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use fleetgrid_state::{StateStore, Target};

    fn seed(store: &StateStore, status: ActionState, active: bool) -> Action {
        let mut target = Target::new("default", "dev-1");
        target.assigned_distribution_set = Some(7);
        target.installed_distribution_set = Some(3);
        target.update_status = TargetUpdateStatus::Pending;
        store.put_target(&mut target).unwrap();

        let mut action = Action {
            id: 0,
            tenant: "default".to_string(),
            target_id: target.id,
            controller_id: "dev-1".to_string(),
            distribution_set_id: 7,
            status,
            active,
            action_type: ActionType::Soft,
            forced_time: 0,
            rollout_id: None,
            rollout_group_id: None,
            weight: None,
            created_at: 1,
            last_modified_at: 1,
            version: 0,
        };
        let mut txn = store.begin_write().unwrap();
        txn.insert_action(&mut action).unwrap();
        txn.commit().unwrap();
        action
    }

    fn all_states() -> Vec<(ActionState, bool)> {
        let mut combos = Vec::new();
        for status in [
            ActionState::Scheduled,
            ActionState::Running,
            ActionState::Finished,
            ActionState::Error,
            ActionState::Canceling,
            ActionState::Canceled,
        ] {
            combos.push((status, true));
            combos.push((status, false));
        }
        combos
    }

    fn with_state(status: ActionState, active: bool) -> Action {
        Action {
            id: 1,
            tenant: "default".to_string(),
            target_id: 1,
            controller_id: "dev-1".to_string(),
            distribution_set_id: 7,
            status,
            active,
            action_type: ActionType::Soft,
            forced_time: 0,
            rollout_id: None,
            rollout_group_id: None,
            weight: None,
            created_at: 1,
            last_modified_at: 1,
            version: 0,
        }
    }

    #[test]
    fn cancel_precondition_holds_for_every_state() {
        for (status, active) in all_states() {
            let action = with_state(status, active);
            let allowed = active
                && !matches!(status, ActionState::Canceling | ActionState::Canceled);
            assert_eq!(check_cancel(&action).is_ok(), allowed, "{status} active={active}");
        }
    }

    #[test]
    fn force_quit_precondition_holds_for_every_state() {
        for (status, active) in all_states() {
            let action = with_state(status, active);
            let allowed = active && status == ActionState::Canceling;
            assert_eq!(check_force_quit(&action).is_ok(), allowed, "{status} active={active}");
        }
    }

    #[test]
    fn cancel_records_history_and_queues_request() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = RecordingSink::new();
        let mut action = seed(&store, ActionState::Running, true);

        let mut uow = UnitOfWork::begin(&store).unwrap();
        cancel(&mut uow, &mut action, 50).unwrap();
        uow.commit(&sink).unwrap();

        let stored = store.get_action(action.id).unwrap().unwrap();
        assert_eq!(stored.status, ActionState::Canceling);
        assert!(stored.active);
        let history = store.list_action_status(action.id).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].messages[0].starts_with(SERVER_MESSAGE_PREFIX));
        assert_eq!(sink.events()[0].kind(), "cancel_target_assignment");
    }

    #[test]
    fn force_quit_reverts_target_to_installed_set() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = RecordingSink::new();
        let mut action = seed(&store, ActionState::Canceling, true);

        let mut uow = UnitOfWork::begin(&store).unwrap();
        force_quit(&mut uow, &mut action, 60).unwrap();
        uow.commit(&sink).unwrap();

        let stored = store.get_action(action.id).unwrap().unwrap();
        assert_eq!(stored.status, ActionState::Canceled);
        assert!(!stored.active);

        let target = store.get_target("default", "dev-1").unwrap().unwrap();
        assert_eq!(target.assigned_distribution_set, Some(3));
        assert_eq!(target.update_status, TargetUpdateStatus::InSync);
        assert!(matches!(
            sink.events()[0],
            DeploymentEvent::TargetUpdated { assigned_distribution_set: Some(3), .. }
        ));
    }

    #[test]
    fn forcing_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let mut action = seed(&store, ActionState::Running, true);

        let mut uow = UnitOfWork::begin(&store).unwrap();
        assert!(force_to_forced_type(&mut uow, &mut action, 70).unwrap());
        assert!(!force_to_forced_type(&mut uow, &mut action, 71).unwrap());
        uow.commit(&RecordingSink::new()).unwrap();

        let stored = store.get_action(action.id).unwrap().unwrap();
        assert_eq!(stored.action_type, ActionType::Forced);
        assert_eq!(stored.status, ActionState::Running);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn closing_active_actions_skips_device() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = RecordingSink::new();
        let action = seed(&store, ActionState::Running, true);

        let mut uow = UnitOfWork::begin(&store).unwrap();
        let closed = close_active_actions(&mut uow, "default", &[action.target_id], 80).unwrap();
        uow.commit(&sink).unwrap();

        assert_eq!(closed.len(), 1);
        let stored = store.get_action(action.id).unwrap().unwrap();
        assert_eq!(stored.status, ActionState::Canceled);
        assert!(!stored.active);
        assert!(sink.events().is_empty());
    }
}
