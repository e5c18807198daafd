//! Rollout lifecycle: creation, start, pause/resume, group progression.
//!
//! ```text
//! CREATING ─► READY ─► STARTING ─► RUNNING ◄─► PAUSED
//!                          │          │
//!                          ▼          ▼
//!                   ERROR_STARTING  FINISHED
//! ```
//!
//! Groups form a chain: every group but the first has the previous one as
//! parent and starts once its parent met its success condition. A group that
//! meets its error condition pauses the whole rollout.

use fleetgrid_state::{
    Action, ActionField, ActionState, ActionType, DistributionSetId, ErrorAction, ErrorCondition,
    GroupConditions, Predicate, Rollout, RolloutGroup, RolloutGroupId, RolloutGroupStatus,
    RolloutId, RolloutStatus, SuccessAction, SuccessCondition, TargetField,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coordinator::{DeploymentManagement, load_complete_set};
use crate::error::{DeploymentError, DeploymentResult};
use crate::tx::UnitOfWork;

/// Definition of one group of a new rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub name: String,
    /// Share of the targets still unassigned to earlier groups (0-100].
    pub target_percentage: f32,
    #[serde(default)]
    pub conditions: GroupConditions,
}

/// Everything needed to create a rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutCreate {
    pub name: String,
    pub target_filter: Predicate<TargetField>,
    pub distribution_set_id: DistributionSetId,
    pub action_type: ActionType,
    #[serde(default)]
    pub forced_time: u64,
    pub groups: Vec<GroupDefinition>,
}

/// What evaluating a group's conditions decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupVerdict {
    /// Neither condition met yet.
    Waiting,
    /// Success threshold reached; run the success action.
    Succeeded,
    /// Error threshold exceeded; run the error action.
    Failed,
}

/// Evaluate a group's thresholds against its action counts.
///
/// Success: `finished / total >= success_threshold%`. Error (when configured):
/// `errored / total > error_threshold%`. The error condition wins when both hold.
pub fn evaluate_group(conditions: &GroupConditions, total: u64, finished: u64, errored: u64) -> GroupVerdict {
    if let Some(ErrorCondition::Threshold) = conditions.error_condition
        && errored * 100 > u64::from(conditions.error_threshold) * total
    {
        return GroupVerdict::Failed;
    }
    evaluate_success(conditions, total, finished)
}

/// Evaluate only the success threshold. Used for groups that already failed
/// once: after a resume they may still reach success and release their children.
pub fn evaluate_success(conditions: &GroupConditions, total: u64, finished: u64) -> GroupVerdict {
    match conditions.success_condition {
        SuccessCondition::Threshold
            if finished * 100 >= u64::from(conditions.success_threshold) * total =>
        {
            GroupVerdict::Succeeded
        }
        SuccessCondition::Threshold => GroupVerdict::Waiting,
    }
}

/// Number of targets a group with `percentage` takes from `remaining`.
fn group_size(remaining: usize, percentage: f32) -> usize {
    let share = (remaining as f64 * f64::from(percentage) / 100.0).ceil() as usize;
    share.min(remaining)
}

impl DeploymentManagement {
    /// Create a rollout: split the matching targets over the groups and
    /// schedule one inactive action per target. Ends in READY.
    pub fn create_rollout(&self, create: &RolloutCreate) -> DeploymentResult<Rollout> {
        if create.groups.is_empty() {
            return Err(DeploymentError::Config(
                "a rollout needs at least one group".to_string(),
            ));
        }
        if let Some(bad) = create
            .groups
            .iter()
            .find(|g| !(g.target_percentage > 0.0 && g.target_percentage <= 100.0))
        {
            return Err(DeploymentError::Config(format!(
                "group {} has target percentage {} outside (0, 100]",
                bad.name, bad.target_percentage
            )));
        }

        let now = crate::epoch_millis();
        let tenant = self.tenant().to_string();
        let mut uow = UnitOfWork::begin(self.store())?;
        load_complete_set(&uow, &tenant, create.distribution_set_id)?;

        let mut rollout = Rollout {
            id: 0,
            tenant: tenant.clone(),
            name: create.name.clone(),
            target_filter: create.target_filter.clone(),
            distribution_set_id: create.distribution_set_id,
            action_type: create.action_type,
            forced_time: create.forced_time,
            status: RolloutStatus::Creating,
            total_targets: 0,
            rollout_groups_created: 0,
            start_at: None,
            last_check: now,
            version: 0,
        };
        uow.insert_rollout(&mut rollout)?;

        let filter = Predicate::eq(TargetField::Tenant, tenant.as_str())
            .and(create.target_filter.clone());
        let targets = uow.find_targets(&filter)?;
        let mut remaining = targets.as_slice();
        let mut parent_id: Option<RolloutGroupId> = None;

        for definition in &create.groups {
            let size = group_size(remaining.len(), definition.target_percentage);
            let (members, rest) = remaining.split_at(size);
            remaining = rest;

            let mut group = RolloutGroup {
                id: 0,
                rollout_id: rollout.id,
                name: definition.name.clone(),
                parent_id,
                status: RolloutGroupStatus::Ready,
                conditions: definition.conditions.clone(),
                target_percentage: definition.target_percentage,
                total_targets: members.len() as u64,
            };
            uow.put_rollout_group(&mut group)?;

            for target in members {
                let mut scheduled = Action {
                    id: 0,
                    tenant: tenant.clone(),
                    target_id: target.id,
                    controller_id: target.controller_id.clone(),
                    distribution_set_id: create.distribution_set_id,
                    status: ActionState::Scheduled,
                    active: false,
                    action_type: create.action_type,
                    forced_time: create.forced_time,
                    rollout_id: Some(rollout.id),
                    rollout_group_id: Some(group.id),
                    weight: None,
                    created_at: now,
                    last_modified_at: now,
                    version: 0,
                };
                uow.insert_action(&mut scheduled)?;
            }

            rollout.total_targets += group.total_targets;
            rollout.rollout_groups_created += 1;
            parent_id = Some(group.id);
        }
        if !remaining.is_empty() {
            warn!(
                rollout = rollout.id,
                ungrouped = remaining.len(),
                "targets matched the filter but fit in no group"
            );
        }

        rollout.status = RolloutStatus::Ready;
        uow.update_rollout(&mut rollout)?;
        uow.commit(self.sink())?;

        info!(
            rollout = rollout.id,
            name = %rollout.name,
            groups = rollout.rollout_groups_created,
            targets = rollout.total_targets,
            "rollout created"
        );
        Ok(rollout)
    }

    /// Start a READY rollout: begin its first group.
    pub fn start_rollout(&self, rollout_id: RolloutId) -> DeploymentResult<Rollout> {
        let rollout = self.transition(rollout_id, "start", |r| {
            if r.status != RolloutStatus::Ready {
                return false;
            }
            r.status = RolloutStatus::Starting;
            r.start_at = Some(crate::epoch_millis());
            true
        })?;
        info!(rollout = rollout_id, "starting rollout");

        let started = self.start_scheduled_actions_by_group_parent(
            rollout_id,
            rollout.distribution_set_id,
            None,
        );
        if let Err(e) = started {
            warn!(rollout = rollout_id, error = %e, "rollout failed to start");
            self.transition(rollout_id, "fail start", |r| {
                r.status = RolloutStatus::ErrorStarting;
                true
            })?;
            return Err(e);
        }

        let mut uow = UnitOfWork::begin(self.store())?;
        let mut rollout = self.load_rollout(&uow, rollout_id)?;
        for mut group in uow.list_rollout_groups(rollout_id)? {
            group.status = if group.parent_id.is_none() {
                RolloutGroupStatus::Running
            } else {
                RolloutGroupStatus::Scheduled
            };
            uow.put_rollout_group(&mut group)?;
        }
        rollout.status = RolloutStatus::Running;
        uow.update_rollout(&mut rollout)?;
        uow.commit(self.sink())?;
        info!(rollout = rollout_id, "rollout running");
        Ok(rollout)
    }

    /// Pause a running rollout; no further groups start until resumed.
    pub fn pause_rollout(&self, rollout_id: RolloutId) -> DeploymentResult<Rollout> {
        let rollout = self.transition(rollout_id, "pause", |r| {
            if r.status != RolloutStatus::Running {
                return false;
            }
            r.status = RolloutStatus::Paused;
            true
        })?;
        info!(rollout = rollout_id, "pausing rollout");
        Ok(rollout)
    }

    /// Resume a paused rollout.
    pub fn resume_rollout(&self, rollout_id: RolloutId) -> DeploymentResult<Rollout> {
        let rollout = self.transition(rollout_id, "resume", |r| {
            if r.status != RolloutStatus::Paused {
                return false;
            }
            r.status = RolloutStatus::Running;
            true
        })?;
        info!(rollout = rollout_id, "resuming rollout");
        Ok(rollout)
    }

    /// Delete a rollout that is not running: its unstarted actions are
    /// canceled and the rollout ends in DELETED.
    pub fn delete_rollout(&self, rollout_id: RolloutId) -> DeploymentResult<Rollout> {
        let now = crate::epoch_millis();
        let mut uow = UnitOfWork::begin(self.store())?;
        let mut rollout = self.load_rollout(&uow, rollout_id)?;
        if matches!(
            rollout.status,
            RolloutStatus::Starting | RolloutStatus::Running | RolloutStatus::Deleted
        ) {
            return Err(DeploymentError::InvalidRolloutTransition {
                rollout_id,
                status: rollout.status,
                operation: "delete",
            });
        }
        let canceled = uow.update_actions_where(
            &Predicate::eq(ActionField::RolloutId, rollout_id)
                .and(Predicate::eq(ActionField::Status, ActionState::Scheduled)),
            |a| {
                a.status = ActionState::Canceled;
                a.last_modified_at = now;
            },
        )?;
        rollout.status = RolloutStatus::Deleted;
        uow.update_rollout(&mut rollout)?;
        uow.commit(self.sink())?;
        info!(rollout = rollout_id, canceled = canceled.len(), "rollout deleted");
        Ok(rollout)
    }

    /// Evaluate the running groups of a RUNNING rollout once: start children
    /// of succeeded groups, pause on failed groups, finish the rollout when
    /// every group finished. Other statuses are left alone.
    ///
    /// Groups in ERROR only get their success threshold checked, so a resumed
    /// rollout continues once the failed group reaches it.
    pub fn handle_running_rollout(&self, rollout_id: RolloutId) -> DeploymentResult<Rollout> {
        let rollout = self
            .store()
            .get_rollout(rollout_id)?
            .filter(|r| r.tenant == self.tenant())
            .ok_or_else(|| DeploymentError::not_found("rollout", rollout_id))?;
        if rollout.status != RolloutStatus::Running {
            debug!(rollout = rollout_id, status = ?rollout.status, "rollout not running, skipped");
            return Ok(rollout);
        }

        let groups = self.store().list_rollout_groups(rollout_id)?;
        let evaluated = groups
            .iter()
            .filter(|g| matches!(g.status, RolloutGroupStatus::Running | RolloutGroupStatus::Error));
        for group in evaluated {
            let (finished, errored) = self.group_counts(group.id)?;
            let verdict = match group.status {
                RolloutGroupStatus::Error => evaluate_success(&group.conditions, group.total_targets, finished),
                _ => evaluate_group(&group.conditions, group.total_targets, finished, errored),
            };
            debug!(
                rollout = rollout_id,
                group = %group.name,
                finished,
                errored,
                total = group.total_targets,
                ?verdict,
                "group evaluated"
            );
            match verdict {
                GroupVerdict::Waiting => {}
                GroupVerdict::Failed => {
                    let ErrorAction::Pause = group.conditions.error_action.unwrap_or(ErrorAction::Pause);
                    warn!(rollout = rollout_id, group = %group.name, errored, "group error threshold exceeded, pausing rollout");
                    return self.finish_group(rollout_id, group.id, RolloutGroupStatus::Error, &[], Some(RolloutStatus::Paused));
                }
                GroupVerdict::Succeeded => {
                    let SuccessAction::NextGroup = group.conditions.success_action;
                    let children: Vec<RolloutGroupId> = groups
                        .iter()
                        .filter(|g| g.parent_id == Some(group.id) && g.status == RolloutGroupStatus::Scheduled)
                        .map(|g| g.id)
                        .collect();
                    if !children.is_empty() {
                        self.start_scheduled_actions_by_group_parent(
                            rollout_id,
                            rollout.distribution_set_id,
                            Some(group.id),
                        )?;
                    }
                    info!(rollout = rollout_id, group = %group.name, next = children.len(), "group finished");
                    self.finish_group(rollout_id, group.id, RolloutGroupStatus::Finished, &children, None)?;
                }
            }
        }

        let mut uow = UnitOfWork::begin(self.store())?;
        let mut rollout = self.load_rollout(&uow, rollout_id)?;
        let all_finished = uow
            .list_rollout_groups(rollout_id)?
            .iter()
            .all(|g| g.status == RolloutGroupStatus::Finished);
        rollout.last_check = crate::epoch_millis();
        if rollout.status == RolloutStatus::Running && all_finished {
            rollout.status = RolloutStatus::Finished;
            info!(rollout = rollout_id, "rollout finished");
        }
        uow.update_rollout(&mut rollout)?;
        uow.commit(self.sink())?;
        Ok(rollout)
    }

    /// Drive every RUNNING rollout of the tenant once. Failures are logged per
    /// rollout and do not stop the others. Returns how many were handled.
    pub fn handle_running_rollouts(&self) -> DeploymentResult<usize> {
        let running = self
            .store()
            .list_rollouts_by_status(self.tenant(), RolloutStatus::Running)?;
        let mut handled = 0;
        for rollout in &running {
            match self.handle_running_rollout(rollout.id) {
                Ok(_) => handled += 1,
                Err(e) => warn!(rollout = rollout.id, error = %e, "rollout check failed"),
            }
        }
        Ok(handled)
    }

    fn group_counts(&self, group_id: RolloutGroupId) -> DeploymentResult<(u64, u64)> {
        let in_group = Predicate::eq(ActionField::RolloutGroupId, group_id);
        let finished = self.store().count_actions(
            &in_group
                .clone()
                .and(Predicate::eq(ActionField::Status, ActionState::Finished)),
        )?;
        let errored = self
            .store()
            .count_actions(&in_group.and(Predicate::eq(ActionField::Status, ActionState::Error)))?;
        Ok((finished, errored))
    }

    fn finish_group(
        &self,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
        status: RolloutGroupStatus,
        children: &[RolloutGroupId],
        rollout_status: Option<RolloutStatus>,
    ) -> DeploymentResult<Rollout> {
        let mut uow = UnitOfWork::begin(self.store())?;
        let mut rollout = self.load_rollout(&uow, rollout_id)?;
        for mut group in uow.list_rollout_groups(rollout_id)? {
            if group.id == group_id {
                group.status = status;
            } else if children.contains(&group.id) {
                group.status = RolloutGroupStatus::Running;
            } else {
                continue;
            }
            uow.put_rollout_group(&mut group)?;
        }
        if let Some(next) = rollout_status {
            rollout.status = next;
            uow.update_rollout(&mut rollout)?;
        }
        uow.commit(self.sink())?;
        Ok(rollout)
    }

    fn load_rollout(&self, uow: &UnitOfWork, rollout_id: RolloutId) -> DeploymentResult<Rollout> {
        uow.get_rollout(rollout_id)?
            .filter(|r| r.tenant == self.tenant())
            .ok_or_else(|| DeploymentError::not_found("rollout", rollout_id))
    }

    /// Apply `change` to a rollout in its own retried unit of work; `change`
    /// returns false when the transition is illegal from the current status.
    fn transition(
        &self,
        rollout_id: RolloutId,
        operation: &'static str,
        change: impl Fn(&mut Rollout) -> bool,
    ) -> DeploymentResult<Rollout> {
        self.retrying(|| {
            let mut uow = UnitOfWork::begin(self.store())?;
            let mut rollout = self.load_rollout(&uow, rollout_id)?;
            let status = rollout.status;
            if !change(&mut rollout) {
                return Err(DeploymentError::InvalidRolloutTransition {
                    rollout_id,
                    status,
                    operation,
                });
            }
            uow.update_rollout(&mut rollout)?;
            uow.commit(self.sink())?;
            Ok(rollout)
        })
    }
}
