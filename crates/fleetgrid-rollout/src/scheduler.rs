//! Rollout group batch scheduler.
//!
//! Starts the SCHEDULED actions of one rollout group level a page at a time.
//! Each page runs in its own unit of work and is not retried: a failed page is
//! abandoned and picked up again by the next trigger.

use std::collections::HashMap;

use fleetgrid_state::{
    Action, ActionField, ActionState, DistributionSetId, Predicate, RolloutGroupId, RolloutId,
    TargetId, TargetUpdateStatus,
};
use tracing::{debug, info};

use crate::action;
use crate::coordinator::DeploymentManagement;
use crate::error::{DeploymentError, DeploymentResult};
use crate::strategy::AssignmentStrategy;
use crate::tx::UnitOfWork;

impl DeploymentManagement {
    /// Start every scheduled action below `parent` (root groups when `None`),
    /// page by page, until a page comes back empty. Returns the total number
    /// of actions examined.
    pub fn start_scheduled_actions_by_group_parent(
        &self,
        rollout_id: RolloutId,
        distribution_set_id: DistributionSetId,
        parent: Option<RolloutGroupId>,
    ) -> DeploymentResult<u64> {
        let page_limit = self.scheduler.action_page_limit.max(1);
        let mut total = 0u64;
        loop {
            let started = self.start_group_batch(rollout_id, distribution_set_id, parent, page_limit)?;
            if started == 0 {
                break;
            }
            total += started;
        }
        info!(rollout = rollout_id, ?parent, total, "scheduled actions started");
        Ok(total)
    }

    /// Start one page of at most `page_limit` scheduled actions of the groups
    /// whose parent is `parent`. Returns the number of actions examined; 0
    /// means nothing is left to start.
    pub fn start_group_batch(
        &self,
        rollout_id: RolloutId,
        distribution_set_id: DistributionSetId,
        parent: Option<RolloutGroupId>,
        page_limit: usize,
    ) -> DeploymentResult<u64> {
        let ctx = self.context(crate::epoch_millis());
        let mut uow = UnitOfWork::begin(self.store())?;

        let group_ids: Vec<RolloutGroupId> = uow
            .list_rollout_groups(rollout_id)?
            .into_iter()
            .filter(|g| g.parent_id == parent)
            .map(|g| g.id)
            .collect();
        if group_ids.is_empty() {
            uow.rollback()?;
            return Ok(0);
        }

        let filter = Predicate::eq(ActionField::Tenant, ctx.tenant)
            .and(Predicate::eq(ActionField::RolloutId, rollout_id))
            .and(Predicate::is_in(ActionField::RolloutGroupId, group_ids))
            .and(Predicate::eq(ActionField::Status, ActionState::Scheduled));
        let page = uow.find_actions(&filter, page_limit)?;
        if page.is_empty() {
            uow.rollback()?;
            return Ok(0);
        }
        let examined = page.items.len() as u64;

        let target_ids: Vec<TargetId> = page.items.iter().map(|a| a.target_id).collect();
        let assigned_sets: HashMap<TargetId, Option<DistributionSetId>> = uow
            .find_targets(&action::targets_by_id(ctx.tenant, &target_ids))?
            .into_iter()
            .map(|t| (t.id, t.assigned_distribution_set))
            .collect();

        let mut pending: Vec<Action> = Vec::with_capacity(page.items.len());
        for mut scheduled in page.items {
            let Some(assigned) = assigned_sets.get(&scheduled.target_id) else {
                return Err(DeploymentError::not_found("target", &scheduled.controller_id));
            };
            if *assigned == Some(scheduled.distribution_set_id) {
                action::close_already_assigned(&mut uow, &mut scheduled, ctx.now)?;
            } else {
                pending.push(scheduled);
            }
        }

        let batch_size = self.max_ids_per_batch();
        let pending_targets: Vec<TargetId> = pending.iter().map(|a| a.target_id).collect();
        let target_batches: Vec<&[TargetId]> = pending_targets.chunks(batch_size).collect();
        let superseded = AssignmentStrategy::Online.resolve_conflicting_actions(
            &mut uow,
            &ctx,
            &target_batches,
        )?;

        for scheduled in &mut pending {
            scheduled.status = ActionState::Running;
            scheduled.active = true;
            scheduled.last_modified_at = ctx.now;
            uow.update_action(scheduled)?;
            let mut status = AssignmentStrategy::Online.new_action_status(scheduled, None, ctx.now);
            uow.insert_action_status(&mut status)?;
        }

        let mut by_target: HashMap<TargetId, DistributionSetId> = HashMap::new();
        for started in &pending {
            by_target.insert(started.target_id, started.distribution_set_id);
        }
        for batch in &target_batches {
            uow.update_targets_where(&action::targets_by_id(ctx.tenant, batch), |target| {
                target.assigned_distribution_set = by_target.get(&target.id).copied();
                target.update_status = TargetUpdateStatus::Pending;
                target.last_modified_at = ctx.now;
            })?;
        }

        let announced = AssignmentStrategy::Online.emit_assignment_events(
            &mut uow,
            &ctx,
            distribution_set_id,
            &superseded,
            &pending,
        );
        uow.commit(self.sink())?;

        debug!(
            rollout = rollout_id,
            ?parent,
            examined,
            started = pending.len(),
            announced,
            "rollout group page started"
        );
        Ok(examined)
    }
}
