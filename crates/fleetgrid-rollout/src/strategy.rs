//! Assignment strategies: online (device-acknowledged) and offline
//! (already applied elsewhere).
//!
//! Both variants answer the same questions with opposite semantics: which
//! targets qualify, what happens to in-flight work, what status targets and
//! new actions get, and whether devices are notified.

use std::collections::{BTreeSet, HashSet};

use fleetgrid_state::{
    Action, ActionId, ActionState, ActionStatus, ActionType, DistributionSetId, Predicate, Target,
    TargetField, TargetId, TargetUpdateStatus,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::{self, SERVER_MESSAGE_PREFIX};
use crate::error::DeploymentResult;
use crate::events::{ActionAssignment, DeploymentEvent};
use crate::tx::UnitOfWork;

/// Offline history entries carry this note.
pub const OFFLINE_ANNOTATION: &str = "Action reported as offline deployment";

/// How an assignment is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Devices are notified and report progress.
    Online,
    /// The update already happened outside the server; only record it.
    Offline,
}

/// A requested target together with how insistently it should update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetWithActionType {
    pub controller_id: String,
    pub action_type: ActionType,
    /// Unix timestamp (milliseconds); only meaningful for `TimeForced`.
    pub forced_time: u64,
}

impl TargetWithActionType {
    pub fn new(controller_id: impl Into<String>, action_type: ActionType, forced_time: u64) -> Self {
        Self {
            controller_id: controller_id.into(),
            action_type,
            forced_time,
        }
    }

    pub fn forced(controller_id: impl Into<String>) -> Self {
        Self::new(controller_id, ActionType::Forced, 0)
    }
}

/// Tenant settings and clock shared by every step of one assignment.
#[derive(Debug, Clone, Copy)]
pub struct AssignmentContext<'a> {
    pub tenant: &'a str,
    pub multi_assignment: bool,
    pub auto_close: bool,
    pub actor: Option<&'a str>,
    pub now: u64,
}

/// Work displaced by an assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Superseded {
    /// Actions switched to CANCELING.
    pub action_ids: BTreeSet<ActionId>,
    /// Targets that now wait for a device to confirm a cancellation.
    pub target_ids: BTreeSet<TargetId>,
}

impl Superseded {
    pub fn is_empty(&self) -> bool {
        self.action_ids.is_empty()
    }

    fn record(&mut self, canceled: &[Action]) {
        for action in canceled {
            self.action_ids.insert(action.id);
            self.target_ids.insert(action.target_id);
        }
    }
}

impl AssignmentStrategy {
    /// Targets among the candidates that should receive a new action, in
    /// batch order without duplicates.
    pub fn find_eligible_targets(
        &self,
        uow: &UnitOfWork,
        ctx: &AssignmentContext<'_>,
        controller_id_batches: &[&[String]],
        distribution_set_id: DistributionSetId,
    ) -> DeploymentResult<Vec<Target>> {
        let mut seen = HashSet::new();
        let mut eligible = Vec::new();
        for batch in controller_id_batches {
            let mut filter = Predicate::eq(TargetField::Tenant, ctx.tenant)
                .and(Predicate::is_in(TargetField::ControllerId, batch.iter().map(String::as_str)));
            filter = match self {
                AssignmentStrategy::Online if ctx.multi_assignment => filter,
                AssignmentStrategy::Online => filter.and(Predicate::ne(
                    TargetField::AssignedDistributionSet,
                    distribution_set_id,
                )),
                AssignmentStrategy::Offline => filter
                    .and(Predicate::ne(
                        TargetField::AssignedDistributionSet,
                        distribution_set_id,
                    ))
                    .and(Predicate::ne(
                        TargetField::UpdateStatus,
                        TargetUpdateStatus::Pending,
                    )),
            };
            for target in uow.find_targets(&filter)? {
                if seen.insert(target.id) {
                    eligible.push(target);
                }
            }
        }
        debug!(strategy = ?self, eligible = eligible.len(), "eligible targets resolved");
        Ok(eligible)
    }

    /// Deal with active actions of the targets: cancel them, or close them
    /// outright when auto-close is enabled. Offline assignments leave them
    /// alone, and so does multi-assignment mode where actions run side by side.
    pub fn resolve_conflicting_actions(
        &self,
        uow: &mut UnitOfWork,
        ctx: &AssignmentContext<'_>,
        target_id_batches: &[&[TargetId]],
    ) -> DeploymentResult<Superseded> {
        let mut superseded = Superseded::default();
        if *self == AssignmentStrategy::Offline || ctx.multi_assignment {
            return Ok(superseded);
        }
        for batch in target_id_batches {
            if ctx.auto_close {
                action::close_active_actions(uow, ctx.tenant, batch, ctx.now)?;
            } else {
                let canceled = action::cancel_active_actions(uow, ctx.tenant, batch, ctx.now)?;
                superseded.record(&canceled);
            }
        }
        Ok(superseded)
    }

    /// Record the assignment on the targets themselves.
    pub fn apply_target_status(
        &self,
        uow: &mut UnitOfWork,
        ctx: &AssignmentContext<'_>,
        distribution_set_id: DistributionSetId,
        target_id_batches: &[&[TargetId]],
    ) -> DeploymentResult<()> {
        for batch in target_id_batches {
            uow.update_targets_where(&action::targets_by_id(ctx.tenant, batch), |target| {
                target.assigned_distribution_set = Some(distribution_set_id);
                match self {
                    AssignmentStrategy::Online => {
                        target.update_status = TargetUpdateStatus::Pending;
                    }
                    AssignmentStrategy::Offline => {
                        target.installed_distribution_set = Some(distribution_set_id);
                        target.update_status = TargetUpdateStatus::InSync;
                    }
                }
                target.last_modified_at = ctx.now;
                target.last_modified_by = ctx.actor.map(str::to_string);
            })?;
        }
        Ok(())
    }

    /// A new, not yet persisted action for `target`.
    pub fn new_action(
        &self,
        ctx: &AssignmentContext<'_>,
        target: &Target,
        distribution_set_id: DistributionSetId,
        requested: &TargetWithActionType,
    ) -> Action {
        let (status, active) = match self {
            AssignmentStrategy::Online => (ActionState::Running, true),
            AssignmentStrategy::Offline => (ActionState::Finished, false),
        };
        Action {
            id: 0,
            tenant: ctx.tenant.to_string(),
            target_id: target.id,
            controller_id: target.controller_id.clone(),
            distribution_set_id,
            status,
            active,
            action_type: requested.action_type,
            forced_time: requested.forced_time,
            rollout_id: None,
            rollout_group_id: None,
            weight: None,
            created_at: ctx.now,
            last_modified_at: ctx.now,
            version: 0,
        }
    }

    /// The first history entry of a freshly created or started action.
    pub fn new_action_status(&self, action: &Action, message: Option<&str>, now: u64) -> ActionStatus {
        let mut messages: Vec<String> = message.map(str::to_string).into_iter().collect();
        let status = match self {
            AssignmentStrategy::Online => ActionState::Running,
            AssignmentStrategy::Offline => {
                messages.push(format!("{SERVER_MESSAGE_PREFIX}{OFFLINE_ANNOTATION}"));
                ActionState::Finished
            }
        };
        ActionStatus {
            id: 0,
            action_id: action.id,
            status,
            occurred_at: now,
            messages,
        }
    }

    /// Queue the assignment notification for `created` actions.
    ///
    /// Online only. Superseded actions and actions already canceling or
    /// canceled are left out. Outside multi-assignment mode so are targets
    /// still waiting for a cancellation confirmation. Returns the number of
    /// actions announced.
    pub fn emit_assignment_events(
        &self,
        uow: &mut UnitOfWork,
        ctx: &AssignmentContext<'_>,
        distribution_set_id: DistributionSetId,
        superseded: &Superseded,
        created: &[Action],
    ) -> usize {
        if *self == AssignmentStrategy::Offline {
            return 0;
        }
        let notified: Vec<&Action> = created
            .iter()
            .filter(|a| !superseded.action_ids.contains(&a.id))
            .filter(|a| ctx.multi_assignment || !superseded.target_ids.contains(&a.target_id))
            .filter(|a| !a.is_canceling_or_canceled())
            .collect();
        if notified.is_empty() {
            return 0;
        }
        let event = if ctx.multi_assignment {
            DeploymentEvent::MultiActionAssigned {
                tenant: ctx.tenant.to_string(),
                distribution_set_id,
                controller_ids: notified.iter().map(|a| a.controller_id.clone()).collect(),
            }
        } else {
            DeploymentEvent::DistributionSetAssigned {
                tenant: ctx.tenant.to_string(),
                distribution_set_id,
                assignments: notified
                    .iter()
                    .map(|a| ActionAssignment {
                        controller_id: a.controller_id.clone(),
                        action_id: a.id,
                    })
                    .collect(),
            }
        };
        uow.defer(event);
        notified.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::StateStore;

    fn ctx(multi_assignment: bool) -> AssignmentContext<'static> {
        AssignmentContext {
            tenant: "default",
            multi_assignment,
            auto_close: false,
            actor: Some("tester"),
            now: 100,
        }
    }

    fn seed_targets(store: &StateStore) {
        let mut a = Target::new("default", "A");
        a.assigned_distribution_set = Some(5);
        a.update_status = TargetUpdateStatus::InSync;
        let mut b = Target::new("default", "B");
        b.update_status = TargetUpdateStatus::Pending;
        b.assigned_distribution_set = Some(3);
        let mut c = Target::new("default", "C");
        let mut other_tenant = Target::new("acme", "A");
        for t in [&mut a, &mut b, &mut c, &mut other_tenant] {
            store.put_target(t).unwrap();
        }
    }

    fn ids(targets: &[Target]) -> Vec<&str> {
        targets.iter().map(|t| t.controller_id.as_str()).collect()
    }

    #[test]
    fn online_skips_targets_already_assigned() {
        let store = StateStore::open_in_memory().unwrap();
        seed_targets(&store);
        let uow = UnitOfWork::begin(&store).unwrap();
        let candidates = vec!["A".to_string(), "B".to_string(), "C".to_string()];

        let eligible = AssignmentStrategy::Online
            .find_eligible_targets(&uow, &ctx(false), &[&candidates], 5)
            .unwrap();
        assert_eq!(ids(&eligible), vec!["B", "C"]);

        let eligible = AssignmentStrategy::Online
            .find_eligible_targets(&uow, &ctx(true), &[&candidates], 5)
            .unwrap();
        assert_eq!(ids(&eligible), vec!["A", "B", "C"]);
    }

    #[test]
    fn offline_skips_pending_targets() {
        let store = StateStore::open_in_memory().unwrap();
        seed_targets(&store);
        let uow = UnitOfWork::begin(&store).unwrap();
        let first = vec!["A".to_string(), "B".to_string()];
        let second = vec!["C".to_string(), "A".to_string()];

        let eligible = AssignmentStrategy::Offline
            .find_eligible_targets(&uow, &ctx(false), &[&first, &second], 7)
            .unwrap();
        // Batches are processed in order; duplicates collapse.
        assert_eq!(ids(&eligible), vec!["A", "C"]);
    }

    #[test]
    fn initial_states_differ_by_strategy() {
        let target = Target {
            id: 4,
            ..Target::new("default", "A")
        };
        let requested = TargetWithActionType::new("A", ActionType::TimeForced, 999);

        let online = AssignmentStrategy::Online.new_action(&ctx(false), &target, 5, &requested);
        assert_eq!((online.status, online.active), (ActionState::Running, true));
        assert_eq!(online.forced_time, 999);

        let offline = AssignmentStrategy::Offline.new_action(&ctx(false), &target, 5, &requested);
        assert_eq!((offline.status, offline.active), (ActionState::Finished, false));

        let status = AssignmentStrategy::Offline.new_action_status(&offline, Some("note"), 1);
        assert_eq!(status.status, ActionState::Finished);
        assert_eq!(status.messages[0], "note");
        assert!(status.messages[1].ends_with(OFFLINE_ANNOTATION));

        let status = AssignmentStrategy::Online.new_action_status(&online, None, 1);
        assert_eq!(status.status, ActionState::Running);
        assert!(status.messages.is_empty());
    }

    #[test]
    fn events_group_by_multi_assignment_mode() {
        let store = StateStore::open_in_memory().unwrap();
        let target = Target {
            id: 1,
            ..Target::new("default", "A")
        };
        let requested = TargetWithActionType::forced("A");
        let mut created = AssignmentStrategy::Online.new_action(&ctx(false), &target, 5, &requested);
        created.id = 11;
        let mut canceling = created.clone();
        canceling.id = 12;
        canceling.status = ActionState::Canceling;

        let mut uow = UnitOfWork::begin(&store).unwrap();
        let announced = AssignmentStrategy::Online.emit_assignment_events(
            &mut uow,
            &ctx(false),
            5,
            &Superseded::default(),
            &[created.clone(), canceling.clone()],
        );
        assert_eq!(announced, 1);
        assert_eq!(uow.pending_events()[0].assigned_action_ids(), vec![11]);

        AssignmentStrategy::Online.emit_assignment_events(
            &mut uow,
            &ctx(true),
            5,
            &Superseded::default(),
            &[created.clone()],
        );
        assert!(matches!(
            &uow.pending_events()[1],
            DeploymentEvent::MultiActionAssigned { distribution_set_id: 5, controller_ids, .. }
                if controller_ids == &vec!["A".to_string()]
        ));

        let offline = AssignmentStrategy::Offline.emit_assignment_events(
            &mut uow,
            &ctx(false),
            5,
            &Superseded::default(),
            &[created],
        );
        assert_eq!(offline, 0);
        assert_eq!(uow.pending_events().len(), 2);
    }
}
