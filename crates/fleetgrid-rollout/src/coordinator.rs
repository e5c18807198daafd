//! Deployment management: the entry point for assignments, single-action
//! operations and action queries.
//!
//! Every mutating operation runs in its own [`UnitOfWork`] wrapped in
//! [`with_retry`], so a write conflict re-runs the whole operation against
//! freshly committed state. Events reach the sink only after commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetgrid_state::{
    Action, ActionField, ActionId, ActionState, ActionStatus, DistributionSet, DistributionSetId,
    Page, Predicate, StateStore, Target, TargetId,
};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::action;
use crate::config::{
    ConfigKey, EngineConfig, QuotaSettings, RetryConfig, SchedulerConfig, TenantSettings,
};
use crate::error::{AssignmentDump, DeploymentError, DeploymentResult};
use crate::events::EventSink;
use crate::quota::{self, TARGETS_PER_MANUAL_ASSIGNMENT};
use crate::retry::with_retry;
use crate::strategy::{AssignmentContext, AssignmentStrategy, TargetWithActionType};
use crate::tx::UnitOfWork;

/// Outcome of one assignment call.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentResult {
    pub assigned_controller_ids: Vec<String>,
    pub assigned: usize,
    /// Requested targets that did not qualify, e.g. because they already
    /// carry the distribution set.
    pub already_assigned: usize,
    pub actions: Vec<Action>,
}

/// Assignment, action lifecycle and query operations for one tenant.
#[derive(Clone)]
pub struct DeploymentManagement {
    store: StateStore,
    settings: Arc<dyn TenantSettings>,
    quotas: Arc<dyn QuotaSettings>,
    retry: RetryConfig,
    pub(crate) scheduler: SchedulerConfig,
    sink: Arc<dyn EventSink>,
}

impl DeploymentManagement {
    /// Build from a parsed configuration; tenant settings and quotas come from it.
    pub fn new(store: StateStore, config: &EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        let shared = Arc::new(config.clone());
        Self {
            store,
            settings: shared.clone(),
            quotas: shared,
            retry: config.retry.clone(),
            scheduler: config.scheduler.clone(),
            sink,
        }
    }

    /// Build with caller-supplied tenant and quota providers.
    pub fn with_providers(
        store: StateStore,
        settings: Arc<dyn TenantSettings>,
        quotas: Arc<dyn QuotaSettings>,
        retry: RetryConfig,
        scheduler: SchedulerConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            settings,
            quotas,
            retry,
            scheduler,
            sink,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn tenant(&self) -> &str {
        self.settings.tenant()
    }

    pub(crate) fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    pub(crate) fn context(&self, now: u64) -> AssignmentContext<'_> {
        AssignmentContext {
            tenant: self.settings.tenant(),
            multi_assignment: self.settings.get_bool(ConfigKey::MultiAssignmentsEnabled),
            auto_close: self.settings.get_bool(ConfigKey::ActionsAutocloseEnabled),
            actor: None,
            now,
        }
    }

    pub(crate) fn max_ids_per_batch(&self) -> usize {
        self.quotas.max_ids_per_batch().max(1)
    }

    pub(crate) fn retrying<T>(&self, op: impl FnMut() -> DeploymentResult<T>) -> DeploymentResult<T> {
        with_retry(self.retry.max_attempts, self.retry.backoff(), op)
    }

    // ── Assignment ─────────────────────────────────────────────────

    /// Assign a distribution set to targets with per-target action types.
    pub fn assign(
        &self,
        distribution_set_id: DistributionSetId,
        targets: &[TargetWithActionType],
        message: Option<&str>,
        strategy: AssignmentStrategy,
    ) -> DeploymentResult<AssignmentResult> {
        self.retrying(|| self.assign_once(distribution_set_id, targets, message, strategy))
    }

    /// Record that targets already installed a distribution set outside the
    /// server. Every action is created as FORCED.
    pub fn offline_assign(
        &self,
        distribution_set_id: DistributionSetId,
        controller_ids: &[String],
    ) -> DeploymentResult<AssignmentResult> {
        let targets: Vec<_> = controller_ids
            .iter()
            .map(|id| TargetWithActionType::forced(id.as_str()))
            .collect();
        self.assign(distribution_set_id, &targets, None, AssignmentStrategy::Offline)
    }

    fn assign_once(
        &self,
        distribution_set_id: DistributionSetId,
        requested: &[TargetWithActionType],
        message: Option<&str>,
        strategy: AssignmentStrategy,
    ) -> DeploymentResult<AssignmentResult> {
        let ctx = self.context(crate::epoch_millis());
        let mut uow = UnitOfWork::begin(&self.store)?;

        let set = load_complete_set(&uow, ctx.tenant, distribution_set_id)?;

        let controller_ids: Vec<String> =
            requested.iter().map(|t| t.controller_id.clone()).collect();
        if !controller_ids.is_empty() {
            quota::check_count(
                TARGETS_PER_MANUAL_ASSIGNMENT,
                controller_ids.len(),
                self.quotas.max_targets_per_manual_assignment(),
            )?;
        }
        debug!(
            distribution_set = set.id,
            targets = controller_ids.len(),
            ?strategy,
            "assigning distribution set"
        );

        let by_controller: BTreeMap<&str, &TargetWithActionType> = requested
            .iter()
            .map(|t| (t.controller_id.as_str(), t))
            .collect();

        let batch_size = self.max_ids_per_batch();
        let id_batches: Vec<&[String]> = controller_ids.chunks(batch_size).collect();
        let eligible = strategy.find_eligible_targets(&uow, &ctx, &id_batches, set.id)?;

        if eligible.is_empty() {
            uow.rollback()?;
            return Ok(AssignmentResult {
                assigned_controller_ids: Vec::new(),
                assigned: 0,
                already_assigned: requested.len(),
                actions: Vec::new(),
            });
        }

        let target_ids: Vec<TargetId> = eligible.iter().map(|t| t.id).collect();
        let target_batches: Vec<&[TargetId]> = target_ids.chunks(batch_size).collect();

        let superseded = strategy.resolve_conflicting_actions(&mut uow, &ctx, &target_batches)?;
        for batch in &target_batches {
            action::cancel_scheduled_actions(&mut uow, ctx.tenant, batch, ctx.now)?;
        }
        strategy.apply_target_status(&mut uow, &ctx, set.id, &target_batches)?;

        let mut created = Vec::with_capacity(eligible.len());
        for target in &eligible {
            let Some(wanted) = by_controller.get(target.controller_id.as_str()) else {
                return Err(invariant_violation(
                    "target selected for assignment was not requested",
                    target,
                    &set,
                    &controller_ids,
                    &eligible,
                    &by_controller,
                ));
            };
            let mut new_action = strategy.new_action(&ctx, target, set.id, wanted);
            uow.insert_action(&mut new_action)?;
            created.push(new_action);
        }
        for created_action in &created {
            let mut status = strategy.new_action_status(created_action, message, ctx.now);
            uow.insert_action_status(&mut status)?;
        }

        strategy.emit_assignment_events(&mut uow, &ctx, set.id, &superseded, &created);
        uow.commit(self.sink())?;

        info!(
            distribution_set = set.id,
            assigned = created.len(),
            superseded = superseded.action_ids.len(),
            ?strategy,
            "distribution set assigned"
        );
        Ok(AssignmentResult {
            assigned_controller_ids: eligible.iter().map(|t| t.controller_id.clone()).collect(),
            assigned: eligible.len(),
            already_assigned: requested.len().saturating_sub(eligible.len()),
            actions: created,
        })
    }

    // ── Single-action operations ───────────────────────────────────

    /// Request cancellation of an active action.
    pub fn cancel_action(&self, action_id: ActionId) -> DeploymentResult<Action> {
        self.retrying(|| {
            let mut uow = UnitOfWork::begin(&self.store)?;
            let mut target_action = self.load_action(&uow, action_id)?;
            action::cancel(&mut uow, &mut target_action, crate::epoch_millis())?;
            uow.commit(self.sink())?;
            Ok(target_action)
        })
    }

    /// Terminate an action stuck in CANCELING.
    pub fn force_quit_action(&self, action_id: ActionId) -> DeploymentResult<Action> {
        self.retrying(|| {
            let mut uow = UnitOfWork::begin(&self.store)?;
            let mut target_action = self.load_action(&uow, action_id)?;
            action::force_quit(&mut uow, &mut target_action, crate::epoch_millis())?;
            uow.commit(self.sink())?;
            Ok(target_action)
        })
    }

    /// Escalate an action to FORCED without touching its status.
    pub fn force_target_action(&self, action_id: ActionId) -> DeploymentResult<Action> {
        self.retrying(|| {
            let mut uow = UnitOfWork::begin(&self.store)?;
            let mut target_action = self.load_action(&uow, action_id)?;
            if action::force_to_forced_type(&mut uow, &mut target_action, crate::epoch_millis())? {
                uow.commit(self.sink())?;
            } else {
                uow.rollback()?;
            }
            Ok(target_action)
        })
    }

    fn load_action(&self, uow: &UnitOfWork, action_id: ActionId) -> DeploymentResult<Action> {
        uow.get_action(action_id)?
            .filter(|a| a.tenant == self.tenant())
            .ok_or_else(|| DeploymentError::not_found("action", action_id))
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn find_action(&self, action_id: ActionId) -> DeploymentResult<Option<Action>> {
        Ok(self
            .store
            .get_action(action_id)?
            .filter(|a| a.tenant == self.tenant()))
    }

    /// Actions of a target, oldest first.
    pub fn find_actions_by_target(
        &self,
        controller_id: &str,
        limit: usize,
    ) -> DeploymentResult<Page<Action>> {
        let target = self.existing_target(controller_id)?;
        Ok(self.store.find_actions(&action::by_target(target.id), limit)?)
    }

    /// Actions of a target that are currently active.
    pub fn find_active_actions_by_target(
        &self,
        controller_id: &str,
        limit: usize,
    ) -> DeploymentResult<Page<Action>> {
        self.find_actions_by_target_and_activity(controller_id, true, limit)
    }

    /// Actions of a target that are no longer (or not yet) active.
    pub fn find_inactive_actions_by_target(
        &self,
        controller_id: &str,
        limit: usize,
    ) -> DeploymentResult<Page<Action>> {
        self.find_actions_by_target_and_activity(controller_id, false, limit)
    }

    fn find_actions_by_target_and_activity(
        &self,
        controller_id: &str,
        active: bool,
        limit: usize,
    ) -> DeploymentResult<Page<Action>> {
        let target = self.existing_target(controller_id)?;
        let filter = action::by_target(target.id).and(Predicate::eq(ActionField::Active, active));
        Ok(self.store.find_actions(&filter, limit)?)
    }

    pub fn count_actions_by_target(&self, controller_id: &str) -> DeploymentResult<u64> {
        let target = self.existing_target(controller_id)?;
        Ok(self.store.count_actions(&action::by_target(target.id))?)
    }

    /// Status history of an action, oldest first.
    pub fn find_action_status_by_action(
        &self,
        action_id: ActionId,
    ) -> DeploymentResult<Vec<ActionStatus>> {
        if self.find_action(action_id)?.is_none() {
            return Err(DeploymentError::not_found("action", action_id));
        }
        Ok(self.store.list_action_status(action_id)?)
    }

    /// Actions of the tenant in a given status.
    pub fn find_actions_by_status(
        &self,
        status: ActionState,
        limit: usize,
    ) -> DeploymentResult<Page<Action>> {
        let filter = Predicate::eq(ActionField::Tenant, self.tenant())
            .and(Predicate::eq(ActionField::Status, status));
        Ok(self.store.find_actions(&filter, limit)?)
    }

    pub fn assigned_distribution_set(
        &self,
        controller_id: &str,
    ) -> DeploymentResult<Option<DistributionSet>> {
        let target = self.existing_target(controller_id)?;
        self.lookup_set(target.assigned_distribution_set)
    }

    pub fn installed_distribution_set(
        &self,
        controller_id: &str,
    ) -> DeploymentResult<Option<DistributionSet>> {
        let target = self.existing_target(controller_id)?;
        self.lookup_set(target.installed_distribution_set)
    }

    fn lookup_set(&self, id: Option<DistributionSetId>) -> DeploymentResult<Option<DistributionSet>> {
        match id {
            Some(id) => Ok(self.store.get_distribution_set(id)?),
            None => Ok(None),
        }
    }

    /// Fail fast with `NotFound` for unknown controller ids.
    fn existing_target(&self, controller_id: &str) -> DeploymentResult<Target> {
        self.store
            .get_target(self.tenant(), controller_id)?
            .ok_or_else(|| DeploymentError::not_found("target", controller_id))
    }
}

/// Load a distribution set of the tenant and require all mandatory modules.
pub(crate) fn load_complete_set(
    uow: &UnitOfWork,
    tenant: &str,
    id: DistributionSetId,
) -> DeploymentResult<DistributionSet> {
    let set = uow
        .get_distribution_set(id)?
        .filter(|s| s.tenant == tenant)
        .ok_or_else(|| DeploymentError::not_found("distribution set", id))?;
    if !set.is_complete() {
        return Err(DeploymentError::IncompleteDistributionSet {
            id,
            missing: set.missing_module_types(),
        });
    }
    Ok(set)
}

fn invariant_violation(
    reason: &str,
    target: &Target,
    set: &DistributionSet,
    controller_ids: &[String],
    eligible: &[Target],
    requested: &BTreeMap<&str, &TargetWithActionType>,
) -> DeploymentError {
    let dump = AssignmentDump {
        reason: reason.to_string(),
        target: Some(target.clone()),
        distribution_set_id: set.id,
        controller_ids: controller_ids.to_vec(),
        eligible_controller_ids: eligible.iter().map(|t| t.controller_id.clone()).collect(),
        requested_action_types: requested
            .iter()
            .map(|(id, t)| (id.to_string(), t.action_type))
            .collect(),
    };
    error!(
        target_id = target.id,
        controller_id = %target.controller_id,
        distribution_set = set.id,
        dump = %serde_json::to_string(&dump).unwrap_or_default(),
        "assignment invariant violated"
    );
    DeploymentError::InvariantViolation(Box::new(dump))
}
