//! Bounded deletion of aged terminal actions.

use fleetgrid_state::{ActionField, ActionState, Predicate};
use tracing::{debug, info};

use crate::config::CleanupConfig;
use crate::coordinator::DeploymentManagement;
use crate::error::DeploymentResult;
use crate::tx::UnitOfWork;

/// Most actions removed by one [`DeploymentManagement::delete_terminal`] call.
pub const CLEANUP_PAGE_SIZE: usize = 1000;

impl DeploymentManagement {
    /// Delete one page of the tenant's actions whose status is in `statuses`
    /// and which were last modified before `older_than` (epoch millis).
    /// Returns the number deleted; call until it returns 0 to drain.
    pub fn delete_terminal(&self, statuses: &[ActionState], older_than: u64) -> DeploymentResult<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let predicate = Predicate::eq(ActionField::Tenant, self.tenant())
            .and(Predicate::is_in(ActionField::Status, statuses.iter().copied()))
            .and(Predicate::lt(ActionField::LastModifiedAt, older_than));

        let mut uow = UnitOfWork::begin(self.store())?;
        let deleted = uow.delete_actions_where(&predicate, CLEANUP_PAGE_SIZE)?;
        uow.commit(self.sink())?;
        debug!(deleted, older_than, "terminal actions page deleted");
        Ok(deleted)
    }

    /// Drain every expired action the cleanup configuration selects.
    pub fn run_cleanup(&self, config: &CleanupConfig) -> DeploymentResult<u64> {
        let statuses = config.action_states()?;
        let expiry = u64::try_from(config.expiry().as_millis()).unwrap_or(u64::MAX);
        let older_than = crate::epoch_millis().saturating_sub(expiry);

        let mut total = 0;
        loop {
            let deleted = self.delete_terminal(&statuses, older_than)?;
            if deleted == 0 {
                break;
            }
            total += deleted;
        }
        if total > 0 {
            info!(deleted = total, "action cleanup finished");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::EngineConfig;
    use crate::events::RecordingSink;
    use fleetgrid_state::{Action, ActionStatus, ActionType, StateStore};

    fn manager() -> DeploymentManagement {
        let store = StateStore::open_in_memory().unwrap();
        DeploymentManagement::new(store, &EngineConfig::default(), Arc::new(RecordingSink::new()))
    }

    fn action(dm: &DeploymentManagement, tenant: &str, status: ActionState, modified: u64) -> u64 {
        let mut action = Action {
            id: 0,
            tenant: tenant.to_string(),
            target_id: 1,
            controller_id: "dev".to_string(),
            distribution_set_id: 1,
            status,
            active: false,
            action_type: ActionType::Forced,
            forced_time: 0,
            rollout_id: None,
            rollout_group_id: None,
            weight: None,
            created_at: modified,
            last_modified_at: modified,
            version: 0,
        };
        let mut txn = dm.store().begin_write().unwrap();
        txn.insert_action(&mut action).unwrap();
        let mut entry = ActionStatus {
            id: 0,
            action_id: action.id,
            status,
            occurred_at: modified,
            messages: vec![],
        };
        txn.insert_action_status(&mut entry).unwrap();
        txn.commit().unwrap();
        action.id
    }

    #[test]
    fn empty_status_list_deletes_nothing() {
        let dm = manager();
        action(&dm, "default", ActionState::Canceled, 10);
        assert_eq!(dm.delete_terminal(&[], u64::MAX).unwrap(), 0);
        assert_eq!(dm.store().count_actions(&Predicate::All).unwrap(), 1);
    }

    #[test]
    fn deletes_only_matching_old_actions_of_the_tenant() {
        let dm = manager();
        let old = action(&dm, "default", ActionState::Canceled, 10);
        let young = action(&dm, "default", ActionState::Canceled, 500);
        let other_status = action(&dm, "default", ActionState::Finished, 10);
        let other_tenant = action(&dm, "acme", ActionState::Canceled, 10);

        assert_eq!(dm.delete_terminal(&[ActionState::Canceled], 100).unwrap(), 1);

        assert!(dm.store().get_action(old).unwrap().is_none());
        assert!(dm.store().list_action_status(old).unwrap().is_empty());
        for kept in [young, other_status, other_tenant] {
            assert!(dm.store().get_action(kept).unwrap().is_some());
        }
    }

    #[test]
    fn deletion_is_paged() {
        let dm = manager();
        for _ in 0..CLEANUP_PAGE_SIZE + 5 {
            action(&dm, "default", ActionState::Error, 1);
        }
        assert_eq!(
            dm.delete_terminal(&[ActionState::Error], 2).unwrap(),
            CLEANUP_PAGE_SIZE as u64
        );
        assert_eq!(dm.delete_terminal(&[ActionState::Error], 2).unwrap(), 5);
        assert_eq!(dm.delete_terminal(&[ActionState::Error], 2).unwrap(), 0);
    }

    #[test]
    fn run_cleanup_drains_expired_actions() {
        let dm = manager();
        for _ in 0..3 {
            action(&dm, "default", ActionState::Canceled, 1);
        }
        let fresh = action(&dm, "default", ActionState::Canceled, crate::epoch_millis());

        let config = CleanupConfig {
            enabled: true,
            ..CleanupConfig::default()
        };
        assert_eq!(dm.run_cleanup(&config).unwrap(), 3);
        assert!(dm.store().get_action(fresh).unwrap().is_some());
    }

    #[test]
    fn unbounded_expiry_keeps_everything() {
        let dm = manager();
        action(&dm, "default", ActionState::Canceled, 1);

        let config = CleanupConfig {
            enabled: true,
            expiry_days: u64::MAX,
            ..CleanupConfig::default()
        };
        assert_eq!(dm.run_cleanup(&config).unwrap(), 0);
        assert_eq!(dm.store().count_actions(&Predicate::All).unwrap(), 1);
    }
}
