//! Deployment engine error types.

use std::collections::BTreeMap;

use fleetgrid_state::{
    ActionId, ActionState, ActionType, DistributionSetId, RolloutId, RolloutStatus, StateError,
    Target,
};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by assignment, action lifecycle, scheduling and rollout operations.
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("distribution set {id} is incomplete: missing mandatory module types {missing:?}")]
    IncompleteDistributionSet {
        id: DistributionSetId,
        missing: Vec<String>,
    },

    #[error("quota exceeded for {resource}: requested {requested}, limit {limit}")]
    QuotaExceeded {
        resource: &'static str,
        requested: usize,
        limit: usize,
    },

    #[error("cannot {operation} action {action_id}: status {status}, active {active}")]
    InvalidTransition {
        action_id: ActionId,
        status: ActionState,
        active: bool,
        operation: &'static str,
    },

    #[error("cannot {operation} rollout {rollout_id} in status {status:?}")]
    InvalidRolloutTransition {
        rollout_id: RolloutId,
        status: RolloutStatus,
        operation: &'static str,
    },

    #[error("transient write conflict: {0}")]
    TransientConflict(String),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("invariant violated during assignment: {}", .0.reason)]
    InvariantViolation(Box<AssignmentDump>),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DeploymentError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DeploymentError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the failure came from a concurrent write and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            DeploymentError::TransientConflict(_) => true,
            DeploymentError::State(e) => e.is_conflict(),
            _ => false,
        }
    }
}

pub type DeploymentResult<T> = Result<T, DeploymentError>;

/// Diagnostic snapshot captured when an assignment hits a state that should be
/// impossible, e.g. a target selected for assignment that was never requested.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentDump {
    pub reason: String,
    pub target: Option<Target>,
    pub distribution_set_id: DistributionSetId,
    /// Controller ids as requested by the caller.
    pub controller_ids: Vec<String>,
    /// Controller ids of the targets selected for assignment.
    pub eligible_controller_ids: Vec<String>,
    /// Requested action type per controller id.
    pub requested_action_types: BTreeMap<String, ActionType>,
}
