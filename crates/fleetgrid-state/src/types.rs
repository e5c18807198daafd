//! Domain records for the fleetgrid state store.
//!
//! These types represent the persisted state of targets, distribution sets,
//! actions with their status history, rollouts and rollout groups. All types
//! are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

use crate::query::{Filterable, Predicate, Value};

/// Numeric identifier of a target (stable across controller id lookups).
pub type TargetId = u64;

/// Identifier of a distribution set.
pub type DistributionSetId = u64;

/// Identifier of an action.
pub type ActionId = u64;

/// Identifier of a rollout.
pub type RolloutId = u64;

/// Identifier of a rollout group.
pub type RolloutGroupId = u64;

// ── Target ─────────────────────────────────────────────────────────

/// Update status of a target as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetUpdateStatus {
    Unknown,
    Registered,
    Pending,
    InSync,
    Error,
}

impl TargetUpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetUpdateStatus::Unknown => "unknown",
            TargetUpdateStatus::Registered => "registered",
            TargetUpdateStatus::Pending => "pending",
            TargetUpdateStatus::InSync => "in_sync",
            TargetUpdateStatus::Error => "error",
        }
    }
}

/// A managed device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub id: TargetId,
    pub tenant: String,
    /// Unique, stable identifier the device uses to talk to the server.
    pub controller_id: String,
    pub update_status: TargetUpdateStatus,
    pub assigned_distribution_set: Option<DistributionSetId>,
    pub installed_distribution_set: Option<DistributionSetId>,
    /// Unix timestamp (milliseconds) of the last modification.
    pub last_modified_at: u64,
    pub last_modified_by: Option<String>,
    /// Optimistic-lock version, bumped on every versioned update.
    pub version: u64,
}

impl Target {
    /// A freshly registered target; the id is assigned on insert.
    pub fn new(tenant: &str, controller_id: &str) -> Self {
        Self {
            id: 0,
            tenant: tenant.to_string(),
            controller_id: controller_id.to_string(),
            update_status: TargetUpdateStatus::Registered,
            assigned_distribution_set: None,
            installed_distribution_set: None,
            last_modified_at: 0,
            last_modified_by: None,
            version: 0,
        }
    }

    /// Build the composite key for the targets table.
    pub fn table_key(&self) -> String {
        target_key(&self.tenant, &self.controller_id)
    }
}

/// Composite targets-table key for a tenant's controller id.
pub fn target_key(tenant: &str, controller_id: &str) -> String {
    format!("{tenant}/{controller_id}")
}

/// Queryable target attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    Id,
    Tenant,
    ControllerId,
    UpdateStatus,
    AssignedDistributionSet,
    InstalledDistributionSet,
}

impl Filterable for Target {
    type Field = TargetField;

    fn field(&self, field: &TargetField) -> Value {
        match field {
            TargetField::Id => self.id.into(),
            TargetField::Tenant => self.tenant.as_str().into(),
            TargetField::ControllerId => self.controller_id.as_str().into(),
            TargetField::UpdateStatus => self.update_status.as_str().into(),
            TargetField::AssignedDistributionSet => self.assigned_distribution_set.into(),
            TargetField::InstalledDistributionSet => self.installed_distribution_set.into(),
        }
    }
}

// ── Distribution set ───────────────────────────────────────────────

/// Declares which software module types a distribution set must and may carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionSetType {
    pub key: String,
    pub mandatory_module_types: Vec<String>,
    pub optional_module_types: Vec<String>,
}

/// A versioned software module inside a distribution set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoftwareModule {
    pub id: u64,
    pub module_type: String,
    pub name: String,
    pub version: String,
}

/// A typed bundle of software modules assigned to targets as a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionSet {
    pub id: DistributionSetId,
    pub tenant: String,
    pub name: String,
    pub version: String,
    pub set_type: DistributionSetType,
    pub modules: Vec<SoftwareModule>,
}

impl DistributionSet {
    /// Mandatory module types of the set's type that have no module yet.
    pub fn missing_module_types(&self) -> Vec<String> {
        self.set_type
            .mandatory_module_types
            .iter()
            .filter(|t| !self.modules.iter().any(|m| &m.module_type == *t))
            .cloned()
            .collect()
    }

    /// A set is complete iff every mandatory module slot is filled.
    pub fn is_complete(&self) -> bool {
        self.missing_module_types().is_empty()
    }
}

// ── Action ─────────────────────────────────────────────────────────

/// Lifecycle state of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Scheduled,
    Running,
    Finished,
    Error,
    Canceling,
    Canceled,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Scheduled => "scheduled",
            ActionState::Running => "running",
            ActionState::Finished => "finished",
            ActionState::Error => "error",
            ActionState::Canceling => "canceling",
            ActionState::Canceled => "canceled",
        }
    }

    /// Finished, error and canceled actions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionState::Finished | ActionState::Error | ActionState::Canceled
        )
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Ok(ActionState::Scheduled),
            "running" => Ok(ActionState::Running),
            "finished" => Ok(ActionState::Finished),
            "error" => Ok(ActionState::Error),
            "canceling" => Ok(ActionState::Canceling),
            "canceled" => Ok(ActionState::Canceled),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// How insistently the device is asked to apply the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Soft,
    Forced,
    TimeForced,
    DownloadOnly,
}

/// Work order binding one target to one distribution set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub tenant: String,
    pub target_id: TargetId,
    pub controller_id: String,
    pub distribution_set_id: DistributionSetId,
    pub status: ActionState,
    pub active: bool,
    pub action_type: ActionType,
    /// Unix timestamp (milliseconds); only meaningful for `TimeForced`.
    pub forced_time: u64,
    pub rollout_id: Option<RolloutId>,
    pub rollout_group_id: Option<RolloutGroupId>,
    /// Scheduling priority hint.
    pub weight: Option<u16>,
    pub created_at: u64,
    pub last_modified_at: u64,
    pub version: u64,
}

impl Action {
    pub fn is_canceling_or_canceled(&self) -> bool {
        matches!(self.status, ActionState::Canceling | ActionState::Canceled)
    }

    pub fn is_forced(&self) -> bool {
        self.action_type == ActionType::Forced
    }
}

/// Queryable action attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionField {
    Id,
    Tenant,
    TargetId,
    ControllerId,
    DistributionSetId,
    Status,
    Active,
    RolloutId,
    RolloutGroupId,
    LastModifiedAt,
}

impl Filterable for Action {
    type Field = ActionField;

    fn field(&self, field: &ActionField) -> Value {
        match field {
            ActionField::Id => self.id.into(),
            ActionField::Tenant => self.tenant.as_str().into(),
            ActionField::TargetId => self.target_id.into(),
            ActionField::ControllerId => self.controller_id.as_str().into(),
            ActionField::DistributionSetId => self.distribution_set_id.into(),
            ActionField::Status => self.status.into(),
            ActionField::Active => self.active.into(),
            ActionField::RolloutId => self.rollout_id.into(),
            ActionField::RolloutGroupId => self.rollout_group_id.into(),
            ActionField::LastModifiedAt => self.last_modified_at.into(),
        }
    }
}

/// Immutable history entry of an action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStatus {
    pub id: u64,
    pub action_id: ActionId,
    pub status: ActionState,
    /// Unix timestamp (milliseconds) the status was reached.
    pub occurred_at: u64,
    pub messages: Vec<String>,
}

impl ActionStatus {
    /// Build the composite key for the action status table.
    pub fn table_key(&self) -> String {
        action_status_key(self.action_id, self.id)
    }
}

/// Composite action-status key; zero padding keeps one action's entries ordered.
pub fn action_status_key(action_id: ActionId, status_id: u64) -> String {
    format!("{action_id:020}:{status_id:020}")
}

// ── Rollout ────────────────────────────────────────────────────────

/// Overall status of a rollout campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Creating,
    Ready,
    Starting,
    Running,
    Paused,
    Stopped,
    Finished,
    ErrorCreating,
    ErrorStarting,
    Deleting,
    Deleted,
}

/// A campaign assigning one distribution set to a filtered fleet in groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub tenant: String,
    pub name: String,
    pub target_filter: Predicate<TargetField>,
    pub distribution_set_id: DistributionSetId,
    pub action_type: ActionType,
    pub forced_time: u64,
    pub status: RolloutStatus,
    /// Fixed once the groups are created.
    pub total_targets: u64,
    pub rollout_groups_created: u32,
    pub start_at: Option<u64>,
    pub last_check: u64,
    pub version: u64,
}

/// Status of one rollout group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutGroupStatus {
    Ready,
    Scheduled,
    Running,
    Finished,
    Error,
}

/// When a group counts as successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCondition {
    /// Percentage of finished actions reached the threshold.
    Threshold,
}

/// What happens once a group succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessAction {
    /// Start the child groups.
    NextGroup,
}

/// When a group counts as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCondition {
    /// Percentage of errored actions exceeds the threshold.
    Threshold,
}

/// What happens once a group failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Pause the whole rollout.
    Pause,
}

/// Success/error condition and action pairing of a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConditions {
    pub success_condition: SuccessCondition,
    /// Threshold percentage (0-100).
    pub success_threshold: u32,
    pub success_action: SuccessAction,
    pub error_condition: Option<ErrorCondition>,
    /// Threshold percentage (0-100).
    pub error_threshold: u32,
    pub error_action: Option<ErrorAction>,
}

impl Default for GroupConditions {
    fn default() -> Self {
        Self {
            success_condition: SuccessCondition::Threshold,
            success_threshold: 100,
            success_action: SuccessAction::NextGroup,
            error_condition: None,
            error_threshold: 0,
            error_action: None,
        }
    }
}

/// A subset of a rollout's targets, progressed as one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: RolloutGroupId,
    pub rollout_id: RolloutId,
    pub name: String,
    /// The group that must succeed before this one starts; `None` for root groups.
    pub parent_id: Option<RolloutGroupId>,
    pub status: RolloutGroupStatus,
    pub conditions: GroupConditions,
    /// Share of the rollout's targets placed in this group (0-100).
    pub target_percentage: f32,
    pub total_targets: u64,
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matching records, including those beyond this page.
    pub total: u64,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_only_set(modules: Vec<SoftwareModule>) -> DistributionSet {
        DistributionSet {
            id: 5,
            tenant: "default".to_string(),
            name: "firmware".to_string(),
            version: "1.0".to_string(),
            set_type: DistributionSetType {
                key: "os_app".to_string(),
                mandatory_module_types: vec!["os".to_string()],
                optional_module_types: vec!["application".to_string()],
            },
            modules,
        }
    }

    #[test]
    fn distribution_set_completeness() {
        let empty = os_only_set(vec![]);
        assert!(!empty.is_complete());
        assert_eq!(empty.missing_module_types(), vec!["os".to_string()]);

        let app_only = os_only_set(vec![SoftwareModule {
            id: 1,
            module_type: "application".to_string(),
            name: "app".to_string(),
            version: "1".to_string(),
        }]);
        assert!(!app_only.is_complete());

        let complete = os_only_set(vec![SoftwareModule {
            id: 2,
            module_type: "os".to_string(),
            name: "linux".to_string(),
            version: "6.1".to_string(),
        }]);
        assert!(complete.is_complete());
    }

    #[test]
    fn terminal_states() {
        assert!(ActionState::Finished.is_terminal());
        assert!(ActionState::Error.is_terminal());
        assert!(ActionState::Canceled.is_terminal());
        assert!(!ActionState::Running.is_terminal());
        assert!(!ActionState::Canceling.is_terminal());
        assert!(!ActionState::Scheduled.is_terminal());
    }

    #[test]
    fn action_state_parses_case_insensitively() {
        assert_eq!("CANCELED".parse::<ActionState>(), Ok(ActionState::Canceled));
        assert_eq!("error".parse::<ActionState>(), Ok(ActionState::Error));
        assert!("retrieved".parse::<ActionState>().is_err());
    }

    #[test]
    fn action_status_keys_sort_by_action_then_entry() {
        let a = action_status_key(2, 10);
        let b = action_status_key(10, 1);
        assert!(a < b);
        assert_eq!(a, "00000000000000000002:00000000000000000010");
    }
}
