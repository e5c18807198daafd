//! redb table definitions for the fleetgrid state store.
//!
//! Values are JSON-serialized domain records. Targets use the composite key
//! `{tenant}/{controller_id}`; action status history uses
//! `{action_id:020}:{status_id:020}` so one action's history is a contiguous
//! key range.

use redb::TableDefinition;

/// Targets keyed by `{tenant}/{controller_id}`.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Distribution sets keyed by id.
pub const DISTRIBUTION_SETS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("distribution_sets");

/// Actions keyed by id.
pub const ACTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("actions");

/// Action status history keyed by `{action_id:020}:{status_id:020}`.
pub const ACTION_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("action_status");

/// Rollouts keyed by id.
pub const ROLLOUTS: TableDefinition<u64, &[u8]> = TableDefinition::new("rollouts");

/// Rollout groups keyed by id.
pub const ROLLOUT_GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("rollout_groups");

/// Id sequences keyed by record kind; the value is the last id handed out.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
