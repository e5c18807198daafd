//! fleetgrid-rollout: assignment and rollout orchestration.
//!
//! Turns "deploy distribution set D to these targets" into persisted
//! [`Action`](fleetgrid_state::Action)s and target state changes, and drives
//! rollouts through their groups.
//!
//! # Architecture
//!
//! [`DeploymentManagement`] is the entry point. Every operation runs inside a
//! [`UnitOfWork`]: one store transaction plus an outbox of
//! [`DeploymentEvent`]s that reach the [`EventSink`] only after commit.
//! Operations that may hit a write conflict are wrapped in [`with_retry`].
//!
//! - [`strategy`]: online and offline assignment flows.
//! - [`action`]: cancel, force-quit and force operations on single actions.
//! - [`scheduler`]: paged start of scheduled rollout actions.
//! - [`rollout`]: rollout lifecycle and group threshold evaluation.
//! - [`cleanup`]: bounded deletion of old terminal actions.

pub mod action;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod quota;
pub mod retry;
pub mod rollout;
pub mod scheduler;
pub mod strategy;
pub mod tx;

use std::time::{SystemTime, UNIX_EPOCH};

pub use config::{ConfigKey, EngineConfig, QuotaSettings, TenantSettings};
pub use coordinator::{AssignmentResult, DeploymentManagement};
pub use error::{AssignmentDump, DeploymentError, DeploymentResult};
pub use events::{BroadcastSink, DeploymentEvent, EventSink, RecordingSink};
pub use retry::with_retry;
pub use rollout::{GroupDefinition, RolloutCreate};
pub use strategy::{AssignmentStrategy, TargetWithActionType};
pub use tx::UnitOfWork;

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
