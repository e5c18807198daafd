//! Deployment events and the sinks that receive them.
//!
//! Events are only ever handed to a sink after the unit of work that produced
//! them has committed (see [`crate::tx::UnitOfWork`]).

use std::sync::Mutex;

use fleetgrid_state::{ActionId, DistributionSetId, TargetUpdateStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// One target's share of an assignment notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionAssignment {
    pub controller_id: String,
    pub action_id: ActionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentEvent {
    /// A distribution set was assigned; one entry per notified action.
    DistributionSetAssigned {
        tenant: String,
        distribution_set_id: DistributionSetId,
        assignments: Vec<ActionAssignment>,
    },
    /// Devices that handle several actions at once should fetch their action list.
    MultiActionAssigned {
        tenant: String,
        distribution_set_id: DistributionSetId,
        controller_ids: Vec<String>,
    },
    /// A device is asked to abandon an action.
    CancelTargetAssignment {
        tenant: String,
        distribution_set_id: DistributionSetId,
        controller_id: String,
        action_id: ActionId,
    },
    /// Server-side bookkeeping of a target changed.
    TargetUpdated {
        tenant: String,
        controller_id: String,
        update_status: TargetUpdateStatus,
        assigned_distribution_set: Option<DistributionSetId>,
    },
}

impl DeploymentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentEvent::DistributionSetAssigned { .. } => "distribution_set_assigned",
            DeploymentEvent::MultiActionAssigned { .. } => "multi_action_assigned",
            DeploymentEvent::CancelTargetAssignment { .. } => "cancel_target_assignment",
            DeploymentEvent::TargetUpdated { .. } => "target_updated",
        }
    }

    /// Ids of the actions an assignment notification announces.
    pub fn assigned_action_ids(&self) -> Vec<ActionId> {
        match self {
            DeploymentEvent::DistributionSetAssigned { assignments, .. } => {
                assignments.iter().map(|a| a.action_id).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Receiver of committed deployment events.
pub trait EventSink: Send + Sync {
    /// Called once per event, strictly after the producing transaction committed.
    fn publish_after_commit(&self, event: &DeploymentEvent);
}

/// Fans events out over a tokio broadcast channel.
pub struct BroadcastSink {
    tx: broadcast::Sender<DeploymentEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish_after_commit(&self, event: &DeploymentEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(kind = event.kind(), "no event subscribers");
        }
    }
}

/// Keeps every published event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DeploymentEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeploymentEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for RecordingSink {
    fn publish_after_commit(&self, event: &DeploymentEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assigned() -> DeploymentEvent {
        DeploymentEvent::DistributionSetAssigned {
            tenant: "default".to_string(),
            distribution_set_id: 7,
            assignments: vec![ActionAssignment {
                controller_id: "dev-1".to_string(),
                action_id: 3,
            }],
        }
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.publish_after_commit(&assigned());
        sink.publish_after_commit(&DeploymentEvent::MultiActionAssigned {
            tenant: "default".to_string(),
            distribution_set_id: 7,
            controller_ids: vec!["dev-1".to_string()],
        });
        let kinds: Vec<_> = sink.events().iter().map(DeploymentEvent::kind).collect();
        assert_eq!(kinds, vec!["distribution_set_assigned", "multi_action_assigned"]);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        // Publishing without subscribers is not an error.
        sink.publish_after_commit(&assigned());

        let mut rx = sink.subscribe();
        sink.publish_after_commit(&assigned());
        assert_eq!(rx.try_recv().unwrap(), assigned());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(assigned()).unwrap();
        assert_eq!(json["type"], "distribution_set_assigned");
        assert_eq!(json["assignments"][0]["action_id"], 3);
        assert_eq!(assigned().assigned_action_ids(), vec![3]);
    }
}
