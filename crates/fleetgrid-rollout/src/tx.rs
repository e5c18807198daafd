//! Unit of work with a post-commit event outbox.

use std::ops::{Deref, DerefMut};

use fleetgrid_state::{StateStore, WriteTxn};
use tracing::debug;

use crate::error::DeploymentResult;
use crate::events::{DeploymentEvent, EventSink};

/// A store transaction plus the events it will publish once committed.
///
/// Dereferences to the underlying [`WriteTxn`]. Events queued with
/// [`defer`](UnitOfWork::defer) reach the sink only from
/// [`commit`](UnitOfWork::commit); a rolled back or dropped unit of work
/// publishes nothing.
pub struct UnitOfWork {
    txn: WriteTxn,
    outbox: Vec<DeploymentEvent>,
}

impl UnitOfWork {
    pub fn begin(store: &StateStore) -> DeploymentResult<Self> {
        Ok(Self {
            txn: store.begin_write()?,
            outbox: Vec::new(),
        })
    }

    /// Queue an event for publication after commit.
    pub fn defer(&mut self, event: DeploymentEvent) {
        self.outbox.push(event);
    }

    pub fn pending_events(&self) -> &[DeploymentEvent] {
        &self.outbox
    }

    /// Commit the transaction, then flush the outbox to `sink` in queue order.
    /// Returns the number of published events.
    pub fn commit(self, sink: &dyn EventSink) -> DeploymentResult<usize> {
        let UnitOfWork { txn, outbox } = self;
        txn.commit()?;
        for event in &outbox {
            sink.publish_after_commit(event);
        }
        debug!(events = outbox.len(), "unit of work committed");
        Ok(outbox.len())
    }

    /// Discard every write and queued event.
    pub fn rollback(self) -> DeploymentResult<()> {
        let discarded = self.outbox.len();
        self.txn.abort()?;
        debug!(discarded, "unit of work rolled back");
        Ok(())
    }
}

impl Deref for UnitOfWork {
    type Target = WriteTxn;

    fn deref(&self) -> &WriteTxn {
        &self.txn
    }
}

impl DerefMut for UnitOfWork {
    fn deref_mut(&mut self) -> &mut WriteTxn {
        &mut self.txn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use fleetgrid_state::Target;

    fn event() -> DeploymentEvent {
        DeploymentEvent::MultiActionAssigned {
            tenant: "default".to_string(),
            distribution_set_id: 7,
            controller_ids: vec!["dev-1".to_string()],
        }
    }

    #[test]
    fn commit_publishes_after_writes_are_visible() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = RecordingSink::new();

        let mut uow = UnitOfWork::begin(&store).unwrap();
        uow.put_target(&mut Target::new("default", "dev-1")).unwrap();
        uow.defer(event());
        assert_eq!(uow.pending_events().len(), 1);
        assert!(sink.events().is_empty());

        assert_eq!(uow.commit(&sink).unwrap(), 1);
        assert_eq!(sink.events(), vec![event()]);
        assert!(store.get_target("default", "dev-1").unwrap().is_some());
    }

    #[test]
    fn rollback_discards_writes_and_events() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = RecordingSink::new();

        let mut uow = UnitOfWork::begin(&store).unwrap();
        uow.put_target(&mut Target::new("default", "dev-1")).unwrap();
        uow.defer(event());
        uow.rollback().unwrap();

        assert!(sink.events().is_empty());
        assert!(store.get_target("default", "dev-1").unwrap().is_none());
    }

    #[test]
    fn dropped_unit_of_work_publishes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = RecordingSink::new();
        {
            let mut uow = UnitOfWork::begin(&store).unwrap();
            uow.defer(event());
        }
        assert!(sink.events().is_empty());
    }
}
