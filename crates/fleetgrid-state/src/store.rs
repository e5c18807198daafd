//! StateStore: redb-backed persistence for fleetgrid.
//!
//! Read helpers on [`StateStore`] each open their own read transaction and
//! therefore only ever observe committed data. All mutation goes through a
//! [`WriteTxn`] unit of work: nothing it writes is visible to anyone else until
//! [`WriteTxn::commit`], and dropping or aborting it discards every write.
//!
//! Targets, actions and rollouts carry a `version`. The versioned `update_*`
//! methods reject a record whose version no longer matches the stored one with
//! [`StateError::Conflict`], which callers treat as a transient failure.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::query::Predicate;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const SEQ_TARGET: &str = "target";
const SEQ_ACTION: &str = "action";
const SEQ_ACTION_STATUS: &str = "action_status";
const SEQ_ROLLOUT: &str = "rollout";
const SEQ_ROLLOUT_GROUP: &str = "rollout_group";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TARGETS).map_err(map_err!(Table))?;
        txn.open_table(DISTRIBUTION_SETS).map_err(map_err!(Table))?;
        txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Begin a unit of work.
    pub fn begin_write(&self) -> StateResult<WriteTxn> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Ok(WriteTxn { txn })
    }

    // ── Single-record writes ───────────────────────────────────────

    /// Insert or replace a target in its own transaction, assigning an id if unset.
    pub fn put_target(&self, target: &mut Target) -> StateResult<()> {
        let mut txn = self.begin_write()?;
        txn.put_target(target)?;
        txn.commit()
    }

    /// Insert or replace a distribution set in its own transaction.
    pub fn put_distribution_set(&self, set: &DistributionSet) -> StateResult<()> {
        let mut txn = self.begin_write()?;
        txn.put_distribution_set(set)?;
        txn.commit()
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Get a target by tenant and controller id.
    pub fn get_target(&self, tenant: &str, controller_id: &str) -> StateResult<Option<Target>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        get_by_key(&table, &target_key(tenant, controller_id))
    }

    /// All targets matching the predicate, in key order.
    pub fn find_targets(&self, predicate: &Predicate<TargetField>) -> StateResult<Vec<Target>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        Ok(scan(&table, usize::MAX, |t: &Target| predicate.matches(t))?.items)
    }

    // ── Distribution sets ──────────────────────────────────────────

    /// Get a distribution set by id.
    pub fn get_distribution_set(&self, id: DistributionSetId) -> StateResult<Option<DistributionSet>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DISTRIBUTION_SETS).map_err(map_err!(Table))?;
        get_by_id(&table, id)
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Get an action by id.
    pub fn get_action(&self, id: ActionId) -> StateResult<Option<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        get_by_id(&table, id)
    }

    /// Up to `limit` matching actions in id order, plus the total match count.
    pub fn find_actions(
        &self,
        predicate: &Predicate<ActionField>,
        limit: usize,
    ) -> StateResult<Page<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        scan(&table, limit, |a: &Action| predicate.matches(a))
    }

    /// Number of actions matching the predicate.
    pub fn count_actions(&self, predicate: &Predicate<ActionField>) -> StateResult<u64> {
        Ok(self.find_actions(predicate, 0)?.total)
    }

    /// Status history of an action, oldest first.
    pub fn list_action_status(&self, action_id: ActionId) -> StateResult<Vec<ActionStatus>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        status_range(&table, action_id)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Get a rollout by id.
    pub fn get_rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        get_by_id(&table, id)
    }

    /// All rollouts of a tenant with the given status.
    pub fn list_rollouts_by_status(
        &self,
        tenant: &str,
        status: RolloutStatus,
    ) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let page = scan(&table, usize::MAX, |r: &Rollout| {
            r.tenant == tenant && r.status == status
        })?;
        Ok(page.items)
    }

    /// Groups of a rollout in creation order.
    pub fn list_rollout_groups(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        let page = scan(&table, usize::MAX, |g: &RolloutGroup| g.rollout_id == rollout_id)?;
        Ok(page.items)
    }
}

/// A unit of work over the store.
///
/// Writes become visible on [`commit`](WriteTxn::commit); dropping the
/// transaction without committing rolls everything back.
pub struct WriteTxn {
    txn: redb::WriteTransaction,
}

impl WriteTxn {
    /// Make every write of this unit of work durable and visible.
    pub fn commit(self) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Transaction))?;
        debug!("transaction committed");
        Ok(())
    }

    /// Discard every write of this unit of work.
    pub fn abort(self) -> StateResult<()> {
        self.txn.abort().map_err(map_err!(Transaction))?;
        debug!("transaction rolled back");
        Ok(())
    }

    /// Hand out the next id of a sequence (ids start at 1).
    fn next_id(&mut self, sequence: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        let current = table
            .get(sequence)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(sequence, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Insert or replace a target without a version check, assigning an id if unset.
    pub fn put_target(&mut self, target: &mut Target) -> StateResult<()> {
        if target.id == 0 {
            target.id = self.next_id(SEQ_TARGET)?;
        }
        let key = target.table_key();
        let value = encode(target)?;
        let mut table = self.txn.open_table(TARGETS).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(%key, id = target.id, "target stored");
        Ok(())
    }

    /// Get a target by tenant and controller id.
    pub fn get_target(&self, tenant: &str, controller_id: &str) -> StateResult<Option<Target>> {
        let table = self.txn.open_table(TARGETS).map_err(map_err!(Table))?;
        get_by_key(&table, &target_key(tenant, controller_id))
    }

    /// Write back a target read earlier in this or another transaction.
    pub fn update_target(&mut self, target: &mut Target) -> StateResult<()> {
        let key = target.table_key();
        let mut table = self.txn.open_table(TARGETS).map_err(map_err!(Table))?;
        let stored: Target =
            get_by_key(&table, &key)?.ok_or_else(|| StateError::NotFound(format!("target {key}")))?;
        check_version("target", &key, target.version, stored.version)?;
        target.version += 1;
        let value = encode(target)?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// All targets matching the predicate, in key order.
    pub fn find_targets(&self, predicate: &Predicate<TargetField>) -> StateResult<Vec<Target>> {
        let table = self.txn.open_table(TARGETS).map_err(map_err!(Table))?;
        Ok(scan(&table, usize::MAX, |t: &Target| predicate.matches(t))?.items)
    }

    /// Apply `change` to every matching target; returns the updated targets.
    pub fn update_targets_where(
        &mut self,
        predicate: &Predicate<TargetField>,
        mut change: impl FnMut(&mut Target),
    ) -> StateResult<Vec<Target>> {
        let mut table = self.txn.open_table(TARGETS).map_err(map_err!(Table))?;
        let mut targets = scan(&table, usize::MAX, |t: &Target| predicate.matches(t))?.items;
        for target in &mut targets {
            change(target);
            target.version += 1;
            let value = encode(target)?;
            table
                .insert(target.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        Ok(targets)
    }

    // ── Distribution sets ──────────────────────────────────────────

    /// Insert or replace a distribution set.
    pub fn put_distribution_set(&mut self, set: &DistributionSet) -> StateResult<()> {
        let value = encode(set)?;
        let mut table = self
            .txn
            .open_table(DISTRIBUTION_SETS)
            .map_err(map_err!(Table))?;
        table
            .insert(set.id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Get a distribution set by id.
    pub fn get_distribution_set(&self, id: DistributionSetId) -> StateResult<Option<DistributionSet>> {
        let table = self
            .txn
            .open_table(DISTRIBUTION_SETS)
            .map_err(map_err!(Table))?;
        get_by_id(&table, id)
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Persist a new action, assigning its id.
    pub fn insert_action(&mut self, action: &mut Action) -> StateResult<()> {
        action.id = self.next_id(SEQ_ACTION)?;
        let value = encode(action)?;
        let mut table = self.txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        table
            .insert(action.id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Get an action by id.
    pub fn get_action(&self, id: ActionId) -> StateResult<Option<Action>> {
        let table = self.txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        get_by_id(&table, id)
    }

    /// Write back an action read earlier in this or another transaction.
    pub fn update_action(&mut self, action: &mut Action) -> StateResult<()> {
        let mut table = self.txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let stored: Action = get_by_id(&table, action.id)?
            .ok_or_else(|| StateError::NotFound(format!("action {}", action.id)))?;
        check_version("action", &action.id.to_string(), action.version, stored.version)?;
        action.version += 1;
        let value = encode(action)?;
        table
            .insert(action.id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Up to `limit` matching actions in id order, plus the total match count.
    pub fn find_actions(
        &self,
        predicate: &Predicate<ActionField>,
        limit: usize,
    ) -> StateResult<Page<Action>> {
        let table = self.txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        scan(&table, limit, |a: &Action| predicate.matches(a))
    }

    /// Apply `change` to every matching action; returns the updated actions.
    pub fn update_actions_where(
        &mut self,
        predicate: &Predicate<ActionField>,
        mut change: impl FnMut(&mut Action),
    ) -> StateResult<Vec<Action>> {
        let mut table = self.txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let mut actions = scan(&table, usize::MAX, |a: &Action| predicate.matches(a))?.items;
        for action in &mut actions {
            change(action);
            action.version += 1;
            let value = encode(action)?;
            table
                .insert(action.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        Ok(actions)
    }

    /// Delete at most `limit` matching actions together with their status
    /// history. Returns the number of actions deleted.
    pub fn delete_actions_where(
        &mut self,
        predicate: &Predicate<ActionField>,
        limit: usize,
    ) -> StateResult<u64> {
        let ids: Vec<ActionId> = {
            let table = self.txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            scan(&table, limit, |a: &Action| predicate.matches(a))?
                .items
                .iter()
                .map(|a| a.id)
                .collect()
        };
        {
            let mut table = self.txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            for id in &ids {
                table.remove(*id).map_err(map_err!(Write))?;
            }
        }
        let mut table = self.txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        for id in &ids {
            let keys: Vec<String> = status_range(&table, *id)?
                .iter()
                .map(ActionStatus::table_key)
                .collect();
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        debug!(deleted = ids.len(), limit, "actions deleted");
        Ok(ids.len() as u64)
    }

    // ── Action status ──────────────────────────────────────────────

    /// Append a status history entry, assigning its id.
    pub fn insert_action_status(&mut self, status: &mut ActionStatus) -> StateResult<()> {
        status.id = self.next_id(SEQ_ACTION_STATUS)?;
        let key = status.table_key();
        let value = encode(status)?;
        let mut table = self.txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Status history of an action, oldest first.
    pub fn list_action_status(&self, action_id: ActionId) -> StateResult<Vec<ActionStatus>> {
        let table = self.txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        status_range(&table, action_id)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Persist a new rollout, assigning its id.
    pub fn insert_rollout(&mut self, rollout: &mut Rollout) -> StateResult<()> {
        rollout.id = self.next_id(SEQ_ROLLOUT)?;
        let value = encode(rollout)?;
        let mut table = self.txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        table
            .insert(rollout.id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Get a rollout by id.
    pub fn get_rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        let table = self.txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        get_by_id(&table, id)
    }

    /// Write back a rollout read earlier in this or another transaction.
    pub fn update_rollout(&mut self, rollout: &mut Rollout) -> StateResult<()> {
        let mut table = self.txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let stored: Rollout = get_by_id(&table, rollout.id)?
            .ok_or_else(|| StateError::NotFound(format!("rollout {}", rollout.id)))?;
        check_version("rollout", &rollout.id.to_string(), rollout.version, stored.version)?;
        rollout.version += 1;
        let value = encode(rollout)?;
        table
            .insert(rollout.id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Persist a rollout group, assigning an id if unset.
    pub fn put_rollout_group(&mut self, group: &mut RolloutGroup) -> StateResult<()> {
        if group.id == 0 {
            group.id = self.next_id(SEQ_ROLLOUT_GROUP)?;
        }
        let value = encode(group)?;
        let mut table = self.txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        table
            .insert(group.id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Groups of a rollout in creation order.
    pub fn list_rollout_groups(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        let table = self.txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        let page = scan(&table, usize::MAX, |g: &RolloutGroup| g.rollout_id == rollout_id)?;
        Ok(page.items)
    }
}

// ── Table helpers ──────────────────────────────────────────────────

fn encode<T: Serialize>(record: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn check_version(entity: &'static str, id: &str, expected: u64, found: u64) -> StateResult<()> {
    if expected != found {
        debug!(entity, id, expected, found, "stale write rejected");
        return Err(StateError::Conflict {
            entity,
            id: id.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn get_by_id<T, R>(table: &R, id: u64) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn get_by_key<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Decode every record in key order, keeping the first `limit` accepted ones
/// and counting all accepted ones.
fn scan<K, T, R>(table: &R, limit: usize, mut accept: impl FnMut(&T) -> bool) -> StateResult<Page<T>>
where
    K: redb::Key + 'static,
    T: DeserializeOwned,
    R: ReadableTable<K, &'static [u8]>,
{
    let mut page = Page::empty();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: T = decode(value.value())?;
        if accept(&record) {
            page.total += 1;
            if page.items.len() < limit {
                page.items.push(record);
            }
        }
    }
    Ok(page)
}

fn status_range<R>(table: &R, action_id: ActionId) -> StateResult<Vec<ActionStatus>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    // ';' sorts directly after ':', bounding exactly this action's keys.
    let start = format!("{action_id:020}:");
    let end = format!("{action_id:020};");
    let mut results = Vec::new();
    for entry in table
        .range(start.as_str()..end.as_str())
        .map_err(map_err!(Read))?
    {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}
