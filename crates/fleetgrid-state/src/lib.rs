//! fleetgrid-state: embedded state store for fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for targets, distribution sets, actions with their status
//! history, rollouts and rollout groups.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{tenant}/{controller_id}`, `{action_id}:{status_id}`)
//! keep related records in contiguous key ranges.
//!
//! Reads go through [`StateStore`] and see committed data only. Writes go
//! through a [`WriteTxn`] unit of work, filtered by composable
//! [`Predicate`]s and guarded by optimistic record versions.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across threads and async tasks.

pub mod error;
pub mod query;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use query::{Filterable, Predicate, Value};
pub use store::{StateStore, WriteTxn};
pub use types::*;
