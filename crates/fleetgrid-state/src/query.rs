//! Composable record predicates.
//!
//! A [`Predicate`] is a plain value (serializable, comparable) built from
//! field comparisons and boolean combinators. The store evaluates it against
//! each record while scanning a table, so the same filter drives paginated
//! reads, batched updates and bounded deletes.
//!
//! ```
//! use fleetgrid_state::{ActionField, ActionState, Predicate};
//!
//! let scheduled_in_rollout = Predicate::eq(ActionField::RolloutId, 7u64)
//!     .and(Predicate::eq(ActionField::Status, ActionState::Scheduled));
//! # let _ = scheduled_in_rollout;
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{ActionState, TargetUpdateStatus};

/// A scalar field value as seen by a predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(u64),
    Str(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(u64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Option<u64>> for Value {
    fn from(v: Option<u64>) -> Self {
        v.map_or(Value::Null, Value::Int)
    }
}

impl From<ActionState> for Value {
    fn from(v: ActionState) -> Self {
        Value::Str(v.as_str().to_string())
    }
}

impl From<TargetUpdateStatus> for Value {
    fn from(v: TargetUpdateStatus) -> Self {
        Value::Str(v.as_str().to_string())
    }
}

/// A record whose fields a [`Predicate`] can inspect.
pub trait Filterable {
    type Field;

    fn field(&self, field: &Self::Field) -> Value;
}

/// Boolean filter over the fields `F` of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate<F> {
    /// Matches every record.
    All,
    Eq(F, Value),
    Ne(F, Value),
    In(F, Vec<Value>),
    IsNull(F),
    /// Integer strictly-less-than; never matches non-integer values.
    Lt(F, Value),
    And(Vec<Predicate<F>>),
    Or(Vec<Predicate<F>>),
    Not(Box<Predicate<F>>),
}

impl<F> Predicate<F> {
    pub fn eq(field: F, value: impl Into<Value>) -> Self {
        Predicate::Eq(field, value.into())
    }

    pub fn ne(field: F, value: impl Into<Value>) -> Self {
        Predicate::Ne(field, value.into())
    }

    pub fn is_in<V: Into<Value>>(field: F, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In(field, values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(field: F) -> Self {
        Predicate::IsNull(field)
    }

    pub fn lt(field: F, value: impl Into<Value>) -> Self {
        Predicate::Lt(field, value.into())
    }

    /// Conjunction; nested `And`s are flattened.
    pub fn and(self, other: Predicate<F>) -> Self {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::And(mut left), Predicate::And(right)) => {
                left.extend(right);
                Predicate::And(left)
            }
            (Predicate::And(mut left), p) => {
                left.push(p);
                Predicate::And(left)
            }
            (p, Predicate::And(mut right)) => {
                right.insert(0, p);
                Predicate::And(right)
            }
            (left, right) => Predicate::And(vec![left, right]),
        }
    }

    /// Disjunction; nested `Or`s are flattened.
    pub fn or(self, other: Predicate<F>) -> Self {
        match (self, other) {
            (Predicate::Or(mut left), Predicate::Or(right)) => {
                left.extend(right);
                Predicate::Or(left)
            }
            (Predicate::Or(mut left), p) => {
                left.push(p);
                Predicate::Or(left)
            }
            (left, right) => Predicate::Or(vec![left, right]),
        }
    }

    /// Evaluate against one record.
    pub fn matches<R>(&self, record: &R) -> bool
    where
        R: Filterable<Field = F>,
    {
        match self {
            Predicate::All => true,
            Predicate::Eq(f, v) => &record.field(f) == v,
            Predicate::Ne(f, v) => &record.field(f) != v,
            Predicate::In(f, values) => {
                let actual = record.field(f);
                values.contains(&actual)
            }
            Predicate::IsNull(f) => record.field(f) == Value::Null,
            Predicate::Lt(f, v) => match (record.field(f), v) {
                (Value::Int(actual), Value::Int(bound)) => actual < *bound,
                _ => false,
            },
            Predicate::And(parts) => parts.iter().all(|p| p.matches(record)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(record)),
            Predicate::Not(inner) => !inner.matches(record),
        }
    }
}

impl<F> std::ops::Not for Predicate<F> {
    type Output = Predicate<F>;

    fn not(self) -> Self::Output {
        match self {
            Predicate::Not(inner) => *inner,
            p => Predicate::Not(Box::new(p)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Target, TargetField};

    fn target(controller_id: &str, status: TargetUpdateStatus, assigned: Option<u64>) -> Target {
        Target {
            update_status: status,
            assigned_distribution_set: assigned,
            ..Target::new("default", controller_id)
        }
    }

    #[test]
    fn eq_and_ne() {
        let t = target("a", TargetUpdateStatus::Pending, Some(3));
        assert!(Predicate::eq(TargetField::ControllerId, "a").matches(&t));
        assert!(Predicate::ne(TargetField::AssignedDistributionSet, 7u64).matches(&t));
        assert!(!Predicate::ne(TargetField::AssignedDistributionSet, 3u64).matches(&t));
    }

    #[test]
    fn ne_matches_null_field() {
        // A target without any assignment is "not assigned set 7".
        let t = target("a", TargetUpdateStatus::Registered, None);
        assert!(Predicate::ne(TargetField::AssignedDistributionSet, 7u64).matches(&t));
        assert!(Predicate::is_null(TargetField::AssignedDistributionSet).matches(&t));
    }

    #[test]
    fn in_set() {
        let t = target("b", TargetUpdateStatus::InSync, None);
        let p = Predicate::is_in(TargetField::ControllerId, ["a", "b"]);
        assert!(p.matches(&t));
        let p = Predicate::is_in(TargetField::ControllerId, ["x"]);
        assert!(!p.matches(&t));
    }

    #[test]
    fn combinators_flatten() {
        let p = Predicate::eq(TargetField::Tenant, "default")
            .and(Predicate::eq(TargetField::ControllerId, "a"))
            .and(Predicate::ne(TargetField::UpdateStatus, TargetUpdateStatus::Pending));
        match &p {
            Predicate::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }

        let all_and = Predicate::All.and(Predicate::eq(TargetField::Id, 1u64));
        assert_eq!(all_and, Predicate::eq(TargetField::Id, 1u64));
    }

    #[test]
    fn or_and_not() {
        let t = target("c", TargetUpdateStatus::Error, None);
        let p = Predicate::eq(TargetField::UpdateStatus, TargetUpdateStatus::InSync)
            .or(Predicate::eq(TargetField::UpdateStatus, TargetUpdateStatus::Error));
        assert!(p.matches(&t));
        assert!(!(!p.clone()).matches(&t));
        assert_eq!(!!p.clone(), p);
    }

    #[test]
    fn lt_only_compares_integers() {
        let t = target("d", TargetUpdateStatus::InSync, Some(4));
        assert!(Predicate::lt(TargetField::AssignedDistributionSet, 5u64).matches(&t));
        assert!(!Predicate::lt(TargetField::AssignedDistributionSet, 4u64).matches(&t));
        assert!(!Predicate::lt(TargetField::ControllerId, 4u64).matches(&t));
    }

    #[test]
    fn predicate_serializes() {
        let p = Predicate::eq(TargetField::UpdateStatus, TargetUpdateStatus::Registered)
            .and(Predicate::is_in(TargetField::ControllerId, ["a", "b"]));
        let json = serde_json::to_string(&p).unwrap();
        let back: Predicate<TargetField> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
