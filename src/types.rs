use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Sequence number of an event within its aggregate instance. Starts from 1.
pub type SequenceNumber = i64;

/// Global ordering key of an event across every instance and aggregate.
///
/// The `global` part is shared by all events committed in the same push
/// transaction; `in_tx_order` disambiguates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub global: Decimal,
    pub in_tx_order: i32,
}

impl Position {
    /// The zero cursor: strictly less than the position of any stored event.
    pub const MIN: Position = Position {
        global: Decimal::ZERO,
        in_tx_order: 0,
    };

    pub const fn new(global: Decimal, in_tx_order: i32) -> Self {
        Self { global, in_tx_order }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.global
            .cmp(&other.global)
            .then(self.in_tx_order.cmp(&other.in_tx_order))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.global, self.in_tx_order)
    }
}

/// Identifies the aggregate an event belongs to, together with the resource
/// owner recorded on every event emitted for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub instance_id: String,
    pub type_: String,
    pub id: String,
    pub resource_owner: String,
}

impl Aggregate {
    pub fn new(
        instance_id: impl Into<String>,
        type_: impl Into<String>,
        id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            type_: type_.into(),
            id: id.into(),
            resource_owner: resource_owner.into(),
        }
    }

    /// An aggregate owned by the instance itself.
    pub fn instance_owned(instance_id: impl Into<String>, type_: impl Into<String>, id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        let resource_owner = instance_id.clone();
        Self {
            instance_id,
            type_: type_.into(),
            id: id.into(),
            resource_owner,
        }
    }
}

/// Summary of an aggregate after a command, returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDetails {
    pub sequence: SequenceNumber,
    pub event_date: DateTime<Utc>,
    pub resource_owner: String,
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::Position;

    #[test]
    fn position_orders_by_global_then_in_tx_order() {
        let a = Position::new(Decimal::new(100, 2), 0);
        let b = Position::new(Decimal::new(100, 2), 1);
        let c = Position::new(Decimal::new(101, 2), 0);

        assert!(a < b);
        assert!(b < c);
        assert!(Position::MIN < a);
    }

    #[test]
    fn position_min_is_smallest() {
        let smallest_real = Position::new(Decimal::new(1, 9), 0);
        assert!(Position::MIN < smallest_real);
    }
}
