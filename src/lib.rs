//! Event-sourced core of a multi-tenant identity and access management
//! platform.
//!
//! Every state change is an immutable event in an append-only,
//! instance-scoped log ([`store`]); commands ([`command`]) rehydrate write
//! models ([`writemodel`]) from that log, check invariants and permissions,
//! and push new events atomically. Read models are materialized
//! asynchronously by the [`projection`] engine and served by the [`query`]
//! layer, including the org → instance → built-in [`policy`] resolution.

pub mod authz;
pub mod clock;
pub mod command;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod ids;
pub mod notification;
pub mod policy;
pub mod projection;
pub mod query;
pub mod store;
pub mod types;
pub mod writemodel;

mod logstore;

pub use command::{Commands, Context};
pub use error::Error;
pub use event::{EventCommand, StoredEvent};
pub use query::Queries;
pub use store::postgres::{PgEventStore, PgEventStoreBuilder};
pub use store::{EventFilter, Eventstore};
pub use types::{Aggregate, ObjectDetails, Position, SequenceNumber};
