//! Projection engine: registered handlers consume the event log in order,
//! advance a durable cursor, and materialize the read tables.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use typed_builder::TypedBuilder;

use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::EventFilter;
use crate::types::Position;

mod engine;
mod state;

mod authn_keys;
mod custom_texts;
mod login_names;
mod org_domains;
mod org_members;
mod orgs;
mod personal_access_tokens;
mod policies;
mod user_metadata;
mod users;

pub use engine::ProjectionEngine;
pub use state::{ProjectionState, ProjectionStatus};

pub use authn_keys::AuthnKeysProjection;
pub use custom_texts::CustomTextsProjection;
pub use login_names::LoginNamesProjection;
pub use org_domains::OrgDomainsProjection;
pub use org_members::OrgMembersProjection;
pub use orgs::OrgsProjection;
pub use personal_access_tokens::PersonalAccessTokensProjection;
pub use policies::{
    DomainPoliciesProjection, LockoutPoliciesProjection, LoginPoliciesProjection, NotificationPoliciesProjection,
    PasswordComplexityPoliciesProjection, PrivacyPoliciesProjection, SecurityPoliciesProjection,
};
pub use user_metadata::UserMetadataProjection;
pub use users::UsersProjection;

/// Static description of one projection.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ProjectionConfig {
    pub name: &'static str,
    /// Tables owned (and truncated on rebuild) by this projection.
    pub tables: Vec<&'static str>,
    #[builder(default)]
    pub aggregate_types: Vec<&'static str>,
    #[builder(default)]
    pub event_types: Vec<&'static str>,
    #[builder(default = 200)]
    pub batch_size: u32,
    #[builder(default = Duration::from_secs(1))]
    pub poll_interval: Duration,
    #[builder(default = 10)]
    pub max_errors: u32,
    /// Acquire an advisory lock per batch, for multi-replica deployments.
    #[builder(default = false)]
    pub enable_locking: bool,
    #[builder(default = false)]
    pub rebuild_on_start: bool,
    /// Upstream projections whose tables this one references; started
    /// first.
    #[builder(default)]
    pub requires: Vec<&'static str>,
}

impl ProjectionConfig {
    /// The event-store filter for everything past the given cursor.
    pub(crate) fn filter_after(&self, position: Position) -> EventFilter {
        EventFilter::builder()
            .aggregate_types(self.aggregate_types.iter().map(|t| (*t).to_owned()).collect())
            .event_types(self.event_types.iter().map(|t| (*t).to_owned()).collect())
            .position_after(position)
            .limit(self.batch_size)
            .build()
    }
}

/// A value bound into a projection-table statement.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    OptText(Option<String>),
    Bool(bool),
    Int(i64),
    Timestamp(DateTime<Utc>),
    OptTimestamp(Option<DateTime<Utc>>),
    Numeric(Decimal),
    Json(serde_json::Value),
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        Self::OptText(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Option<DateTime<Utc>>> for SqlValue {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        Self::OptTimestamp(value)
    }
}

impl From<Decimal> for SqlValue {
    fn from(value: Decimal) -> Self {
        Self::Numeric(value)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// One named column with its value.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: &'static str,
    pub value: SqlValue,
}

impl Column {
    pub fn new(name: &'static str, value: impl Into<SqlValue>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

/// A declarative write against a projection table, keyed by primary key so
/// replays are idempotent.
#[derive(Debug, Clone)]
pub enum RowOp {
    Upsert {
        table: &'static str,
        keys: Vec<Column>,
        columns: Vec<Column>,
    },
    Delete {
        table: &'static str,
        keys: Vec<Column>,
    },
}

impl RowOp {
    pub(crate) fn render(&self) -> (String, Vec<&SqlValue>) {
        match self {
            Self::Upsert { table, keys, columns } => {
                let all: Vec<&Column> = keys.iter().chain(columns.iter()).collect();
                let names: Vec<&str> = all.iter().map(|column| column.name).collect();
                let placeholders: Vec<String> = (1..=all.len()).map(|i| format!("${i}")).collect();
                let key_names: Vec<&str> = keys.iter().map(|column| column.name).collect();

                let conflict_action = if columns.is_empty() {
                    "DO NOTHING".to_owned()
                } else {
                    let updates: Vec<String> = columns
                        .iter()
                        .map(|column| format!("{0} = EXCLUDED.{0}", column.name))
                        .collect();
                    format!("DO UPDATE SET {}", updates.join(", "))
                };

                let sql = format!(
                    "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) {conflict_action}",
                    names.join(", "),
                    placeholders.join(", "),
                    key_names.join(", "),
                );
                (sql, all.into_iter().map(|column| &column.value).collect())
            }
            Self::Delete { table, keys } => {
                let conditions: Vec<String> = keys
                    .iter()
                    .enumerate()
                    .map(|(i, column)| format!("{} = ${}", column.name, i + 1))
                    .collect();
                let sql = format!("DELETE FROM {table} WHERE {}", conditions.join(" AND "));
                (sql, keys.iter().map(|column| &column.value).collect())
            }
        }
    }

    pub(crate) async fn execute(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        let (sql, values) = self.render();
        let mut query = sqlx::query(&sql);
        for value in values {
            query = match value {
                SqlValue::Text(v) => query.bind(v),
                SqlValue::OptText(v) => query.bind(v),
                SqlValue::Bool(v) => query.bind(v),
                SqlValue::Int(v) => query.bind(v),
                SqlValue::Timestamp(v) => query.bind(v),
                SqlValue::OptTimestamp(v) => query.bind(v),
                SqlValue::Numeric(v) => query.bind(v),
                SqlValue::Json(v) => query.bind(v),
            };
        }
        let _ = query.execute(conn).await?;
        Ok(())
    }
}

/// Handler that describes its writes as [`RowOp`]s; the engine executes
/// them. Idempotent by construction.
#[async_trait]
pub trait DeclarativeHandler: Send + Sync {
    /// One-time setup: create tables and indexes.
    async fn init(&self, pool: &PgPool) -> Result<(), Error>;

    /// Translates one event into projection-table writes.
    fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error>;
}

/// Handler that performs its own writes on the batch transaction. Must be
/// idempotent under replay.
#[async_trait]
pub trait ImperativeHandler: Send + Sync {
    async fn init(&self, pool: &PgPool) -> Result<(), Error>;

    async fn reduce(&self, event: &StoredEvent, conn: &mut PgConnection) -> Result<(), Error>;
}

/// The two handler variants a projection registers as. A projection uses
/// exactly one variant; they are never mixed within a handler.
pub enum Handler {
    Declarative(Box<dyn DeclarativeHandler>),
    Imperative(Box<dyn ImperativeHandler>),
}

impl Handler {
    pub(crate) async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        match self {
            Self::Declarative(handler) => handler.init(pool).await,
            Self::Imperative(handler) => handler.init(pool).await,
        }
    }

    pub(crate) async fn reduce(&self, event: &StoredEvent, conn: &mut PgConnection) -> Result<(), Error> {
        match self {
            Self::Declarative(handler) => {
                for op in handler.project(event)? {
                    op.execute(conn).await.map_err(crate::store::StoreError::Sqlx)?;
                }
                Ok(())
            }
            Self::Imperative(handler) => handler.reduce(event, conn).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Column, RowOp};

    #[test]
    fn renders_upsert_with_conflict_update() {
        let op = RowOp::Upsert {
            table: "orgs",
            keys: vec![Column::new("instance_id", "inst1"), Column::new("id", "org1")],
            columns: vec![Column::new("name", "Acme"), Column::new("state", "active")],
        };

        let (sql, values) = op.render();
        assert_eq!(
            sql,
            "INSERT INTO orgs (instance_id, id, name, state) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (instance_id, id) DO UPDATE SET name = EXCLUDED.name, state = EXCLUDED.state"
        );
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn renders_keys_only_upsert_as_do_nothing() {
        let op = RowOp::Upsert {
            table: "seen",
            keys: vec![Column::new("instance_id", "inst1")],
            columns: vec![],
        };
        let (sql, _) = op.render();
        assert!(sql.ends_with("ON CONFLICT (instance_id) DO NOTHING"));
    }

    #[test]
    fn renders_delete_by_keys() {
        let op = RowOp::Delete {
            table: "orgs",
            keys: vec![Column::new("instance_id", "inst1"), Column::new("id", "org1")],
        };
        let (sql, values) = op.render();
        assert_eq!(sql, "DELETE FROM orgs WHERE instance_id = $1 AND id = $2");
        assert_eq!(values.len(), 2);
    }
}
