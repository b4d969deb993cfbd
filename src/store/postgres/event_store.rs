use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use sqlx::{Pool, Postgres, Row, Transaction};

use crate::event::{EventCommand, StoredEvent};
use crate::store::{
    EventBroadcaster, EventFilter, EventSubscription, Eventstore, ExpectedVersion, Reducer, StoreError,
    MAX_PUSH_RETRIES,
};
use crate::types::{Position, SequenceNumber};

use super::statements::Statements;

/// Postgres implementation of the [`Eventstore`].
///
/// The store is protected by an [`Arc`] that allows it to be cloneable still
/// having the same memory reference.
pub struct PgEventStore {
    pub(super) inner: Arc<InnerPgEventStore>,
}

pub(super) struct InnerPgEventStore {
    pub(super) pool: Pool<Postgres>,
    pub(super) statements: Statements,
    pub(super) broadcaster: EventBroadcaster,
}

/// Event row representation on the event store.
#[derive(sqlx::FromRow, Debug)]
struct DbEvent {
    instance_id: String,
    aggregate_type: String,
    aggregate_id: String,
    aggregate_version: i64,
    event_type: String,
    revision: i16,
    position: Decimal,
    in_tx_order: i32,
    creator: String,
    owner: String,
    created_at: DateTime<Utc>,
    payload: Option<serde_json::Value>,
}

impl DbEvent {
    fn into_stored_event(self) -> StoredEvent {
        StoredEvent {
            instance_id: self.instance_id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            aggregate_version: self.aggregate_version,
            event_type: self.event_type,
            revision: self.revision,
            position: Position::new(self.position, self.in_tx_order),
            creator: self.creator,
            owner: self.owner,
            created_at: self.created_at,
            payload: self.payload.unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Bind values collected while rendering an [`EventFilter`] into SQL.
enum Bind {
    Text(String),
    TextArray(Vec<String>),
    Timestamp(DateTime<Utc>),
    Numeric(Decimal),
    Int(i32),
}

fn render_filter(prefix: &str, filter: &EventFilter) -> (String, Vec<Bind>) {
    let mut sql = String::from(prefix);
    let mut binds: Vec<Bind> = Vec::new();
    let mut conditions: Vec<String> = Vec::new();

    let mut placeholder = |binds: &mut Vec<Bind>, bind: Bind| {
        binds.push(bind);
        format!("${}", binds.len())
    };

    if let Some(instance_id) = &filter.instance_id {
        let p = placeholder(&mut binds, Bind::Text(instance_id.clone()));
        conditions.push(format!("instance_id = {p}"));
    }
    if !filter.aggregate_types.is_empty() {
        let p = placeholder(&mut binds, Bind::TextArray(filter.aggregate_types.clone()));
        conditions.push(format!("aggregate_type = ANY({p})"));
    }
    if !filter.aggregate_ids.is_empty() {
        let p = placeholder(&mut binds, Bind::TextArray(filter.aggregate_ids.clone()));
        conditions.push(format!("aggregate_id = ANY({p})"));
    }
    if !filter.event_types.is_empty() {
        let p = placeholder(&mut binds, Bind::TextArray(filter.event_types.clone()));
        conditions.push(format!("event_type = ANY({p})"));
    }
    if let Some(owner) = &filter.owner {
        let p = placeholder(&mut binds, Bind::Text(owner.clone()));
        conditions.push(format!("owner = {p}"));
    }
    if let Some(creator) = &filter.creator {
        let p = placeholder(&mut binds, Bind::Text(creator.clone()));
        conditions.push(format!("creator = {p}"));
    }
    if let Some(after) = filter.created_after {
        let p = placeholder(&mut binds, Bind::Timestamp(after));
        conditions.push(format!("created_at >= {p}"));
    }
    if let Some(before) = filter.created_before {
        let p = placeholder(&mut binds, Bind::Timestamp(before));
        conditions.push(format!("created_at <= {p}"));
    }
    if let Some(position) = filter.position_after {
        let p_global = placeholder(&mut binds, Bind::Numeric(position.global));
        let p_order = placeholder(&mut binds, Bind::Int(position.in_tx_order));
        conditions.push(format!(
            "(position > {p_global} OR (position = {p_global} AND in_tx_order > {p_order}))"
        ));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if filter.descending {
        sql.push_str(" ORDER BY position DESC, in_tx_order DESC");
    } else {
        sql.push_str(" ORDER BY position ASC, in_tx_order ASC");
    }

    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    (sql, binds)
}

fn bind_all<'q>(
    mut query: sqlx::query::QueryAs<'q, Postgres, DbEvent, sqlx::postgres::PgArguments>,
    binds: &'q [Bind],
) -> sqlx::query::QueryAs<'q, Postgres, DbEvent, sqlx::postgres::PgArguments> {
    for bind in binds {
        query = match bind {
            Bind::Text(value) => query.bind(value),
            Bind::TextArray(value) => query.bind(value),
            Bind::Timestamp(value) => query.bind(value),
            Bind::Numeric(value) => query.bind(value),
            Bind::Int(value) => query.bind(value),
        };
    }
    query
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

type AggregateKey = (String, String, String);

impl PgEventStore {
    pub(super) fn new(inner: InnerPgEventStore) -> Self {
        Self { inner: Arc::new(inner) }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.inner.pool
    }

    /// Single attempt at persisting the batch. Duplicate-key errors bubble
    /// up for the caller to classify.
    async fn try_push(
        &self,
        commands: &[EventCommand],
        expected: &[ExpectedVersion],
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let mut transaction: Transaction<Postgres> = self.inner.pool.begin().await?;

        let row = sqlx::query(self.inner.statements.tx_context())
            .fetch_one(&mut *transaction)
            .await?;
        let created_at: DateTime<Utc> = row.get(0);
        let global: Decimal = row.get(1);

        // Current version per distinct aggregate, checked against the
        // caller's expectations before anything is written.
        let mut versions: HashMap<AggregateKey, SequenceNumber> = HashMap::new();
        for command in commands {
            let key = (
                command.aggregate.instance_id.clone(),
                command.aggregate.type_.clone(),
                command.aggregate.id.clone(),
            );
            if versions.contains_key(&key) {
                continue;
            }
            let current: i64 = sqlx::query_scalar(self.inner.statements.current_version())
                .bind(&key.0)
                .bind(&key.1)
                .bind(&key.2)
                .fetch_one(&mut *transaction)
                .await?;
            versions.insert(key, current);
        }

        for check in expected {
            let key = (
                check.aggregate.instance_id.clone(),
                check.aggregate.type_.clone(),
                check.aggregate.id.clone(),
            );
            let current = match versions.get(&key) {
                Some(current) => *current,
                None => sqlx::query_scalar(self.inner.statements.current_version())
                    .bind(&key.0)
                    .bind(&key.1)
                    .bind(&key.2)
                    .fetch_one(&mut *transaction)
                    .await?,
            };
            if current != check.version {
                return Err(StoreError::ConcurrencyConflict {
                    aggregate_id: check.aggregate.id.clone(),
                    expected: check.version,
                    current,
                });
            }
        }

        let mut events: Vec<StoredEvent> = Vec::with_capacity(commands.len());
        for (in_tx_order, command) in commands.iter().enumerate() {
            let key = (
                command.aggregate.instance_id.clone(),
                command.aggregate.type_.clone(),
                command.aggregate.id.clone(),
            );
            let version = versions
                .get_mut(&key)
                .map(|version| {
                    *version += 1;
                    *version
                })
                .unwrap_or(1);

            let event = StoredEvent {
                instance_id: command.aggregate.instance_id.clone(),
                aggregate_type: command.aggregate.type_.clone(),
                aggregate_id: command.aggregate.id.clone(),
                aggregate_version: version,
                event_type: command.event_type.clone(),
                revision: command.revision,
                position: Position::new(global, in_tx_order as i32),
                creator: command.creator.clone(),
                owner: command.aggregate.resource_owner.clone(),
                created_at,
                payload: command.payload.clone().unwrap_or(serde_json::Value::Null),
            };

            let _ = sqlx::query(self.inner.statements.insert())
                .bind(&event.instance_id)
                .bind(&event.aggregate_type)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(&event.event_type)
                .bind(event.revision)
                .bind(event.position.global)
                .bind(event.position.in_tx_order)
                .bind(&event.creator)
                .bind(&event.owner)
                .bind(event.created_at)
                .bind(&event.payload)
                .execute(&mut *transaction)
                .await?;

            events.push(event);
        }

        transaction.commit().await?;
        Ok(events)
    }

    #[tracing::instrument(skip_all, fields(commands = commands.len()), err)]
    async fn push_internal(
        &self,
        commands: Vec<EventCommand>,
        expected: Vec<ExpectedVersion>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let started = std::time::Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.try_push(&commands, &expected).await {
                Ok(events) => {
                    self.inner.broadcaster.publish(&events);
                    if let Some(event) = events.first() {
                        crate::logstore::record_execution(
                            &self.inner.pool,
                            &event.instance_id,
                            "eventstore.push",
                            started.elapsed(),
                            serde_json::json!({ "events": events.len(), "attempts": attempts }),
                        )
                        .await;
                    }
                    return Ok(events);
                }
                Err(StoreError::Sqlx(err)) if is_unique_violation(&err) => {
                    // A lost race on the version constraint is a concurrency
                    // conflict when the caller pinned versions; otherwise the
                    // batch is retried with regenerated values.
                    if !expected.is_empty() {
                        let check = &expected[0];
                        let current: i64 = sqlx::query_scalar(self.inner.statements.current_version())
                            .bind(&check.aggregate.instance_id)
                            .bind(&check.aggregate.type_)
                            .bind(&check.aggregate.id)
                            .fetch_one(&self.inner.pool)
                            .await?;
                        return Err(StoreError::ConcurrencyConflict {
                            aggregate_id: check.aggregate.id.clone(),
                            expected: check.version,
                            current,
                        });
                    }
                    if attempts >= MAX_PUSH_RETRIES {
                        tracing::error!(attempts, "push kept colliding on unique constraints");
                        return Err(StoreError::PushRetriesExhausted { attempts });
                    }
                    tracing::warn!(attempts, "duplicate key on push, regenerating positions");
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[async_trait]
impl Eventstore for PgEventStore {
    async fn push(&self, commands: Vec<EventCommand>) -> Result<Vec<StoredEvent>, StoreError> {
        self.push_internal(commands, vec![]).await
    }

    async fn push_with_concurrency_check(
        &self,
        commands: Vec<EventCommand>,
        expected: Vec<ExpectedVersion>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.push_internal(commands, expected).await
    }

    async fn filter(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, StoreError> {
        let (sql, binds) = render_filter(self.inner.statements.select_prefix(), filter);
        let rows: Vec<DbEvent> = bind_all(sqlx::query_as::<_, DbEvent>(&sql), &binds)
            .fetch_all(&self.inner.pool)
            .await?;
        Ok(rows.into_iter().map(DbEvent::into_stored_event).collect())
    }

    async fn filter_to_reducer(&self, filter: &EventFilter, reducer: &mut dyn Reducer) -> Result<(), StoreError> {
        let (sql, binds) = render_filter(self.inner.statements.select_prefix(), filter);
        let mut stream = bind_all(sqlx::query_as::<_, DbEvent>(&sql), &binds).fetch(&self.inner.pool);

        while let Some(row) = stream.next().await {
            let event = row?.into_stored_event();
            reducer.reduce(&event)?;
        }
        Ok(())
    }

    async fn latest_position(&self, instance_id: Option<&str>) -> Result<Position, StoreError> {
        let row = match instance_id {
            Some(instance_id) => {
                sqlx::query(self.inner.statements.latest_position_instance())
                    .bind(instance_id)
                    .fetch_optional(&self.inner.pool)
                    .await?
            }
            None => {
                sqlx::query(self.inner.statements.latest_position())
                    .fetch_optional(&self.inner.pool)
                    .await?
            }
        };

        Ok(row
            .map(|row| Position::new(row.get(0), row.get(1)))
            .unwrap_or(Position::MIN))
    }

    async fn latest_event(&self, filter: &EventFilter) -> Result<Option<StoredEvent>, StoreError> {
        let mut filter = filter.clone();
        filter.descending = true;
        filter.limit = Some(1);
        Ok(self.filter(&filter).await?.into_iter().next())
    }

    async fn distinct_instance_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(self.inner.statements.distinct_instance_ids())
            .fetch_all(&self.inner.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    fn subscribe(&self) -> EventSubscription {
        self.inner.broadcaster.subscribe()
    }

    async fn purge_instance(&self, instance_id: &str) -> Result<(), StoreError> {
        let _ = sqlx::query(self.inner.statements.purge_instance())
            .bind(instance_id)
            .execute(&self.inner.pool)
            .await?;
        tracing::info!(instance_id, "purged instance events");
        Ok(())
    }
}

impl Clone for PgEventStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for PgEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEventStore")
            .field("statements", &self.inner.statements)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use crate::store::EventFilter;
    use crate::types::Position;

    use super::render_filter;

    #[test]
    fn renders_empty_filter() {
        let (sql, binds) = render_filter("SELECT * FROM events", &EventFilter::default());
        assert_eq!(sql, "SELECT * FROM events ORDER BY position ASC, in_tx_order ASC");
        assert!(binds.is_empty());
    }

    #[test]
    fn renders_conjunction_with_ordered_placeholders() {
        let filter = EventFilter::builder()
            .instance_id("inst1")
            .aggregate_types(vec!["org".to_owned()])
            .event_types(vec!["org.added".to_owned(), "org.changed".to_owned()])
            .limit(10)
            .build();

        let (sql, binds) = render_filter("SELECT * FROM events", &filter);
        assert_eq!(
            sql,
            "SELECT * FROM events WHERE instance_id = $1 AND aggregate_type = ANY($2) \
             AND event_type = ANY($3) ORDER BY position ASC, in_tx_order ASC LIMIT 10"
        );
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn renders_strict_position_predicate() {
        let filter = EventFilter::builder()
            .position_after(Position::new(Decimal::new(42, 0), 3))
            .build();

        let (sql, _) = render_filter("SELECT * FROM events", &filter);
        assert!(sql.contains("(position > $1 OR (position = $1 AND in_tx_order > $2))"));
    }

    #[test]
    fn renders_descending_order() {
        let filter = EventFilter::builder().descending(true).build();
        let (sql, _) = render_filter("SELECT * FROM events", &filter);
        assert!(sql.ends_with("ORDER BY position DESC, in_tx_order DESC"));
    }
}
