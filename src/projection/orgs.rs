use async_trait::async_trait;
use sqlx::PgPool;

use crate::command::events::{
    ORG_ADDED, ORG_CHANGED, ORG_DEACTIVATED, ORG_DOMAIN_PRIMARY_SET, ORG_REACTIVATED, ORG_REMOVED,
};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::StoreError;

use super::{Column, DeclarativeHandler, Handler, ProjectionConfig, RowOp};

pub(crate) const TABLE: &str = "orgs";

/// Read model of organizations.
pub struct OrgsProjection;

impl OrgsProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("orgs")
            .tables(vec![TABLE])
            .aggregate_types(vec!["org"])
            .event_types(vec![
                ORG_ADDED,
                ORG_CHANGED,
                ORG_DEACTIVATED,
                ORG_REACTIVATED,
                ORG_REMOVED,
                ORG_DOMAIN_PRIMARY_SET,
            ])
            .build()
    }

    pub fn handler() -> Handler {
        Handler::Declarative(Box::new(Self))
    }

    fn keys(event: &StoredEvent) -> Vec<Column> {
        vec![
            Column::new("instance_id", &event.instance_id),
            Column::new("id", &event.aggregate_id),
        ]
    }

    fn tracking(event: &StoredEvent) -> Vec<Column> {
        vec![
            Column::new("change_date", event.created_at),
            Column::new("sequence", event.aggregate_version),
        ]
    }
}

#[async_trait]
impl DeclarativeHandler for OrgsProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS orgs
             (
               instance_id    TEXT   NOT NULL,
               id             TEXT   NOT NULL,
               name           TEXT,
               state          TEXT,
               primary_domain TEXT,
               creation_date  TIMESTAMPTZ,
               change_date    TIMESTAMPTZ,
               sequence       BIGINT NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS orgs_name ON orgs (instance_id, name)")
            .execute(pool)
            .await
            .map_err(StoreError::Sqlx)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS orgs_primary_domain ON orgs (instance_id, primary_domain)")
            .execute(pool)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error> {
        let op = match event.event_type.as_str() {
            ORG_ADDED => {
                let name = event.payload["name"].as_str().unwrap_or_default().to_owned();
                let mut columns = vec![
                    Column::new("name", name),
                    Column::new("state", "active"),
                    Column::new("creation_date", event.created_at),
                ];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            ORG_CHANGED => {
                let name = event.payload["name"].as_str().unwrap_or_default().to_owned();
                let mut columns = vec![Column::new("name", name)];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            ORG_DEACTIVATED | ORG_REACTIVATED => {
                let state = if event.event_type == ORG_DEACTIVATED {
                    "inactive"
                } else {
                    "active"
                };
                let mut columns = vec![Column::new("state", state)];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            ORG_DOMAIN_PRIMARY_SET => {
                let domain = event.payload["domain"].as_str().unwrap_or_default().to_owned();
                let mut columns = vec![Column::new("primary_domain", domain)];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            ORG_REMOVED => RowOp::Delete {
                table: TABLE,
                keys: Self::keys(event),
            },
            _ => return Ok(vec![]),
        };
        Ok(vec![op])
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use crate::event::StoredEvent;
    use crate::projection::{DeclarativeHandler, RowOp};
    use crate::types::Position;

    use super::OrgsProjection;

    fn event(event_type: &str, payload: serde_json::Value) -> StoredEvent {
        StoredEvent {
            instance_id: "inst1".to_owned(),
            aggregate_type: "org".to_owned(),
            aggregate_id: "org1".to_owned(),
            aggregate_version: 1,
            event_type: event_type.to_owned(),
            revision: 1,
            position: Position::new(Decimal::ONE, 0),
            creator: "system".to_owned(),
            owner: "org1".to_owned(),
            created_at: Utc::now(),
            payload,
        }
    }

    #[test]
    fn org_added_upserts_the_row() {
        let ops = OrgsProjection
            .project(&event("org.added", serde_json::json!({ "name": "Acme" })))
            .unwrap();

        assert_eq!(ops.len(), 1);
        match &ops[0] {
            RowOp::Upsert { table, keys, columns } => {
                assert_eq!(*table, "orgs");
                assert_eq!(keys.len(), 2);
                assert!(columns.iter().any(|c| c.name == "name"));
                assert!(columns.iter().any(|c| c.name == "state"));
            }
            RowOp::Delete { .. } => panic!("expected upsert"),
        }
    }

    #[test]
    fn org_removed_deletes_the_row() {
        let ops = OrgsProjection
            .project(&event("org.removed", serde_json::Value::Null))
            .unwrap();
        assert!(matches!(ops[0], RowOp::Delete { table: "orgs", .. }));
    }

    #[test]
    fn unknown_events_are_ignored() {
        let ops = OrgsProjection
            .project(&event("org.future.event", serde_json::Value::Null))
            .unwrap();
        assert!(ops.is_empty());
    }
}
