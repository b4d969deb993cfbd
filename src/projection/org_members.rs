use async_trait::async_trait;
use sqlx::PgPool;

use crate::command::events::{
    MemberPayload, ORG_MEMBER_ADDED, ORG_MEMBER_CHANGED, ORG_MEMBER_REMOVED, ORG_REMOVED, USER_REMOVED,
};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::StoreError;

use super::{Column, DeclarativeHandler, Handler, ProjectionConfig, RowOp};

pub(crate) const TABLE: &str = "org_members";

/// Read model of org memberships.
pub struct OrgMembersProjection;

impl OrgMembersProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("org_members")
            .tables(vec![TABLE])
            .aggregate_types(vec!["org", "user"])
            .event_types(vec![ORG_MEMBER_ADDED, ORG_MEMBER_CHANGED, ORG_MEMBER_REMOVED, ORG_REMOVED, USER_REMOVED])
            .requires(vec!["orgs", "users"])
            .build()
    }

    pub fn handler() -> Handler {
        Handler::Declarative(Box::new(Self))
    }
}

#[async_trait]
impl DeclarativeHandler for OrgMembersProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS org_members
             (
               instance_id   TEXT   NOT NULL,
               org_id        TEXT   NOT NULL,
               user_id       TEXT   NOT NULL,
               roles         JSONB  NOT NULL DEFAULT '[]'::jsonb,
               creation_date TIMESTAMPTZ,
               change_date   TIMESTAMPTZ,
               sequence      BIGINT NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, org_id, user_id)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS org_members_user ON org_members (instance_id, user_id)")
            .execute(pool)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error> {
        let op = match event.event_type.as_str() {
            ORG_MEMBER_ADDED | ORG_MEMBER_CHANGED => {
                let payload: MemberPayload = event.payload_as().map_err(StoreError::Json)?;
                RowOp::Upsert {
                    table: TABLE,
                    keys: vec![
                        Column::new("instance_id", &event.instance_id),
                        Column::new("org_id", &event.aggregate_id),
                        Column::new("user_id", payload.user_id),
                    ],
                    columns: vec![
                        Column::new("roles", serde_json::to_value(&payload.roles)?),
                        Column::new("creation_date", event.created_at),
                        Column::new("change_date", event.created_at),
                        Column::new("sequence", event.aggregate_version),
                    ],
                }
            }
            ORG_MEMBER_REMOVED => {
                let user_id = event.payload["user_id"].as_str().unwrap_or_default().to_owned();
                RowOp::Delete {
                    table: TABLE,
                    keys: vec![
                        Column::new("instance_id", &event.instance_id),
                        Column::new("org_id", &event.aggregate_id),
                        Column::new("user_id", user_id),
                    ],
                }
            }
            // Dropping an org drops its memberships.
            ORG_REMOVED => RowOp::Delete {
                table: TABLE,
                keys: vec![
                    Column::new("instance_id", &event.instance_id),
                    Column::new("org_id", &event.aggregate_id),
                ],
            },
            // Dropping a user drops their memberships everywhere.
            USER_REMOVED => RowOp::Delete {
                table: TABLE,
                keys: vec![
                    Column::new("instance_id", &event.instance_id),
                    Column::new("user_id", &event.aggregate_id),
                ],
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

    use super::OrgMembersProjection;

    #[test]
    fn member_added_carries_roles_as_json() {
        let event = StoredEvent {
            instance_id: "inst1".to_owned(),
            aggregate_type: "org".to_owned(),
            aggregate_id: "org1".to_owned(),
            aggregate_version: 5,
            event_type: "org.member.added".to_owned(),
            revision: 1,
            position: Position::new(Decimal::ONE, 0),
            creator: "system".to_owned(),
            owner: "org1".to_owned(),
            created_at: Utc::now(),
            payload: serde_json::json!({ "user_id": "u1", "roles": ["ORG_OWNER"] }),
        };

        let ops = OrgMembersProjection.project(&event).unwrap();
        match &ops[0] {
            RowOp::Upsert { keys, columns, .. } => {
                assert_eq!(keys.len(), 3);
                assert!(columns.iter().any(|c| c.name == "roles"));
            }
            RowOp::Delete { .. } => panic!("expected upsert"),
        }
    }
}
