use async_trait::async_trait;
use sqlx::PgPool;

use crate::command::events::{
    USER_DEACTIVATED, USER_EMAIL_CHANGED, USER_EMAIL_VERIFIED, USER_HUMAN_ADDED, USER_LOCKED, USER_MACHINE_ADDED,
    USER_PROFILE_CHANGED, USER_REACTIVATED, USER_REMOVED, USER_UNLOCKED, USER_USERNAME_CHANGED,
};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::StoreError;

use super::{Column, DeclarativeHandler, Handler, ProjectionConfig, RowOp};

pub(crate) const TABLE: &str = "users";

/// Read model of users, humans and machines in one table.
pub struct UsersProjection;

impl UsersProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("users")
            .tables(vec![TABLE])
            .aggregate_types(vec!["user"])
            .event_types(vec![
                USER_HUMAN_ADDED,
                USER_MACHINE_ADDED,
                USER_USERNAME_CHANGED,
                USER_PROFILE_CHANGED,
                USER_EMAIL_CHANGED,
                USER_EMAIL_VERIFIED,
                USER_DEACTIVATED,
                USER_REACTIVATED,
                USER_LOCKED,
                USER_UNLOCKED,
                USER_REMOVED,
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

    fn state_change(event: &StoredEvent, state: &str) -> RowOp {
        let mut columns = vec![Column::new("state", state)];
        columns.extend(Self::tracking(event));
        RowOp::Upsert {
            table: TABLE,
            keys: Self::keys(event),
            columns,
        }
    }
}

#[async_trait]
impl DeclarativeHandler for UsersProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users
             (
               instance_id    TEXT    NOT NULL,
               id             TEXT    NOT NULL,
               org_id         TEXT,
               username       TEXT,
               user_type      TEXT,
               state          TEXT,
               first_name     TEXT,
               last_name      TEXT,
               email          TEXT,
               email_verified BOOLEAN NOT NULL DEFAULT FALSE,
               machine_name   TEXT,
               description    TEXT,
               creation_date  TIMESTAMPTZ,
               change_date    TIMESTAMPTZ,
               sequence       BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS users_username ON users (instance_id, org_id, username)")
            .execute(pool)
            .await
            .map_err(StoreError::Sqlx)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS users_email ON users (instance_id, email)")
            .execute(pool)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error> {
        let payload = &event.payload;
        let op = match event.event_type.as_str() {
            USER_HUMAN_ADDED => {
                let mut columns = vec![
                    Column::new("org_id", &event.owner),
                    Column::new("username", payload["username"].as_str().unwrap_or_default()),
                    Column::new("user_type", "human"),
                    Column::new("state", "active"),
                    Column::new("first_name", payload["first_name"].as_str().unwrap_or_default()),
                    Column::new("last_name", payload["last_name"].as_str().unwrap_or_default()),
                    Column::new("email", payload["email"].as_str().unwrap_or_default()),
                    Column::new("email_verified", payload["email_verified"].as_bool().unwrap_or(false)),
                    Column::new("creation_date", event.created_at),
                ];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            USER_MACHINE_ADDED => {
                let mut columns = vec![
                    Column::new("org_id", &event.owner),
                    Column::new("username", payload["username"].as_str().unwrap_or_default()),
                    Column::new("user_type", "machine"),
                    Column::new("state", "active"),
                    Column::new("machine_name", payload["name"].as_str().unwrap_or_default()),
                    Column::new("description", payload["description"].as_str().unwrap_or_default()),
                    Column::new("creation_date", event.created_at),
                ];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            USER_USERNAME_CHANGED => {
                let mut columns = vec![Column::new("username", payload["username"].as_str().unwrap_or_default())];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            USER_PROFILE_CHANGED => {
                let mut columns = vec![
                    Column::new("first_name", payload["first_name"].as_str().unwrap_or_default()),
                    Column::new("last_name", payload["last_name"].as_str().unwrap_or_default()),
                ];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            USER_EMAIL_CHANGED => {
                let mut columns = vec![
                    Column::new("email", payload["email"].as_str().unwrap_or_default()),
                    Column::new("email_verified", false),
                ];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            USER_EMAIL_VERIFIED => {
                let mut columns = vec![Column::new("email_verified", true)];
                columns.extend(Self::tracking(event));
                RowOp::Upsert {
                    table: TABLE,
                    keys: Self::keys(event),
                    columns,
                }
            }
            USER_DEACTIVATED => Self::state_change(event, "inactive"),
            USER_REACTIVATED | USER_UNLOCKED => Self::state_change(event, "active"),
            USER_LOCKED => Self::state_change(event, "locked"),
            USER_REMOVED => RowOp::Delete {
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
    use crate::projection::{DeclarativeHandler, RowOp, SqlValue};
    use crate::types::Position;

    use super::UsersProjection;

    fn event(event_type: &str, payload: serde_json::Value) -> StoredEvent {
        StoredEvent {
            instance_id: "inst1".to_owned(),
            aggregate_type: "user".to_owned(),
            aggregate_id: "u1".to_owned(),
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
    fn human_added_fills_profile_columns() {
        let ops = UsersProjection
            .project(&event(
                "user.human.added",
                serde_json::json!({
                    "username": "ada",
                    "first_name": "Ada",
                    "last_name": "Lovelace",
                    "email": "ada@acme.com",
                    "email_verified": true,
                }),
            ))
            .unwrap();

        match &ops[0] {
            RowOp::Upsert { columns, .. } => {
                let org = columns.iter().find(|c| c.name == "org_id").unwrap();
                assert!(matches!(&org.value, SqlValue::Text(v) if v == "org1"));
                assert!(columns.iter().any(|c| c.name == "email_verified"));
            }
            RowOp::Delete { .. } => panic!("expected upsert"),
        }
    }

    #[test]
    fn lock_and_unlock_flip_state() {
        let lock = UsersProjection.project(&event("user.locked", serde_json::Value::Null)).unwrap();
        match &lock[0] {
            RowOp::Upsert { columns, .. } => {
                let state = columns.iter().find(|c| c.name == "state").unwrap();
                assert!(matches!(&state.value, SqlValue::Text(v) if v == "locked"));
            }
            RowOp::Delete { .. } => panic!("expected upsert"),
        }
    }
}
