use async_trait::async_trait;
use sqlx::PgPool;

use crate::command::events::{MachineKeyAddedPayload, USER_MACHINE_KEY_ADDED, USER_MACHINE_KEY_REMOVED, USER_REMOVED};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::StoreError;

use super::{Column, DeclarativeHandler, Handler, ProjectionConfig, RowOp};

pub(crate) const TABLE: &str = "authn_keys";

/// Read model of machine authentication keys.
pub struct AuthnKeysProjection;

impl AuthnKeysProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("authn_keys")
            .tables(vec![TABLE])
            .aggregate_types(vec!["user"])
            .event_types(vec![USER_MACHINE_KEY_ADDED, USER_MACHINE_KEY_REMOVED, USER_REMOVED])
            .build()
    }

    pub fn handler() -> Handler {
        Handler::Declarative(Box::new(Self))
    }
}

#[async_trait]
impl DeclarativeHandler for AuthnKeysProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS authn_keys
             (
               instance_id   TEXT NOT NULL,
               id            TEXT NOT NULL,
               user_id       TEXT,
               org_id        TEXT,
               key_type      TEXT,
               public_key    TEXT,
               expires_at    TIMESTAMPTZ,
               creation_date TIMESTAMPTZ,
               change_date   TIMESTAMPTZ,
               sequence      BIGINT NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS authn_keys_user ON authn_keys (instance_id, user_id)")
            .execute(pool)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error> {
        let op = match event.event_type.as_str() {
            USER_MACHINE_KEY_ADDED => {
                let payload: MachineKeyAddedPayload = event.payload_as().map_err(StoreError::Json)?;
                RowOp::Upsert {
                    table: TABLE,
                    keys: vec![
                        Column::new("instance_id", &event.instance_id),
                        Column::new("id", payload.key_id),
                    ],
                    columns: vec![
                        Column::new("user_id", &event.aggregate_id),
                        Column::new("org_id", &event.owner),
                        Column::new("key_type", payload.key_type),
                        Column::new("public_key", payload.public_key),
                        Column::new("expires_at", payload.expires_at),
                        Column::new("creation_date", event.created_at),
                        Column::new("change_date", event.created_at),
                        Column::new("sequence", event.aggregate_version),
                    ],
                }
            }
            USER_MACHINE_KEY_REMOVED => RowOp::Delete {
                table: TABLE,
                keys: vec![
                    Column::new("instance_id", &event.instance_id),
                    Column::new("id", event.payload["key_id"].as_str().unwrap_or_default()),
                ],
            },
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
