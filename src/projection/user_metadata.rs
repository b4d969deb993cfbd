use async_trait::async_trait;
use sqlx::PgPool;

use crate::command::events::{USER_METADATA_REMOVED, USER_METADATA_SET, USER_REMOVED};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::StoreError;

use super::{Column, DeclarativeHandler, Handler, ProjectionConfig, RowOp};

pub(crate) const TABLE: &str = "user_metadata";

/// Read model of user metadata entries.
pub struct UserMetadataProjection;

impl UserMetadataProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("user_metadata")
            .tables(vec![TABLE])
            .aggregate_types(vec!["user"])
            .event_types(vec![USER_METADATA_SET, USER_METADATA_REMOVED, USER_REMOVED])
            .build()
    }

    pub fn handler() -> Handler {
        Handler::Declarative(Box::new(Self))
    }
}

#[async_trait]
impl DeclarativeHandler for UserMetadataProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_metadata
             (
               instance_id   TEXT   NOT NULL,
               user_id       TEXT   NOT NULL,
               key           TEXT   NOT NULL,
               value         TEXT,
               creation_date TIMESTAMPTZ,
               change_date   TIMESTAMPTZ,
               sequence      BIGINT NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, user_id, key)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error> {
        let op = match event.event_type.as_str() {
            USER_METADATA_SET => RowOp::Upsert {
                table: TABLE,
                keys: vec![
                    Column::new("instance_id", &event.instance_id),
                    Column::new("user_id", &event.aggregate_id),
                    Column::new("key", event.payload["key"].as_str().unwrap_or_default()),
                ],
                columns: vec![
                    Column::new("value", event.payload["value"].as_str().unwrap_or_default()),
                    Column::new("creation_date", event.created_at),
                    Column::new("change_date", event.created_at),
                    Column::new("sequence", event.aggregate_version),
                ],
            },
            USER_METADATA_REMOVED => RowOp::Delete {
                table: TABLE,
                keys: vec![
                    Column::new("instance_id", &event.instance_id),
                    Column::new("user_id", &event.aggregate_id),
                    Column::new("key", event.payload["key"].as_str().unwrap_or_default()),
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
