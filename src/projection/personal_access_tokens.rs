use async_trait::async_trait;
use sqlx::PgPool;

use crate::command::events::{TokenAddedPayload, USER_REMOVED, USER_TOKEN_ADDED, USER_TOKEN_REMOVED};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::StoreError;

use super::{Column, DeclarativeHandler, Handler, ProjectionConfig, RowOp};

pub(crate) const TABLE: &str = "personal_access_tokens";

/// Read model of personal access tokens. Stores digests only.
pub struct PersonalAccessTokensProjection;

impl PersonalAccessTokensProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("personal_access_tokens")
            .tables(vec![TABLE])
            .aggregate_types(vec!["user"])
            .event_types(vec![USER_TOKEN_ADDED, USER_TOKEN_REMOVED, USER_REMOVED])
            .build()
    }

    pub fn handler() -> Handler {
        Handler::Declarative(Box::new(Self))
    }
}

#[async_trait]
impl DeclarativeHandler for PersonalAccessTokensProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS personal_access_tokens
             (
               instance_id   TEXT NOT NULL,
               id            TEXT NOT NULL,
               user_id       TEXT,
               org_id        TEXT,
               token_digest  TEXT,
               expires_at    TIMESTAMPTZ,
               scopes        JSONB NOT NULL DEFAULT '[]'::jsonb,
               creation_date TIMESTAMPTZ,
               change_date   TIMESTAMPTZ,
               sequence      BIGINT NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS personal_access_tokens_user ON personal_access_tokens (instance_id, user_id)",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS personal_access_tokens_digest ON personal_access_tokens (instance_id, token_digest)",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error> {
        let op = match event.event_type.as_str() {
            USER_TOKEN_ADDED => {
                let payload: TokenAddedPayload = event.payload_as().map_err(StoreError::Json)?;
                RowOp::Upsert {
                    table: TABLE,
                    keys: vec![
                        Column::new("instance_id", &event.instance_id),
                        Column::new("id", payload.token_id),
                    ],
                    columns: vec![
                        Column::new("user_id", &event.aggregate_id),
                        Column::new("org_id", &event.owner),
                        Column::new("token_digest", payload.token_digest),
                        Column::new("expires_at", payload.expires_at),
                        Column::new("scopes", serde_json::to_value(&payload.scopes)?),
                        Column::new("creation_date", event.created_at),
                        Column::new("change_date", event.created_at),
                        Column::new("sequence", event.aggregate_version),
                    ],
                }
            }
            USER_TOKEN_REMOVED => RowOp::Delete {
                table: TABLE,
                keys: vec![
                    Column::new("instance_id", &event.instance_id),
                    Column::new("id", event.payload["token_id"].as_str().unwrap_or_default()),
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
