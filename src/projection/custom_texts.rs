use async_trait::async_trait;
use sqlx::PgPool;

use crate::command::events::{
    CustomTextRemovedPayload, CustomTextSetPayload, CustomTextTemplateRemovedPayload, INSTANCE_CUSTOM_TEXT_REMOVED,
    INSTANCE_CUSTOM_TEXT_SET, INSTANCE_CUSTOM_TEXT_TEMPLATE_REMOVED, ORG_CUSTOM_TEXT_REMOVED, ORG_CUSTOM_TEXT_SET,
    ORG_CUSTOM_TEXT_TEMPLATE_REMOVED, ORG_REMOVED,
};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::StoreError;

use super::{Column, DeclarativeHandler, Handler, ProjectionConfig, RowOp};

pub(crate) const TABLE: &str = "custom_texts";

/// Read model of i18n text overrides, org- and instance-level in one
/// table (`is_default` marks instance rows).
pub struct CustomTextsProjection;

impl CustomTextsProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("custom_texts")
            .tables(vec![TABLE])
            .aggregate_types(vec!["org", "instance"])
            .event_types(vec![
                ORG_CUSTOM_TEXT_SET,
                ORG_CUSTOM_TEXT_REMOVED,
                ORG_CUSTOM_TEXT_TEMPLATE_REMOVED,
                INSTANCE_CUSTOM_TEXT_SET,
                INSTANCE_CUSTOM_TEXT_REMOVED,
                INSTANCE_CUSTOM_TEXT_TEMPLATE_REMOVED,
                ORG_REMOVED,
            ])
            .build()
    }

    pub fn handler() -> Handler {
        Handler::Declarative(Box::new(Self))
    }
}

#[async_trait]
impl DeclarativeHandler for CustomTextsProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS custom_texts
             (
               instance_id  TEXT    NOT NULL,
               aggregate_id TEXT    NOT NULL,
               is_default   BOOLEAN NOT NULL DEFAULT FALSE,
               template     TEXT    NOT NULL,
               language     TEXT    NOT NULL,
               key          TEXT    NOT NULL,
               text         TEXT,
               change_date  TIMESTAMPTZ,
               sequence     BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, aggregate_id, template, language, key)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error> {
        let event_type = event.event_type.as_str();
        let op = match event_type {
            ORG_CUSTOM_TEXT_SET | INSTANCE_CUSTOM_TEXT_SET => {
                let payload: CustomTextSetPayload = event.payload_as().map_err(StoreError::Json)?;
                RowOp::Upsert {
                    table: TABLE,
                    keys: vec![
                        Column::new("instance_id", &event.instance_id),
                        Column::new("aggregate_id", &event.aggregate_id),
                        Column::new("template", payload.template),
                        Column::new("language", payload.language),
                        Column::new("key", payload.key),
                    ],
                    columns: vec![
                        Column::new("is_default", event_type == INSTANCE_CUSTOM_TEXT_SET),
                        Column::new("text", payload.text),
                        Column::new("change_date", event.created_at),
                        Column::new("sequence", event.aggregate_version),
                    ],
                }
            }
            ORG_CUSTOM_TEXT_REMOVED | INSTANCE_CUSTOM_TEXT_REMOVED => {
                let payload: CustomTextRemovedPayload = event.payload_as().map_err(StoreError::Json)?;
                RowOp::Delete {
                    table: TABLE,
                    keys: vec![
                        Column::new("instance_id", &event.instance_id),
                        Column::new("aggregate_id", &event.aggregate_id),
                        Column::new("template", payload.template),
                        Column::new("language", payload.language),
                        Column::new("key", payload.key),
                    ],
                }
            }
            ORG_CUSTOM_TEXT_TEMPLATE_REMOVED | INSTANCE_CUSTOM_TEXT_TEMPLATE_REMOVED => {
                let payload: CustomTextTemplateRemovedPayload = event.payload_as().map_err(StoreError::Json)?;
                RowOp::Delete {
                    table: TABLE,
                    keys: vec![
                        Column::new("instance_id", &event.instance_id),
                        Column::new("aggregate_id", &event.aggregate_id),
                        Column::new("template", payload.template),
                        Column::new("language", payload.language),
                    ],
                }
            }
            ORG_REMOVED => RowOp::Delete {
                table: TABLE,
                keys: vec![
                    Column::new("instance_id", &event.instance_id),
                    Column::new("aggregate_id", &event.aggregate_id),
                ],
            },
            _ => return Ok(vec![]),
        };
        Ok(vec![op])
    }
}
