use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::Error;
use crate::store::StoreError;

use super::Queries;

/// One row of the `custom_texts` projection.
#[derive(Debug, Clone, FromRow)]
pub struct CustomTextRow {
    pub instance_id: String,
    pub aggregate_id: String,
    pub is_default: bool,
    pub template: String,
    pub language: String,
    pub key: String,
    pub text: Option<String>,
    pub change_date: Option<DateTime<Utc>>,
    pub sequence: i64,
}

const TEXT_COLUMNS: &str = "instance_id, aggregate_id, is_default, template, language, key, text, change_date, sequence";

impl Queries {
    /// Resolves one text override: the org's text if present, else the
    /// instance's. `None` means the shipped default applies.
    pub async fn custom_text(
        &self,
        instance_id: &str,
        org_id: Option<&str>,
        template: &str,
        language: &str,
        key: &str,
    ) -> Result<Option<CustomTextRow>, Error> {
        if let Some(org_id) = org_id {
            let row = sqlx::query_as::<_, CustomTextRow>(&format!(
                "SELECT {TEXT_COLUMNS} FROM custom_texts
                 WHERE instance_id = $1 AND aggregate_id = $2 AND template = $3 AND language = $4 AND key = $5"
            ))
            .bind(instance_id)
            .bind(org_id)
            .bind(template)
            .bind(language)
            .bind(key)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::Sqlx)?;

            if row.is_some() {
                return Ok(row);
            }
        }

        let row = sqlx::query_as::<_, CustomTextRow>(&format!(
            "SELECT {TEXT_COLUMNS} FROM custom_texts
             WHERE instance_id = $1 AND aggregate_id = $1 AND template = $2 AND language = $3 AND key = $4"
        ))
        .bind(instance_id)
        .bind(template)
        .bind(language)
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(row)
    }

    /// Every override of one template/language pair for an org or, with no
    /// org, the instance.
    pub async fn custom_texts(
        &self,
        instance_id: &str,
        org_id: Option<&str>,
        template: &str,
        language: &str,
    ) -> Result<Vec<CustomTextRow>, Error> {
        let aggregate_id = org_id.unwrap_or(instance_id);
        let rows = sqlx::query_as::<_, CustomTextRow>(&format!(
            "SELECT {TEXT_COLUMNS} FROM custom_texts
             WHERE instance_id = $1 AND aggregate_id = $2 AND template = $3 AND language = $4
             ORDER BY key"
        ))
        .bind(instance_id)
        .bind(aggregate_id)
        .bind(template)
        .bind(language)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(rows)
    }
}
