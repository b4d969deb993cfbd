use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::Error;
use crate::store::StoreError;

use super::{Queries, SearchRequest, SearchResponse};

/// One row of the `personal_access_tokens` projection.
#[derive(Debug, Clone, FromRow)]
pub struct PersonalAccessTokenRow {
    pub instance_id: String,
    pub id: String,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: serde_json::Value,
    pub creation_date: Option<DateTime<Utc>>,
    pub sequence: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct AuthnKeyRow {
    pub instance_id: String,
    pub id: String,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub key_type: Option<String>,
    pub public_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub creation_date: Option<DateTime<Utc>>,
    pub sequence: i64,
}

const PAT_COLUMNS: &str = "instance_id, id, user_id, org_id, expires_at, scopes, creation_date, sequence";
const KEY_COLUMNS: &str = "instance_id, id, user_id, org_id, key_type, public_key, expires_at, creation_date, sequence";

impl Queries {
    pub async fn personal_access_tokens(
        &self,
        instance_id: &str,
        user_id: &str,
        request: SearchRequest,
    ) -> Result<SearchResponse<PersonalAccessTokenRow>, Error> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM personal_access_tokens WHERE instance_id = $1 AND user_id = $2",
        )
        .bind(instance_id)
        .bind(user_id)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;

        let items = sqlx::query_as::<_, PersonalAccessTokenRow>(&format!(
            "SELECT {PAT_COLUMNS} FROM personal_access_tokens
             WHERE instance_id = $1 AND user_id = $2
             ORDER BY id {} LIMIT $3 OFFSET $4",
            request.direction()
        ))
        .bind(instance_id)
        .bind(user_id)
        .bind(request.capped_limit())
        .bind(request.offset())
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(SearchResponse {
            items,
            total: total as u64,
        })
    }

    /// Resolves a presented token to its row via the stored digest. Expired
    /// tokens resolve to `None`.
    pub async fn personal_access_token_by_digest(
        &self,
        instance_id: &str,
        token_digest: &str,
    ) -> Result<Option<PersonalAccessTokenRow>, Error> {
        let row = sqlx::query_as::<_, PersonalAccessTokenRow>(&format!(
            "SELECT {PAT_COLUMNS} FROM personal_access_tokens
             WHERE instance_id = $1 AND token_digest = $2
               AND (expires_at IS NULL OR expires_at > now())",
        ))
        .bind(instance_id)
        .bind(token_digest)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(row)
    }

    pub async fn authn_keys(&self, instance_id: &str, user_id: &str) -> Result<Vec<AuthnKeyRow>, Error> {
        let rows = sqlx::query_as::<_, AuthnKeyRow>(&format!(
            "SELECT {KEY_COLUMNS} FROM authn_keys WHERE instance_id = $1 AND user_id = $2 ORDER BY id"
        ))
        .bind(instance_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(rows)
    }

    pub async fn authn_key_by_id(&self, instance_id: &str, key_id: &str) -> Result<Option<AuthnKeyRow>, Error> {
        let row = sqlx::query_as::<_, AuthnKeyRow>(&format!(
            "SELECT {KEY_COLUMNS} FROM authn_keys WHERE instance_id = $1 AND id = $2"
        ))
        .bind(instance_id)
        .bind(key_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(row)
    }
}
