use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::Error;
use crate::store::StoreError;

use super::{Queries, SearchRequest, SearchResponse};

/// One row of the `users` projection.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub instance_id: String,
    pub id: String,
    pub org_id: Option<String>,
    pub username: Option<String>,
    pub user_type: Option<String>,
    pub state: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub email_verified: bool,
    pub machine_name: Option<String>,
    pub description: Option<String>,
    pub creation_date: Option<DateTime<Utc>>,
    pub change_date: Option<DateTime<Utc>>,
    pub sequence: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserMetadataRow {
    pub instance_id: String,
    pub user_id: String,
    pub key: String,
    pub value: Option<String>,
    pub change_date: Option<DateTime<Utc>>,
    pub sequence: i64,
}

const USER_COLUMNS: &str = "instance_id, id, org_id, username, user_type, state, first_name, last_name, email, \
                            email_verified, machine_name, description, creation_date, change_date, sequence";

impl Queries {
    pub async fn user_by_id(&self, instance_id: &str, user_id: &str) -> Result<Option<UserRow>, Error> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE instance_id = $1 AND id = $2"
        ))
        .bind(instance_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(row)
    }

    /// Resolves a login name (`username@domain`) to the user id, used by
    /// the authentication surface.
    pub async fn user_id_by_login_name(&self, instance_id: &str, login_name: &str) -> Result<Option<String>, Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM login_names WHERE instance_id = $1 AND login_name = $2")
                .bind(instance_id)
                .bind(login_name)
                .fetch_optional(self.pool())
                .await
                .map_err(StoreError::Sqlx)?;
        Ok(row.map(|r| r.0))
    }

    /// Lists users of an org, optionally filtered by a username prefix.
    pub async fn search_users(
        &self,
        instance_id: &str,
        org_id: Option<&str>,
        username_prefix: Option<&str>,
        request: SearchRequest,
    ) -> Result<SearchResponse<UserRow>, Error> {
        let mut conditions = vec!["instance_id = $1".to_owned()];
        let mut next = 2;

        if org_id.is_some() {
            conditions.push(format!("org_id = ${next}"));
            next += 1;
        }
        let username_pattern = username_prefix.map(|prefix| format!("{}%", prefix.replace('%', "\\%")));
        if username_pattern.is_some() {
            conditions.push(format!("username LIKE ${next}"));
        }
        let where_clause = conditions.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) FROM users WHERE {where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(instance_id);
        if let Some(org_id) = org_id {
            count_query = count_query.bind(org_id);
        }
        if let Some(pattern) = &username_pattern {
            count_query = count_query.bind(pattern);
        }
        let total = count_query.fetch_one(self.pool()).await.map_err(StoreError::Sqlx)?;

        let items_sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE {where_clause} ORDER BY username {} LIMIT {} OFFSET {}",
            request.direction(),
            request.capped_limit(),
            request.offset(),
        );
        let mut items_query = sqlx::query_as::<_, UserRow>(&items_sql).bind(instance_id);
        if let Some(org_id) = org_id {
            items_query = items_query.bind(org_id);
        }
        if let Some(pattern) = &username_pattern {
            items_query = items_query.bind(pattern);
        }
        let items = items_query.fetch_all(self.pool()).await.map_err(StoreError::Sqlx)?;

        Ok(SearchResponse {
            items,
            total: total as u64,
        })
    }

    pub async fn user_metadata(
        &self,
        instance_id: &str,
        user_id: &str,
        key: &str,
    ) -> Result<Option<UserMetadataRow>, Error> {
        let row = sqlx::query_as::<_, UserMetadataRow>(
            "SELECT instance_id, user_id, key, value, change_date, sequence
             FROM user_metadata WHERE instance_id = $1 AND user_id = $2 AND key = $3",
        )
        .bind(instance_id)
        .bind(user_id)
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(row)
    }

    pub async fn list_user_metadata(&self, instance_id: &str, user_id: &str) -> Result<Vec<UserMetadataRow>, Error> {
        let rows = sqlx::query_as::<_, UserMetadataRow>(
            "SELECT instance_id, user_id, key, value, change_date, sequence
             FROM user_metadata WHERE instance_id = $1 AND user_id = $2
             ORDER BY key",
        )
        .bind(instance_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(rows)
    }
}
