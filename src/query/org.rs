use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::Error;
use crate::store::StoreError;

use super::{Queries, SearchRequest, SearchResponse};

/// One row of the `orgs` projection.
#[derive(Debug, Clone, FromRow)]
pub struct OrgRow {
    pub instance_id: String,
    pub id: String,
    pub name: Option<String>,
    pub state: Option<String>,
    pub primary_domain: Option<String>,
    pub creation_date: Option<DateTime<Utc>>,
    pub change_date: Option<DateTime<Utc>>,
    pub sequence: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct OrgDomainRow {
    pub instance_id: String,
    pub org_id: String,
    pub domain: String,
    pub verified: bool,
    pub is_primary: bool,
    pub change_date: Option<DateTime<Utc>>,
    pub sequence: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct OrgMemberRow {
    pub instance_id: String,
    pub org_id: String,
    pub user_id: String,
    pub roles: serde_json::Value,
    pub change_date: Option<DateTime<Utc>>,
    pub sequence: i64,
}

const ORG_COLUMNS: &str = "instance_id, id, name, state, primary_domain, creation_date, change_date, sequence";

impl Queries {
    pub async fn org_by_id(&self, instance_id: &str, org_id: &str) -> Result<Option<OrgRow>, Error> {
        let row = sqlx::query_as::<_, OrgRow>(&format!(
            "SELECT {ORG_COLUMNS} FROM orgs WHERE instance_id = $1 AND id = $2"
        ))
        .bind(instance_id)
        .bind(org_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(row)
    }

    /// Resolves an organization by its primary login domain.
    pub async fn org_by_primary_domain(&self, instance_id: &str, domain: &str) -> Result<Option<OrgRow>, Error> {
        let row = sqlx::query_as::<_, OrgRow>(&format!(
            "SELECT {ORG_COLUMNS} FROM orgs WHERE instance_id = $1 AND primary_domain = $2"
        ))
        .bind(instance_id)
        .bind(domain)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(row)
    }

    /// Lists organizations, optionally filtered by a name prefix.
    pub async fn search_orgs(
        &self,
        instance_id: &str,
        name_prefix: Option<&str>,
        request: SearchRequest,
    ) -> Result<SearchResponse<OrgRow>, Error> {
        let name_pattern = name_prefix.map(|prefix| format!("{}%", prefix.replace('%', "\\%")));

        let total: i64 = match &name_pattern {
            Some(pattern) => sqlx::query_scalar("SELECT COUNT(*) FROM orgs WHERE instance_id = $1 AND name LIKE $2")
                .bind(instance_id)
                .bind(pattern)
                .fetch_one(self.pool())
                .await
                .map_err(StoreError::Sqlx)?,
            None => sqlx::query_scalar("SELECT COUNT(*) FROM orgs WHERE instance_id = $1")
                .bind(instance_id)
                .fetch_one(self.pool())
                .await
                .map_err(StoreError::Sqlx)?,
        };

        let items = match &name_pattern {
            Some(pattern) => {
                sqlx::query_as::<_, OrgRow>(&format!(
                    "SELECT {ORG_COLUMNS} FROM orgs WHERE instance_id = $1 AND name LIKE $2
                     ORDER BY name {} LIMIT $3 OFFSET $4",
                    request.direction()
                ))
                .bind(instance_id)
                .bind(pattern)
                .bind(request.capped_limit())
                .bind(request.offset())
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query_as::<_, OrgRow>(&format!(
                    "SELECT {ORG_COLUMNS} FROM orgs WHERE instance_id = $1
                     ORDER BY name {} LIMIT $2 OFFSET $3",
                    request.direction()
                ))
                .bind(instance_id)
                .bind(request.capped_limit())
                .bind(request.offset())
                .fetch_all(self.pool())
                .await
            }
        }
        .map_err(StoreError::Sqlx)?;

        Ok(SearchResponse {
            items,
            total: total as u64,
        })
    }

    pub async fn org_domains(&self, instance_id: &str, org_id: &str) -> Result<Vec<OrgDomainRow>, Error> {
        let rows = sqlx::query_as::<_, OrgDomainRow>(
            "SELECT instance_id, org_id, domain, verified, is_primary, change_date, sequence
             FROM org_domains WHERE instance_id = $1 AND org_id = $2
             ORDER BY domain",
        )
        .bind(instance_id)
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(rows)
    }

    pub async fn org_members(
        &self,
        instance_id: &str,
        org_id: &str,
        request: SearchRequest,
    ) -> Result<SearchResponse<OrgMemberRow>, Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM org_members WHERE instance_id = $1 AND org_id = $2")
            .bind(instance_id)
            .bind(org_id)
            .fetch_one(self.pool())
            .await
            .map_err(StoreError::Sqlx)?;

        let items = sqlx::query_as::<_, OrgMemberRow>(&format!(
            "SELECT instance_id, org_id, user_id, roles, change_date, sequence
             FROM org_members WHERE instance_id = $1 AND org_id = $2
             ORDER BY user_id {} LIMIT $3 OFFSET $4",
            request.direction()
        ))
        .bind(instance_id)
        .bind(org_id)
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
}
