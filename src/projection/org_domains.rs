use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};

use crate::command::events::{
    ORG_DOMAIN_ADDED, ORG_DOMAIN_PRIMARY_SET, ORG_DOMAIN_REMOVED, ORG_DOMAIN_VERIFIED, ORG_REMOVED,
};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::StoreError;

use super::{Handler, ImperativeHandler, ProjectionConfig};

pub(crate) const TABLE: &str = "org_domains";

/// Read model of org domains. Imperative: promoting a primary domain
/// demotes every sibling row in the same statement.
pub struct OrgDomainsProjection;

impl OrgDomainsProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("org_domains")
            .tables(vec![TABLE])
            .aggregate_types(vec!["org"])
            .event_types(vec![
                ORG_DOMAIN_ADDED,
                ORG_DOMAIN_VERIFIED,
                ORG_DOMAIN_PRIMARY_SET,
                ORG_DOMAIN_REMOVED,
                ORG_REMOVED,
            ])
            .build()
    }

    pub fn handler() -> Handler {
        Handler::Imperative(Box::new(Self))
    }
}

#[async_trait]
impl ImperativeHandler for OrgDomainsProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS org_domains
             (
               instance_id   TEXT    NOT NULL,
               org_id        TEXT    NOT NULL,
               domain        TEXT    NOT NULL,
               verified      BOOLEAN NOT NULL DEFAULT FALSE,
               is_primary    BOOLEAN NOT NULL DEFAULT FALSE,
               creation_date TIMESTAMPTZ,
               change_date   TIMESTAMPTZ,
               sequence      BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, org_id, domain)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS org_domains_domain ON org_domains (instance_id, domain)")
            .execute(pool)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent, conn: &mut PgConnection) -> Result<(), Error> {
        let domain = event.payload["domain"].as_str().unwrap_or_default();

        match event.event_type.as_str() {
            ORG_DOMAIN_ADDED => {
                sqlx::query(
                    "INSERT INTO org_domains
                     (instance_id, org_id, domain, verified, is_primary, creation_date, change_date, sequence)
                     VALUES ($1, $2, $3, FALSE, FALSE, $4, $4, $5)
                     ON CONFLICT (instance_id, org_id, domain)
                     DO UPDATE SET change_date = EXCLUDED.change_date, sequence = EXCLUDED.sequence",
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(domain)
                .bind(event.created_at)
                .bind(event.aggregate_version)
                .execute(&mut *conn)
                .await
                .map_err(StoreError::Sqlx)?;
            }
            ORG_DOMAIN_VERIFIED => {
                sqlx::query(
                    "UPDATE org_domains SET verified = TRUE, change_date = $4, sequence = $5
                     WHERE instance_id = $1 AND org_id = $2 AND domain = $3",
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(domain)
                .bind(event.created_at)
                .bind(event.aggregate_version)
                .execute(&mut *conn)
                .await
                .map_err(StoreError::Sqlx)?;
            }
            ORG_DOMAIN_PRIMARY_SET => {
                sqlx::query(
                    "UPDATE org_domains SET is_primary = (domain = $3), change_date = $4, sequence = $5
                     WHERE instance_id = $1 AND org_id = $2",
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(domain)
                .bind(event.created_at)
                .bind(event.aggregate_version)
                .execute(&mut *conn)
                .await
                .map_err(StoreError::Sqlx)?;
            }
            ORG_DOMAIN_REMOVED => {
                sqlx::query("DELETE FROM org_domains WHERE instance_id = $1 AND org_id = $2 AND domain = $3")
                    .bind(&event.instance_id)
                    .bind(&event.aggregate_id)
                    .bind(domain)
                    .execute(&mut *conn)
                    .await
                    .map_err(StoreError::Sqlx)?;
            }
            ORG_REMOVED => {
                sqlx::query("DELETE FROM org_domains WHERE instance_id = $1 AND org_id = $2")
                    .bind(&event.instance_id)
                    .bind(&event.aggregate_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(StoreError::Sqlx)?;
            }
            _ => {}
        }
        Ok(())
    }
}
