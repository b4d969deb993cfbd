use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Row};

use crate::command::events::{
    ORG_DOMAIN_PRIMARY_SET, ORG_DOMAIN_REMOVED, ORG_DOMAIN_VERIFIED, ORG_REMOVED, USER_HUMAN_ADDED,
    USER_MACHINE_ADDED, USER_REMOVED, USER_USERNAME_CHANGED,
};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::StoreError;

use super::{Handler, ImperativeHandler, ProjectionConfig};

pub(crate) const TABLE: &str = "login_names";
const USERS_TABLE: &str = "login_names_users";
const DOMAINS_TABLE: &str = "login_names_domains";

/// Read model of resolvable login names: one row per user × verified org
/// domain. Imperative; keeps private `login_names_users` and
/// `login_names_domains` helper tables so it never reads tables owned by
/// another projection.
pub struct LoginNamesProjection;

impl LoginNamesProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("login_names")
            .tables(vec![TABLE, USERS_TABLE, DOMAINS_TABLE])
            .aggregate_types(vec!["user", "org"])
            .event_types(vec![
                USER_HUMAN_ADDED,
                USER_MACHINE_ADDED,
                USER_USERNAME_CHANGED,
                USER_REMOVED,
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

    /// Regenerates the combined rows of one user from the helper tables.
    async fn regenerate_user(&self, conn: &mut PgConnection, instance_id: &str, user_id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM login_names WHERE instance_id = $1 AND user_id = $2")
            .bind(instance_id)
            .bind(user_id)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::Sqlx)?;

        sqlx::query(
            "INSERT INTO login_names (instance_id, user_id, org_id, domain, login_name, is_primary)
             SELECT u.instance_id, u.user_id, u.org_id, d.domain, u.username || '@' || d.domain, d.is_primary
             FROM login_names_users u
             JOIN login_names_domains d ON d.instance_id = u.instance_id AND d.org_id = u.org_id
             WHERE u.instance_id = $1 AND u.user_id = $2",
        )
        .bind(instance_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    /// Regenerates every user of an org after its domain set changed.
    async fn regenerate_org(&self, conn: &mut PgConnection, instance_id: &str, org_id: &str) -> Result<(), Error> {
        let users = sqlx::query("SELECT user_id FROM login_names_users WHERE instance_id = $1 AND org_id = $2")
            .bind(instance_id)
            .bind(org_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(StoreError::Sqlx)?;

        for row in users {
            let user_id: String = row.get(0);
            self.regenerate_user(conn, instance_id, &user_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ImperativeHandler for LoginNamesProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS login_names
             (
               instance_id TEXT    NOT NULL,
               user_id     TEXT    NOT NULL,
               org_id      TEXT    NOT NULL,
               domain      TEXT    NOT NULL,
               login_name  TEXT    NOT NULL,
               is_primary  BOOLEAN NOT NULL DEFAULT FALSE,
               PRIMARY KEY (instance_id, user_id, login_name)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS login_names_lookup ON login_names (instance_id, login_name)")
            .execute(pool)
            .await
            .map_err(StoreError::Sqlx)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS login_names_users
             (
               instance_id TEXT NOT NULL,
               user_id     TEXT NOT NULL,
               org_id      TEXT NOT NULL,
               username    TEXT NOT NULL,
               PRIMARY KEY (instance_id, user_id)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS login_names_domains
             (
               instance_id TEXT    NOT NULL,
               org_id      TEXT    NOT NULL,
               domain      TEXT    NOT NULL,
               is_primary  BOOLEAN NOT NULL DEFAULT FALSE,
               PRIMARY KEY (instance_id, org_id, domain)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent, conn: &mut PgConnection) -> Result<(), Error> {
        let instance_id = &event.instance_id;
        match event.event_type.as_str() {
            USER_HUMAN_ADDED | USER_MACHINE_ADDED | USER_USERNAME_CHANGED => {
                let username = event.payload["username"].as_str().unwrap_or_default();
                sqlx::query(
                    "INSERT INTO login_names_users (instance_id, user_id, org_id, username)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (instance_id, user_id) DO UPDATE SET username = EXCLUDED.username",
                )
                .bind(instance_id)
                .bind(&event.aggregate_id)
                .bind(&event.owner)
                .bind(username)
                .execute(&mut *conn)
                .await
                .map_err(StoreError::Sqlx)?;

                self.regenerate_user(conn, instance_id, &event.aggregate_id).await
            }
            USER_REMOVED => {
                sqlx::query("DELETE FROM login_names_users WHERE instance_id = $1 AND user_id = $2")
                    .bind(instance_id)
                    .bind(&event.aggregate_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(StoreError::Sqlx)?;
                sqlx::query("DELETE FROM login_names WHERE instance_id = $1 AND user_id = $2")
                    .bind(instance_id)
                    .bind(&event.aggregate_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(StoreError::Sqlx)?;
                Ok(())
            }
            ORG_DOMAIN_VERIFIED => {
                let domain = event.payload["domain"].as_str().unwrap_or_default();
                sqlx::query(
                    "INSERT INTO login_names_domains (instance_id, org_id, domain, is_primary)
                     VALUES ($1, $2, $3, FALSE)
                     ON CONFLICT (instance_id, org_id, domain) DO NOTHING",
                )
                .bind(instance_id)
                .bind(&event.aggregate_id)
                .bind(domain)
                .execute(&mut *conn)
                .await
                .map_err(StoreError::Sqlx)?;

                self.regenerate_org(conn, instance_id, &event.aggregate_id).await
            }
            ORG_DOMAIN_PRIMARY_SET => {
                let domain = event.payload["domain"].as_str().unwrap_or_default();
                sqlx::query(
                    "UPDATE login_names_domains SET is_primary = (domain = $3)
                     WHERE instance_id = $1 AND org_id = $2",
                )
                .bind(instance_id)
                .bind(&event.aggregate_id)
                .bind(domain)
                .execute(&mut *conn)
                .await
                .map_err(StoreError::Sqlx)?;

                self.regenerate_org(conn, instance_id, &event.aggregate_id).await
            }
            ORG_DOMAIN_REMOVED => {
                let domain = event.payload["domain"].as_str().unwrap_or_default();
                sqlx::query("DELETE FROM login_names_domains WHERE instance_id = $1 AND org_id = $2 AND domain = $3")
                    .bind(instance_id)
                    .bind(&event.aggregate_id)
                    .bind(domain)
                    .execute(&mut *conn)
                    .await
                    .map_err(StoreError::Sqlx)?;

                self.regenerate_org(conn, instance_id, &event.aggregate_id).await
            }
            ORG_REMOVED => {
                for table in ["login_names", "login_names_users", "login_names_domains"] {
                    sqlx::query(&format!("DELETE FROM {table} WHERE instance_id = $1 AND org_id = $2"))
                        .bind(instance_id)
                        .bind(&event.aggregate_id)
                        .execute(&mut *conn)
                        .await
                        .map_err(StoreError::Sqlx)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
