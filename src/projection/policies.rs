//! Read models of the policy families. One table per family; the org
//! override and the instance default share the table, `is_default`
//! distinguishing them. The login-policy handler is imperative because the
//! factor events edit JSONB arrays in place.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};

use crate::command::events::{
    SecondFactorPayload, MultiFactorPayload, INSTANCE_DOMAIN_POLICY_ADDED, INSTANCE_DOMAIN_POLICY_CHANGED,
    INSTANCE_LOCKOUT_POLICY_ADDED, INSTANCE_LOCKOUT_POLICY_CHANGED, INSTANCE_LOGIN_POLICY_ADDED,
    INSTANCE_LOGIN_POLICY_CHANGED, INSTANCE_LOGIN_POLICY_SECOND_FACTOR_ADDED,
    INSTANCE_LOGIN_POLICY_SECOND_FACTOR_REMOVED, INSTANCE_NOTIFICATION_POLICY_ADDED,
    INSTANCE_NOTIFICATION_POLICY_CHANGED, INSTANCE_PASSWORD_COMPLEXITY_POLICY_ADDED,
    INSTANCE_PASSWORD_COMPLEXITY_POLICY_CHANGED, INSTANCE_PRIVACY_POLICY_ADDED, INSTANCE_PRIVACY_POLICY_CHANGED,
    INSTANCE_SECURITY_POLICY_SET, ORG_DOMAIN_POLICY_ADDED, ORG_DOMAIN_POLICY_CHANGED, ORG_DOMAIN_POLICY_REMOVED,
    ORG_LOCKOUT_POLICY_ADDED, ORG_LOCKOUT_POLICY_CHANGED, ORG_LOCKOUT_POLICY_REMOVED, ORG_LOGIN_POLICY_ADDED,
    ORG_LOGIN_POLICY_CHANGED, ORG_LOGIN_POLICY_MULTI_FACTOR_ADDED, ORG_LOGIN_POLICY_MULTI_FACTOR_REMOVED,
    ORG_LOGIN_POLICY_REMOVED, ORG_LOGIN_POLICY_SECOND_FACTOR_ADDED, ORG_LOGIN_POLICY_SECOND_FACTOR_REMOVED,
    ORG_NOTIFICATION_POLICY_ADDED, ORG_NOTIFICATION_POLICY_CHANGED, ORG_NOTIFICATION_POLICY_REMOVED,
    ORG_PASSWORD_COMPLEXITY_POLICY_ADDED, ORG_PASSWORD_COMPLEXITY_POLICY_CHANGED,
    ORG_PASSWORD_COMPLEXITY_POLICY_REMOVED, ORG_PRIVACY_POLICY_ADDED, ORG_PRIVACY_POLICY_CHANGED,
    ORG_PRIVACY_POLICY_REMOVED, ORG_REMOVED,
};
use crate::error::Error;
use crate::event::StoredEvent;
use crate::policy::{DomainPolicy, LockoutPolicy, LoginPolicy, NotificationPolicy, PasswordComplexityPolicy, PrivacyPolicy, SecurityPolicy};
use crate::store::StoreError;

use super::{Column, DeclarativeHandler, Handler, ImperativeHandler, ProjectionConfig, RowOp};

fn policy_keys(event: &StoredEvent) -> Vec<Column> {
    vec![
        Column::new("instance_id", &event.instance_id),
        Column::new("id", &event.aggregate_id),
    ]
}

fn scope_columns(event: &StoredEvent, is_default: bool) -> Vec<Column> {
    let organization_id = if is_default {
        None
    } else {
        Some(event.aggregate_id.clone())
    };
    vec![
        Column::new("organization_id", organization_id),
        Column::new("is_default", is_default),
        Column::new("change_date", event.created_at),
        Column::new("sequence", event.aggregate_version),
    ]
}

macro_rules! simple_policy_projection {
    (
        $name:ident, $projection_name:literal, $table:literal, $policy:ty,
        org: [$org_added:expr, $org_changed:expr, $org_removed:expr],
        instance: [$instance_added:expr, $instance_changed:expr],
        create: $create:literal,
        columns: $columns:expr
    ) => {
        pub struct $name;

        impl $name {
            pub fn config() -> ProjectionConfig {
                ProjectionConfig::builder()
                    .name($projection_name)
                    .tables(vec![$table])
                    .aggregate_types(vec!["org", "instance"])
                    .event_types(vec![
                        $org_added,
                        $org_changed,
                        $org_removed,
                        $instance_added,
                        $instance_changed,
                        ORG_REMOVED,
                    ])
                    .build()
            }

            pub fn handler() -> Handler {
                Handler::Declarative(Box::new(Self))
            }
        }

        #[async_trait]
        impl DeclarativeHandler for $name {
            async fn init(&self, pool: &PgPool) -> Result<(), Error> {
                sqlx::query($create).execute(pool).await.map_err(StoreError::Sqlx)?;
                Ok(())
            }

            fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error> {
                let event_type = event.event_type.as_str();
                let op = if event_type == $org_added || event_type == $org_changed {
                    let policy: $policy = event.payload_as().map_err(StoreError::Json)?;
                    let mut columns = scope_columns(event, false);
                    #[allow(clippy::redundant_closure_call)]
                    columns.extend(($columns)(&policy));
                    RowOp::Upsert {
                        table: $table,
                        keys: policy_keys(event),
                        columns,
                    }
                } else if event_type == $instance_added || event_type == $instance_changed {
                    let policy: $policy = event.payload_as().map_err(StoreError::Json)?;
                    let mut columns = scope_columns(event, true);
                    #[allow(clippy::redundant_closure_call)]
                    columns.extend(($columns)(&policy));
                    RowOp::Upsert {
                        table: $table,
                        keys: policy_keys(event),
                        columns,
                    }
                } else if event_type == $org_removed || event_type == ORG_REMOVED {
                    RowOp::Delete {
                        table: $table,
                        keys: policy_keys(event),
                    }
                } else {
                    return Ok(vec![]);
                };
                Ok(vec![op])
            }
        }
    };
}

simple_policy_projection!(
    LockoutPoliciesProjection,
    "lockout_policies",
    "lockout_policies",
    LockoutPolicy,
    org: [ORG_LOCKOUT_POLICY_ADDED, ORG_LOCKOUT_POLICY_CHANGED, ORG_LOCKOUT_POLICY_REMOVED],
    instance: [INSTANCE_LOCKOUT_POLICY_ADDED, INSTANCE_LOCKOUT_POLICY_CHANGED],
    create: "CREATE TABLE IF NOT EXISTS lockout_policies
             (
               instance_id           TEXT    NOT NULL,
               id                    TEXT    NOT NULL,
               organization_id       TEXT,
               is_default            BOOLEAN NOT NULL DEFAULT FALSE,
               max_password_attempts BIGINT  NOT NULL DEFAULT 0,
               max_otp_attempts      BIGINT  NOT NULL DEFAULT 0,
               show_lockout_failures BOOLEAN NOT NULL DEFAULT TRUE,
               change_date           TIMESTAMPTZ,
               sequence              BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
    columns: |policy: &LockoutPolicy| {
        vec![
            Column::new("max_password_attempts", i64::from(policy.max_password_attempts)),
            Column::new("max_otp_attempts", i64::from(policy.max_otp_attempts)),
            Column::new("show_lockout_failures", policy.show_lockout_failures),
        ]
    }
);

simple_policy_projection!(
    PasswordComplexityPoliciesProjection,
    "password_complexity_policies",
    "password_complexity_policies",
    PasswordComplexityPolicy,
    org: [
        ORG_PASSWORD_COMPLEXITY_POLICY_ADDED,
        ORG_PASSWORD_COMPLEXITY_POLICY_CHANGED,
        ORG_PASSWORD_COMPLEXITY_POLICY_REMOVED
    ],
    instance: [INSTANCE_PASSWORD_COMPLEXITY_POLICY_ADDED, INSTANCE_PASSWORD_COMPLEXITY_POLICY_CHANGED],
    create: "CREATE TABLE IF NOT EXISTS password_complexity_policies
             (
               instance_id     TEXT    NOT NULL,
               id              TEXT    NOT NULL,
               organization_id TEXT,
               is_default      BOOLEAN NOT NULL DEFAULT FALSE,
               min_length      BIGINT  NOT NULL DEFAULT 0,
               has_lowercase   BOOLEAN NOT NULL DEFAULT TRUE,
               has_uppercase   BOOLEAN NOT NULL DEFAULT TRUE,
               has_number      BOOLEAN NOT NULL DEFAULT TRUE,
               has_symbol      BOOLEAN NOT NULL DEFAULT FALSE,
               change_date     TIMESTAMPTZ,
               sequence        BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
    columns: |policy: &PasswordComplexityPolicy| {
        vec![
            Column::new("min_length", i64::from(policy.min_length)),
            Column::new("has_lowercase", policy.has_lowercase),
            Column::new("has_uppercase", policy.has_uppercase),
            Column::new("has_number", policy.has_number),
            Column::new("has_symbol", policy.has_symbol),
        ]
    }
);

simple_policy_projection!(
    PrivacyPoliciesProjection,
    "privacy_policies",
    "privacy_policies",
    PrivacyPolicy,
    org: [ORG_PRIVACY_POLICY_ADDED, ORG_PRIVACY_POLICY_CHANGED, ORG_PRIVACY_POLICY_REMOVED],
    instance: [INSTANCE_PRIVACY_POLICY_ADDED, INSTANCE_PRIVACY_POLICY_CHANGED],
    create: "CREATE TABLE IF NOT EXISTS privacy_policies
             (
               instance_id     TEXT    NOT NULL,
               id              TEXT    NOT NULL,
               organization_id TEXT,
               is_default      BOOLEAN NOT NULL DEFAULT FALSE,
               tos_link        TEXT,
               privacy_link    TEXT,
               help_link       TEXT,
               support_email   TEXT,
               change_date     TIMESTAMPTZ,
               sequence        BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
    columns: |policy: &PrivacyPolicy| {
        vec![
            Column::new("tos_link", &policy.tos_link),
            Column::new("privacy_link", &policy.privacy_link),
            Column::new("help_link", &policy.help_link),
            Column::new("support_email", &policy.support_email),
        ]
    }
);

simple_policy_projection!(
    NotificationPoliciesProjection,
    "notification_policies",
    "notification_policies",
    NotificationPolicy,
    org: [ORG_NOTIFICATION_POLICY_ADDED, ORG_NOTIFICATION_POLICY_CHANGED, ORG_NOTIFICATION_POLICY_REMOVED],
    instance: [INSTANCE_NOTIFICATION_POLICY_ADDED, INSTANCE_NOTIFICATION_POLICY_CHANGED],
    create: "CREATE TABLE IF NOT EXISTS notification_policies
             (
               instance_id     TEXT    NOT NULL,
               id              TEXT    NOT NULL,
               organization_id TEXT,
               is_default      BOOLEAN NOT NULL DEFAULT FALSE,
               password_change BOOLEAN NOT NULL DEFAULT TRUE,
               change_date     TIMESTAMPTZ,
               sequence        BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
    columns: |policy: &NotificationPolicy| {
        vec![Column::new("password_change", policy.password_change)]
    }
);

simple_policy_projection!(
    DomainPoliciesProjection,
    "domain_policies",
    "domain_policies",
    DomainPolicy,
    org: [ORG_DOMAIN_POLICY_ADDED, ORG_DOMAIN_POLICY_CHANGED, ORG_DOMAIN_POLICY_REMOVED],
    instance: [INSTANCE_DOMAIN_POLICY_ADDED, INSTANCE_DOMAIN_POLICY_CHANGED],
    create: "CREATE TABLE IF NOT EXISTS domain_policies
             (
               instance_id                TEXT    NOT NULL,
               id                         TEXT    NOT NULL,
               organization_id            TEXT,
               is_default                 BOOLEAN NOT NULL DEFAULT FALSE,
               user_login_must_be_domain  BOOLEAN NOT NULL DEFAULT TRUE,
               validate_org_domains       BOOLEAN NOT NULL DEFAULT FALSE,
               smtp_sender_matches_domain BOOLEAN NOT NULL DEFAULT FALSE,
               change_date                TIMESTAMPTZ,
               sequence                   BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
    columns: |policy: &DomainPolicy| {
        vec![
            Column::new("user_login_must_be_domain", policy.user_login_must_be_domain),
            Column::new("validate_org_domains", policy.validate_org_domains),
            Column::new("smtp_sender_matches_domain", policy.smtp_sender_address_matches_instance_domain),
        ]
    }
);

/// Read model of login policies. Imperative because factor events edit the
/// JSONB arrays of an existing row.
pub struct LoginPoliciesProjection;

impl LoginPoliciesProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("login_policies")
            .tables(vec!["login_policies"])
            .aggregate_types(vec!["org", "instance"])
            .event_types(vec![
                ORG_LOGIN_POLICY_ADDED,
                ORG_LOGIN_POLICY_CHANGED,
                ORG_LOGIN_POLICY_REMOVED,
                ORG_LOGIN_POLICY_SECOND_FACTOR_ADDED,
                ORG_LOGIN_POLICY_SECOND_FACTOR_REMOVED,
                ORG_LOGIN_POLICY_MULTI_FACTOR_ADDED,
                ORG_LOGIN_POLICY_MULTI_FACTOR_REMOVED,
                INSTANCE_LOGIN_POLICY_ADDED,
                INSTANCE_LOGIN_POLICY_CHANGED,
                INSTANCE_LOGIN_POLICY_SECOND_FACTOR_ADDED,
                INSTANCE_LOGIN_POLICY_SECOND_FACTOR_REMOVED,
                ORG_REMOVED,
            ])
            .build()
    }

    pub fn handler() -> Handler {
        Handler::Imperative(Box::new(Self))
    }

    async fn upsert(&self, event: &StoredEvent, is_default: bool, conn: &mut PgConnection) -> Result<(), Error> {
        let policy: LoginPolicy = event.payload_as().map_err(StoreError::Json)?;
        let organization_id = if is_default {
            None
        } else {
            Some(event.aggregate_id.clone())
        };

        sqlx::query(
            "INSERT INTO login_policies
             (instance_id, id, organization_id, is_default, allow_username_password, allow_register,
              allow_external_idp, force_mfa, hide_password_reset, ignore_unknown_usernames,
              default_redirect_uri, second_factors, multi_factors, change_date, sequence)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             ON CONFLICT (instance_id, id) DO UPDATE SET
               organization_id = EXCLUDED.organization_id,
               is_default = EXCLUDED.is_default,
               allow_username_password = EXCLUDED.allow_username_password,
               allow_register = EXCLUDED.allow_register,
               allow_external_idp = EXCLUDED.allow_external_idp,
               force_mfa = EXCLUDED.force_mfa,
               hide_password_reset = EXCLUDED.hide_password_reset,
               ignore_unknown_usernames = EXCLUDED.ignore_unknown_usernames,
               default_redirect_uri = EXCLUDED.default_redirect_uri,
               second_factors = EXCLUDED.second_factors,
               multi_factors = EXCLUDED.multi_factors,
               change_date = EXCLUDED.change_date,
               sequence = EXCLUDED.sequence",
        )
        .bind(&event.instance_id)
        .bind(&event.aggregate_id)
        .bind(organization_id)
        .bind(is_default)
        .bind(policy.allow_username_password)
        .bind(policy.allow_register)
        .bind(policy.allow_external_idp)
        .bind(policy.force_mfa)
        .bind(policy.hide_password_reset)
        .bind(policy.ignore_unknown_usernames)
        .bind(&policy.default_redirect_uri)
        .bind(serde_json::to_value(&policy.second_factors)?)
        .bind(serde_json::to_value(&policy.multi_factors)?)
        .bind(event.created_at)
        .bind(event.aggregate_version)
        .execute(conn)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn edit_factor_array(
        &self,
        event: &StoredEvent,
        column: &str,
        factor: serde_json::Value,
        add: bool,
        conn: &mut PgConnection,
    ) -> Result<(), Error> {
        let sql = if add {
            format!(
                "UPDATE login_policies
                 SET {column} = CASE WHEN {column} @> $3 THEN {column} ELSE {column} || $3 END,
                     change_date = $4, sequence = $5
                 WHERE instance_id = $1 AND id = $2"
            )
        } else {
            format!(
                "UPDATE login_policies
                 SET {column} = {column} - $3::text, change_date = $4, sequence = $5
                 WHERE instance_id = $1 AND id = $2"
            )
        };

        let query = sqlx::query(&sql).bind(&event.instance_id).bind(&event.aggregate_id);
        let query = if add {
            query.bind(serde_json::Value::Array(vec![factor]))
        } else {
            // The jsonb `-` operator takes the bare element text.
            query.bind(factor.as_str().unwrap_or_default().to_owned())
        };
        query
            .bind(event.created_at)
            .bind(event.aggregate_version)
            .execute(conn)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl ImperativeHandler for LoginPoliciesProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS login_policies
             (
               instance_id              TEXT    NOT NULL,
               id                       TEXT    NOT NULL,
               organization_id          TEXT,
               is_default               BOOLEAN NOT NULL DEFAULT FALSE,
               allow_username_password  BOOLEAN NOT NULL DEFAULT TRUE,
               allow_register           BOOLEAN NOT NULL DEFAULT TRUE,
               allow_external_idp       BOOLEAN NOT NULL DEFAULT TRUE,
               force_mfa                BOOLEAN NOT NULL DEFAULT FALSE,
               hide_password_reset      BOOLEAN NOT NULL DEFAULT FALSE,
               ignore_unknown_usernames BOOLEAN NOT NULL DEFAULT FALSE,
               default_redirect_uri     TEXT,
               second_factors           JSONB   NOT NULL DEFAULT '[]'::jsonb,
               multi_factors            JSONB   NOT NULL DEFAULT '[]'::jsonb,
               change_date              TIMESTAMPTZ,
               sequence                 BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id, id)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent, conn: &mut PgConnection) -> Result<(), Error> {
        match event.event_type.as_str() {
            e if e == ORG_LOGIN_POLICY_ADDED || e == ORG_LOGIN_POLICY_CHANGED => {
                self.upsert(event, false, conn).await
            }
            e if e == INSTANCE_LOGIN_POLICY_ADDED || e == INSTANCE_LOGIN_POLICY_CHANGED => {
                self.upsert(event, true, conn).await
            }
            e if e == ORG_LOGIN_POLICY_SECOND_FACTOR_ADDED || e == INSTANCE_LOGIN_POLICY_SECOND_FACTOR_ADDED => {
                let payload: SecondFactorPayload = event.payload_as().map_err(StoreError::Json)?;
                self.edit_factor_array(event, "second_factors", serde_json::to_value(payload.factor)?, true, conn)
                    .await
            }
            e if e == ORG_LOGIN_POLICY_SECOND_FACTOR_REMOVED || e == INSTANCE_LOGIN_POLICY_SECOND_FACTOR_REMOVED => {
                let payload: SecondFactorPayload = event.payload_as().map_err(StoreError::Json)?;
                self.edit_factor_array(event, "second_factors", serde_json::to_value(payload.factor)?, false, conn)
                    .await
            }
            e if e == ORG_LOGIN_POLICY_MULTI_FACTOR_ADDED => {
                let payload: MultiFactorPayload = event.payload_as().map_err(StoreError::Json)?;
                self.edit_factor_array(event, "multi_factors", serde_json::to_value(payload.factor)?, true, conn)
                    .await
            }
            e if e == ORG_LOGIN_POLICY_MULTI_FACTOR_REMOVED => {
                let payload: MultiFactorPayload = event.payload_as().map_err(StoreError::Json)?;
                self.edit_factor_array(event, "multi_factors", serde_json::to_value(payload.factor)?, false, conn)
                    .await
            }
            e if e == ORG_LOGIN_POLICY_REMOVED || e == ORG_REMOVED => {
                sqlx::query("DELETE FROM login_policies WHERE instance_id = $1 AND id = $2")
                    .bind(&event.instance_id)
                    .bind(&event.aggregate_id)
                    .execute(conn)
                    .await
                    .map_err(StoreError::Sqlx)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Read model of the instance security policy.
pub struct SecurityPoliciesProjection;

impl SecurityPoliciesProjection {
    pub fn config() -> ProjectionConfig {
        ProjectionConfig::builder()
            .name("security_policies")
            .tables(vec!["security_policies"])
            .aggregate_types(vec!["instance"])
            .event_types(vec![INSTANCE_SECURITY_POLICY_SET])
            .build()
    }

    pub fn handler() -> Handler {
        Handler::Declarative(Box::new(Self))
    }
}

#[async_trait]
impl DeclarativeHandler for SecurityPoliciesProjection {
    async fn init(&self, pool: &PgPool) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS security_policies
             (
               instance_id             TEXT    NOT NULL,
               enable_iframe_embedding BOOLEAN NOT NULL DEFAULT FALSE,
               allowed_origins         JSONB   NOT NULL DEFAULT '[]'::jsonb,
               enable_impersonation    BOOLEAN NOT NULL DEFAULT FALSE,
               change_date             TIMESTAMPTZ,
               sequence                BIGINT  NOT NULL DEFAULT 0,
               PRIMARY KEY (instance_id)
             )",
        )
        .execute(pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    fn project(&self, event: &StoredEvent) -> Result<Vec<RowOp>, Error> {
        if event.event_type != INSTANCE_SECURITY_POLICY_SET {
            return Ok(vec![]);
        }
        let policy: SecurityPolicy = event.payload_as().map_err(StoreError::Json)?;
        Ok(vec![RowOp::Upsert {
            table: "security_policies",
            keys: vec![Column::new("instance_id", &event.instance_id)],
            columns: vec![
                Column::new("enable_iframe_embedding", policy.enable_iframe_embedding),
                Column::new("allowed_origins", serde_json::to_value(&policy.allowed_origins)?),
                Column::new("enable_impersonation", policy.enable_impersonation),
                Column::new("change_date", event.created_at),
                Column::new("sequence", event.aggregate_version),
            ],
        }])
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use crate::event::StoredEvent;
    use crate::policy::LockoutPolicy;
    use crate::projection::{DeclarativeHandler, RowOp, SqlValue};
    use crate::types::Position;

    use super::LockoutPoliciesProjection;

    fn event(aggregate_type: &str, aggregate_id: &str, event_type: &str, payload: serde_json::Value) -> StoredEvent {
        StoredEvent {
            instance_id: "inst1".to_owned(),
            aggregate_type: aggregate_type.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            aggregate_version: 1,
            event_type: event_type.to_owned(),
            revision: 1,
            position: Position::new(Decimal::ONE, 0),
            creator: "system".to_owned(),
            owner: aggregate_id.to_owned(),
            created_at: Utc::now(),
            payload,
        }
    }

    #[test]
    fn instance_policy_row_is_marked_default() {
        let payload = serde_json::to_value(LockoutPolicy {
            max_password_attempts: 3,
            ..Default::default()
        })
        .unwrap();
        let ops = LockoutPoliciesProjection
            .project(&event("instance", "inst1", "instance.policy.lockout.added", payload))
            .unwrap();

        match &ops[0] {
            RowOp::Upsert { columns, .. } => {
                let is_default = columns.iter().find(|c| c.name == "is_default").unwrap();
                assert!(matches!(is_default.value, SqlValue::Bool(true)));
                let org = columns.iter().find(|c| c.name == "organization_id").unwrap();
                assert!(matches!(&org.value, SqlValue::OptText(None)));
                let attempts = columns.iter().find(|c| c.name == "max_password_attempts").unwrap();
                assert!(matches!(attempts.value, SqlValue::Int(3)));
            }
            RowOp::Delete { .. } => panic!("expected upsert"),
        }
    }

    #[test]
    fn org_policy_row_carries_the_org() {
        let payload = serde_json::to_value(LockoutPolicy::default()).unwrap();
        let ops = LockoutPoliciesProjection
            .project(&event("org", "o1", "org.policy.lockout.added", payload))
            .unwrap();

        match &ops[0] {
            RowOp::Upsert { columns, .. } => {
                let org = columns.iter().find(|c| c.name == "organization_id").unwrap();
                assert!(matches!(&org.value, SqlValue::OptText(Some(v)) if v == "o1"));
            }
            RowOp::Delete { .. } => panic!("expected upsert"),
        }
    }

    #[test]
    fn org_removal_drops_the_policy_row() {
        let ops = LockoutPoliciesProjection
            .project(&event("org", "o1", "org.removed", serde_json::Value::Null))
            .unwrap();
        assert!(matches!(&ops[0], RowOp::Delete { .. }));
    }
}
