use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use crate::error::Error;
use crate::policy::{
    DomainPolicy, LockoutPolicy, LoginPolicy, NotificationPolicy, PasswordComplexityPolicy, PolicyOrigin,
    PrivacyPolicy, SecurityPolicy, BUILT_IN_POLICY_ID,
};
use crate::store::StoreError;

use super::Queries;

/// A policy answer, together with where it came from in the org →
/// instance → built-in fallback chain.
#[derive(Debug, Clone)]
pub struct ResolvedPolicy<P> {
    pub id: String,
    pub organization_id: Option<String>,
    pub is_default: bool,
    pub origin: PolicyOrigin,
    pub policy: P,
}

impl<P> ResolvedPolicy<P> {
    fn built_in(policy: P) -> Self {
        Self {
            id: BUILT_IN_POLICY_ID.to_owned(),
            organization_id: None,
            is_default: false,
            origin: PolicyOrigin::BuiltIn,
            policy,
        }
    }

    fn from_row(row: &PgRow, origin: PolicyOrigin, policy: P) -> Self {
        Self {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            is_default: row.get("is_default"),
            origin,
            policy,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SecurityPolicyRow {
    pub instance_id: String,
    pub enable_iframe_embedding: bool,
    pub allowed_origins: serde_json::Value,
    pub enable_impersonation: bool,
}

macro_rules! policy_resolver {
    ($fn_name:ident, $table:literal, $policy:ty, $decode:expr) => {
        /// Resolves the policy: org override if one exists, else the
        /// instance default, else the built-in constant.
        pub async fn $fn_name(
            &self,
            instance_id: &str,
            org_id: Option<&str>,
        ) -> Result<ResolvedPolicy<$policy>, Error> {
            if let Some(org_id) = org_id {
                let row = sqlx::query(concat!(
                    "SELECT * FROM ",
                    $table,
                    " WHERE instance_id = $1 AND id = $2 AND is_default = FALSE"
                ))
                .bind(instance_id)
                .bind(org_id)
                .fetch_optional(self.pool())
                .await
                .map_err(StoreError::Sqlx)?;

                if let Some(row) = row {
                    #[allow(clippy::redundant_closure_call)]
                    let policy = ($decode)(&row)?;
                    return Ok(ResolvedPolicy::from_row(&row, PolicyOrigin::Org, policy));
                }
            }

            let row = sqlx::query(concat!(
                "SELECT * FROM ",
                $table,
                " WHERE instance_id = $1 AND id = $1 AND is_default = TRUE"
            ))
            .bind(instance_id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::Sqlx)?;

            if let Some(row) = row {
                #[allow(clippy::redundant_closure_call)]
                let policy = ($decode)(&row)?;
                return Ok(ResolvedPolicy::from_row(&row, PolicyOrigin::Instance, policy));
            }

            Ok(ResolvedPolicy::built_in(<$policy>::default()))
        }
    };
}

impl Queries {
    policy_resolver!(lockout_policy, "lockout_policies", LockoutPolicy, |row: &PgRow| {
        Ok::<_, Error>(LockoutPolicy {
            max_password_attempts: row.get::<i64, _>("max_password_attempts") as u32,
            max_otp_attempts: row.get::<i64, _>("max_otp_attempts") as u32,
            show_lockout_failures: row.get("show_lockout_failures"),
        })
    });

    policy_resolver!(
        password_complexity_policy,
        "password_complexity_policies",
        PasswordComplexityPolicy,
        |row: &PgRow| {
            Ok::<_, Error>(PasswordComplexityPolicy {
                min_length: row.get::<i64, _>("min_length") as u32,
                has_lowercase: row.get("has_lowercase"),
                has_uppercase: row.get("has_uppercase"),
                has_number: row.get("has_number"),
                has_symbol: row.get("has_symbol"),
            })
        }
    );

    policy_resolver!(privacy_policy, "privacy_policies", PrivacyPolicy, |row: &PgRow| {
        Ok::<_, Error>(PrivacyPolicy {
            tos_link: row.get::<Option<String>, _>("tos_link").unwrap_or_default(),
            privacy_link: row.get::<Option<String>, _>("privacy_link").unwrap_or_default(),
            help_link: row.get::<Option<String>, _>("help_link").unwrap_or_default(),
            support_email: row.get::<Option<String>, _>("support_email").unwrap_or_default(),
        })
    });

    policy_resolver!(
        notification_policy,
        "notification_policies",
        NotificationPolicy,
        |row: &PgRow| {
            Ok::<_, Error>(NotificationPolicy {
                password_change: row.get("password_change"),
            })
        }
    );

    policy_resolver!(domain_policy, "domain_policies", DomainPolicy, |row: &PgRow| {
        Ok::<_, Error>(DomainPolicy {
            user_login_must_be_domain: row.get("user_login_must_be_domain"),
            validate_org_domains: row.get("validate_org_domains"),
            smtp_sender_address_matches_instance_domain: row.get("smtp_sender_matches_domain"),
        })
    });

    policy_resolver!(login_policy, "login_policies", LoginPolicy, |row: &PgRow| {
        Ok::<_, Error>(LoginPolicy {
            allow_username_password: row.get("allow_username_password"),
            allow_register: row.get("allow_register"),
            allow_external_idp: row.get("allow_external_idp"),
            force_mfa: row.get("force_mfa"),
            hide_password_reset: row.get("hide_password_reset"),
            ignore_unknown_usernames: row.get("ignore_unknown_usernames"),
            default_redirect_uri: row.get::<Option<String>, _>("default_redirect_uri").unwrap_or_default(),
            second_factors: serde_json::from_value(row.get("second_factors")).map_err(StoreError::Json)?,
            multi_factors: serde_json::from_value(row.get("multi_factors")).map_err(StoreError::Json)?,
        })
    });

    /// The instance security policy; instance-only, defaults when unset.
    pub async fn security_policy(&self, instance_id: &str) -> Result<SecurityPolicy, Error> {
        let row = sqlx::query_as::<_, SecurityPolicyRow>(
            "SELECT instance_id, enable_iframe_embedding, allowed_origins, enable_impersonation
             FROM security_policies WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(match row {
            Some(row) => SecurityPolicy {
                enable_iframe_embedding: row.enable_iframe_embedding,
                allowed_origins: serde_json::from_value(row.allowed_origins).map_err(StoreError::Json)?,
                enable_impersonation: row.enable_impersonation,
            },
            None => SecurityPolicy::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::policy::{LockoutPolicy, PolicyOrigin};

    use super::ResolvedPolicy;

    #[test]
    fn built_in_answers_carry_the_sentinel_id() {
        let resolved = ResolvedPolicy::built_in(LockoutPolicy::default());
        assert_eq!(resolved.id, "built-in-default");
        assert_eq!(resolved.origin, PolicyOrigin::BuiltIn);
        assert!(!resolved.is_default);
        assert_eq!(resolved.policy.max_password_attempts, 10);
        assert_eq!(resolved.policy.max_otp_attempts, 5);
        assert!(resolved.policy.show_lockout_failures);
    }
}
