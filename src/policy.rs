//! Policy families, their built-in defaults, and pure enforcement helpers.
//!
//! The stored representation lives in the projections; resolution with
//! org → instance → built-in fallback is in [`crate::query`].

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifier reported for policies answered from the built-in constants.
pub const BUILT_IN_POLICY_ID: &str = "built-in-default";

/// Where a resolved policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyOrigin {
    Org,
    Instance,
    BuiltIn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutPolicy {
    pub max_password_attempts: u32,
    pub max_otp_attempts: u32,
    pub show_lockout_failures: bool,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_password_attempts: 10,
            max_otp_attempts: 5,
            show_lockout_failures: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordComplexityPolicy {
    pub min_length: u32,
    pub has_lowercase: bool,
    pub has_uppercase: bool,
    pub has_number: bool,
    pub has_symbol: bool,
}

impl Default for PasswordComplexityPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            has_lowercase: true,
            has_uppercase: true,
            has_number: true,
            has_symbol: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecondFactorType {
    Totp,
    U2f,
    OtpEmail,
    OtpSms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiFactorType {
    U2fWithVerification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPolicy {
    pub allow_username_password: bool,
    pub allow_register: bool,
    pub allow_external_idp: bool,
    pub force_mfa: bool,
    pub hide_password_reset: bool,
    pub ignore_unknown_usernames: bool,
    pub default_redirect_uri: String,
    pub second_factors: Vec<SecondFactorType>,
    pub multi_factors: Vec<MultiFactorType>,
}

impl Default for LoginPolicy {
    fn default() -> Self {
        Self {
            allow_username_password: true,
            allow_register: true,
            allow_external_idp: true,
            force_mfa: false,
            hide_password_reset: false,
            ignore_unknown_usernames: false,
            default_redirect_uri: String::new(),
            second_factors: vec![SecondFactorType::Totp],
            multi_factors: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PrivacyPolicy {
    pub tos_link: String,
    pub privacy_link: String,
    pub help_link: String,
    pub support_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPolicy {
    pub password_change: bool,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self { password_change: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPolicy {
    pub user_login_must_be_domain: bool,
    pub validate_org_domains: bool,
    pub smtp_sender_address_matches_instance_domain: bool,
}

impl Default for DomainPolicy {
    fn default() -> Self {
        Self {
            user_login_must_be_domain: true,
            validate_org_domains: false,
            smtp_sender_address_matches_instance_domain: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SecurityPolicy {
    pub enable_iframe_embedding: bool,
    pub allowed_origins: Vec<String>,
    pub enable_impersonation: bool,
}

/// `attempts ≥ policy.max_password_attempts`, with 0 meaning unlimited.
pub fn should_lockout_password(attempts: u32, policy: &LockoutPolicy) -> bool {
    policy.max_password_attempts > 0 && attempts >= policy.max_password_attempts
}

/// `attempts ≥ policy.max_otp_attempts`, with 0 meaning unlimited.
pub fn should_lockout_otp(attempts: u32, policy: &LockoutPolicy) -> bool {
    policy.max_otp_attempts > 0 && attempts >= policy.max_otp_attempts
}

/// Validates a candidate password against the complexity policy.
pub fn check_password_complexity(policy: &PasswordComplexityPolicy, candidate: &str) -> Result<(), Error> {
    if candidate.chars().count() < policy.min_length as usize {
        return Err(Error::invalid_argument(
            "POLICY-Cmplx01",
            format!("password must be at least {} characters long", policy.min_length),
        ));
    }
    if policy.has_lowercase && !candidate.chars().any(|c| c.is_lowercase()) {
        return Err(Error::invalid_argument(
            "POLICY-Cmplx02",
            "password must contain a lowercase letter",
        ));
    }
    if policy.has_uppercase && !candidate.chars().any(|c| c.is_uppercase()) {
        return Err(Error::invalid_argument(
            "POLICY-Cmplx03",
            "password must contain an uppercase letter",
        ));
    }
    if policy.has_number && !candidate.chars().any(|c| c.is_ascii_digit()) {
        return Err(Error::invalid_argument(
            "POLICY-Cmplx04",
            "password must contain a number",
        ));
    }
    if policy.has_symbol && candidate.chars().all(|c| c.is_alphanumeric()) {
        return Err(Error::invalid_argument(
            "POLICY-Cmplx05",
            "password must contain a symbol",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_lockout_defaults() {
        let policy = LockoutPolicy::default();
        assert_eq!(policy.max_password_attempts, 10);
        assert_eq!(policy.max_otp_attempts, 5);
        assert!(policy.show_lockout_failures);
    }

    #[test]
    fn lockout_threshold_is_inclusive() {
        let policy = LockoutPolicy {
            max_password_attempts: 3,
            ..Default::default()
        };
        assert!(!should_lockout_password(2, &policy));
        assert!(should_lockout_password(3, &policy));
        assert!(should_lockout_password(4, &policy));
    }

    #[test]
    fn zero_attempts_means_unlimited() {
        let policy = LockoutPolicy {
            max_password_attempts: 0,
            max_otp_attempts: 0,
            ..Default::default()
        };
        assert!(!should_lockout_password(1_000, &policy));
        assert!(!should_lockout_otp(1_000, &policy));
    }

    #[test]
    fn password_complexity_checks_each_class() {
        let policy = PasswordComplexityPolicy {
            has_symbol: true,
            ..Default::default()
        };

        assert!(check_password_complexity(&policy, "Ab1!efgh").is_ok());
        assert!(check_password_complexity(&policy, "short").is_err());
        assert!(check_password_complexity(&policy, "ab1!efgh").is_err());
        assert!(check_password_complexity(&policy, "AB1!EFGH").is_err());
        assert!(check_password_complexity(&policy, "Abc!efgh").is_err());
        assert!(check_password_complexity(&policy, "Ab1defgh").is_err());
    }
}
