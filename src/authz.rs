use async_trait::async_trait;

use crate::error::Error;

/// Scope a permission check applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionScope {
    /// The whole instance.
    Instance,
    /// One organization within the instance.
    Org(String),
    /// One aggregate (e.g. a specific user).
    Resource { owner: String, id: String },
}

/// A permission check request: `(subject, resource, action, scope)`.
#[derive(Debug, Clone)]
pub struct PermissionRequest<'a> {
    pub subject: &'a str,
    pub instance_id: &'a str,
    pub resource: &'a str,
    pub action: &'a str,
    pub scope: PermissionScope,
}

/// External authorization interface.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Returns `Ok(())` when allowed, `Error::PermissionDenied` otherwise.
    async fn check_permission(&self, request: PermissionRequest<'_>) -> Result<(), Error>;
}

/// Checker that allows everything. Default wiring for tests and trusted
/// in-process callers that authorize upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check_permission(&self, _request: PermissionRequest<'_>) -> Result<(), Error> {
        Ok(())
    }
}

pub mod permissions {
    pub const ORG_WRITE: &str = "org.write";
    pub const ORG_DELETE: &str = "org.delete";
    pub const ORG_MEMBER_WRITE: &str = "org.member.write";
    pub const ORG_MEMBER_DELETE: &str = "org.member.delete";
    pub const USER_WRITE: &str = "user.write";
    pub const USER_DELETE: &str = "user.delete";
    pub const USER_TOKEN_WRITE: &str = "user.token.write";
    pub const USER_KEY_WRITE: &str = "user.key.write";
    pub const POLICY_WRITE: &str = "policy.write";
    pub const POLICY_DELETE: &str = "policy.delete";
    pub const TEXT_WRITE: &str = "text.write";
}
