//! Command pipeline: validates input, loads write models, checks
//! preconditions and permissions, translates commands into events, and
//! pushes them atomically.
//!
//! Double-delete policy, applied uniformly: removing a membership-like link
//! (org member, metadata key, login-policy factor) that is already gone is
//! an idempotent success without an event; removing an entity aggregate
//! (org, user, domain, policy, token, key) that does not exist is
//! `NotFound`.

use std::future::Future;
use std::sync::Arc;

use typed_builder::TypedBuilder;

use crate::authz::{AllowAll, PermissionChecker, PermissionRequest, PermissionScope};
use crate::clock::{Clock, SystemClock};
use crate::crypto::PasswordHasher;
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent, CREATOR_SYSTEM};
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::notification::{NoopTransport, NotificationTransport};
use crate::store::{Eventstore, ExpectedVersion};

mod custom_text;
mod org;
mod org_domain;
mod org_member;
mod policy;
mod user;
mod user_metadata;
mod user_token;

/// Event vocabulary shared with the projection and query layers.
pub(crate) mod events {
    pub(crate) use super::custom_text::{
        CustomTextRemovedPayload, CustomTextSetPayload, CustomTextTemplateRemovedPayload, INSTANCE_CUSTOM_TEXT_REMOVED,
        INSTANCE_CUSTOM_TEXT_SET, INSTANCE_CUSTOM_TEXT_TEMPLATE_REMOVED, ORG_CUSTOM_TEXT_REMOVED, ORG_CUSTOM_TEXT_SET,
        ORG_CUSTOM_TEXT_TEMPLATE_REMOVED,
    };
    pub(crate) use super::org::{
        AGGREGATE_TYPE_INSTANCE, AGGREGATE_TYPE_ORG, ORG_ADDED, ORG_CHANGED, ORG_DEACTIVATED, ORG_REACTIVATED,
        ORG_REMOVED,
    };
    pub(crate) use super::org_domain::{
        ORG_DOMAIN_ADDED, ORG_DOMAIN_PRIMARY_SET, ORG_DOMAIN_REMOVED, ORG_DOMAIN_VERIFIED,
    };
    pub(crate) use super::org_member::{MemberPayload, ORG_MEMBER_ADDED, ORG_MEMBER_CHANGED, ORG_MEMBER_REMOVED};
    pub(crate) use super::policy::events::*;
    pub(crate) use super::user::{
        AGGREGATE_TYPE_USER, USER_DEACTIVATED, USER_EMAIL_CHANGED, USER_EMAIL_VERIFIED, USER_HUMAN_ADDED, USER_LOCKED,
        USER_MACHINE_ADDED, USER_PROFILE_CHANGED, USER_REACTIVATED, USER_REMOVED, USER_UNLOCKED,
        USER_USERNAME_CHANGED,
    };
    pub(crate) use super::user_metadata::{USER_METADATA_REMOVED, USER_METADATA_SET};
    pub(crate) use super::user_token::{
        MachineKeyAddedPayload, TokenAddedPayload, USER_MACHINE_KEY_ADDED, USER_MACHINE_KEY_REMOVED, USER_TOKEN_ADDED,
        USER_TOKEN_REMOVED,
    };
}

pub use custom_text::{SetCustomText, SetMessageText};
pub use org::{AddOrg, OrgSetup, SetupAdmin, SetupOrg};
pub use org_member::{Member, ORG_OWNER_ROLE, ORG_USER_MANAGER_ROLE};
pub use user::{AddHumanUser, AddMachineUser, AddedUser, HumanProfile};
pub use user_metadata::MetadataEntry;
pub use user_token::{AddedMachineKey, AddedPersonalAccessToken};

/// How many times a command is re-run with a fresh write model after an
/// optimistic concurrency conflict before the conflict is surfaced.
const CONFLICT_RETRIES: u32 = 2;

/// Per-request caller context.
#[derive(Debug, Clone)]
pub struct Context {
    pub instance_id: String,
    /// Empty for system callers.
    pub caller_id: String,
    /// Org the caller acts for; the instance id for instance-level callers.
    pub resource_owner: String,
    /// Externally visible domain of the instance, e.g. `localhost`.
    pub request_domain: String,
}

impl Context {
    pub fn new(
        instance_id: impl Into<String>,
        caller_id: impl Into<String>,
        resource_owner: impl Into<String>,
        request_domain: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            caller_id: caller_id.into(),
            resource_owner: resource_owner.into(),
            request_domain: request_domain.into(),
        }
    }

    /// Context for internal operations of one instance.
    pub fn system(instance_id: impl Into<String>, request_domain: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        Self {
            caller_id: String::new(),
            resource_owner: instance_id.clone(),
            request_domain: request_domain.into(),
            instance_id,
        }
    }

    /// The creator recorded on emitted events.
    pub fn creator(&self) -> &str {
        if self.caller_id.is_empty() {
            CREATOR_SYSTEM
        } else {
            &self.caller_id
        }
    }
}

/// Predicate deciding whether an org domain is acceptable. The default is
/// syntactic; deployments plug in DNS/HTTP ownership validation.
pub type DomainValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Explicit dependency set of every command handler.
#[derive(TypedBuilder)]
pub struct Commands {
    es: Arc<dyn Eventstore>,
    #[builder(default = Arc::new(UuidIdGenerator))]
    ids: Arc<dyn IdGenerator>,
    #[builder(default = Arc::new(AllowAll))]
    perms: Arc<dyn PermissionChecker>,
    #[builder(default, setter(strip_option))]
    hasher: Option<Arc<dyn PasswordHasher>>,
    #[builder(default = Arc::new(NoopTransport))]
    notifier: Arc<dyn NotificationTransport>,
    #[builder(default = Arc::new(SystemClock))]
    clock: Arc<dyn Clock>,
    #[builder(default = Arc::new(|candidate: &str| validate::is_domain(candidate)))]
    domain_validator: DomainValidator,
}

impl Commands {
    pub(crate) fn eventstore(&self) -> &dyn Eventstore {
        self.es.as_ref()
    }

    pub(crate) fn next_id(&self) -> Result<String, Error> {
        self.ids.next_id()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn notifier(&self) -> &dyn NotificationTransport {
        self.notifier.as_ref()
    }

    pub(crate) fn hasher(&self) -> Result<&dyn PasswordHasher, Error> {
        self.hasher
            .as_deref()
            .ok_or_else(|| Error::internal("COMMAND-Hash01", "no password hasher configured"))
    }

    pub(crate) fn domain_is_valid(&self, domain: &str) -> bool {
        (self.domain_validator)(domain)
    }

    pub(crate) async fn check_permission(
        &self,
        ctx: &Context,
        resource: &str,
        action: &str,
        scope: PermissionScope,
    ) -> Result<(), Error> {
        self.perms
            .check_permission(PermissionRequest {
                subject: ctx.creator(),
                instance_id: &ctx.instance_id,
                resource,
                action,
                scope,
            })
            .await
    }

    /// Pushes one batch with per-aggregate optimistic concurrency pinned to
    /// the given expectations.
    pub(crate) async fn push_checked(
        &self,
        commands: Vec<EventCommand>,
        expected: Vec<ExpectedVersion>,
    ) -> Result<Vec<StoredEvent>, Error> {
        Ok(self.es.push_with_concurrency_check(commands, expected).await?)
    }

    /// Pushes one batch without version expectations (creates, multi-
    /// aggregate setups).
    pub(crate) async fn push(&self, commands: Vec<EventCommand>) -> Result<Vec<StoredEvent>, Error> {
        Ok(self.es.push(commands).await?)
    }
}

/// Re-runs the command closure with a fresh write-model load after a
/// concurrency conflict, a bounded number of times.
pub(crate) async fn retry_on_conflict<T, F, Fut>(mut command: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempts: u32 = 0;
    loop {
        match command().await {
            Err(err) if err.is_concurrency_conflict() && attempts < CONFLICT_RETRIES => {
                attempts += 1;
                tracing::debug!(attempts, "retrying command after concurrency conflict");
            }
            other => return other,
        }
    }
}

pub(crate) mod validate {
    use crate::error::Error;

    pub fn not_empty(value: &str, code: &'static str, field: &str) -> Result<(), Error> {
        if value.trim().is_empty() {
            return Err(Error::invalid_argument(code, format!("{field} must not be empty")));
        }
        Ok(())
    }

    pub fn max_len(value: &str, max: usize, code: &'static str, field: &str) -> Result<(), Error> {
        if value.chars().count() > max {
            return Err(Error::invalid_argument(
                code,
                format!("{field} must be at most {max} characters"),
            ));
        }
        Ok(())
    }

    /// Two-letter lowercase language tag.
    pub fn language_tag(value: &str, code: &'static str) -> Result<(), Error> {
        if value.len() == 2 && value.bytes().all(|b| b.is_ascii_lowercase()) {
            return Ok(());
        }
        Err(Error::invalid_argument(code, format!("invalid language tag: {value}")))
    }

    pub fn email(value: &str, code: &'static str) -> Result<(), Error> {
        let mut parts = value.splitn(2, '@');
        let local = parts.next().unwrap_or_default();
        let domain = parts.next().unwrap_or_default();
        if local.is_empty() || domain.is_empty() || !is_domain(domain) {
            return Err(Error::invalid_argument(code, format!("invalid email address: {value}")));
        }
        Ok(())
    }

    /// RFC-1035-ish check: dot-separated labels of alphanumerics and
    /// hyphens, no leading/trailing hyphen, each label 1..=63 chars.
    pub fn is_domain(value: &str) -> bool {
        if value.is_empty() || value.len() > 253 {
            return false;
        }
        value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
    }

    pub fn domain(value: &str, code: &'static str) -> Result<(), Error> {
        if is_domain(value) {
            return Ok(());
        }
        Err(Error::invalid_argument(code, format!("invalid domain: {value}")))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::crypto::test_support::PlainHasher;
    use crate::store::memory::InMemoryEventStore;

    use super::{Commands, Context};

    pub fn commands() -> (Commands, Arc<InMemoryEventStore>) {
        let store = Arc::new(InMemoryEventStore::new());
        let commands = Commands::builder()
            .es(store.clone())
            .hasher(Arc::new(PlainHasher))
            .build();
        (commands, store)
    }

    pub fn system_ctx() -> Context {
        Context::system("inst1", "localhost")
    }
}

#[cfg(test)]
mod tests {
    use super::validate;

    #[test]
    fn domain_validation() {
        assert!(validate::is_domain("localhost"));
        assert!(validate::is_domain("acme.com"));
        assert!(validate::is_domain("a-b.example.co"));
        assert!(!validate::is_domain(""));
        assert!(!validate::is_domain("-acme.com"));
        assert!(!validate::is_domain("acme-.com"));
        assert!(!validate::is_domain("ac me.com"));
        assert!(!validate::is_domain("acme..com"));
    }

    #[test]
    fn language_tag_validation() {
        assert!(validate::language_tag("de", "T-1").is_ok());
        assert!(validate::language_tag("en", "T-1").is_ok());
        assert!(validate::language_tag("EN", "T-1").is_err());
        assert!(validate::language_tag("deu", "T-1").is_err());
        assert!(validate::language_tag("d", "T-1").is_err());
    }

    #[test]
    fn email_validation() {
        assert!(validate::email("a@acme.com", "T-2").is_ok());
        assert!(validate::email("acme.com", "T-2").is_err());
        assert!(validate::email("@acme.com", "T-2").is_err());
        assert!(validate::email("a@", "T-2").is_err());
    }
}
