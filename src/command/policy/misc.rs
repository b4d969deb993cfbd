use crate::authz::{permissions, PermissionScope};
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::policy::{DomainPolicy, NotificationPolicy, PrivacyPolicy, SecurityPolicy};
use crate::store::{ExpectedVersion, StoreError};
use crate::types::ObjectDetails;
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::super::org::{instance_aggregate, AGGREGATE_TYPE_INSTANCE};
use super::super::{retry_on_conflict, Commands, Context};
use super::PolicyFamily;

pub(crate) const ORG_PRIVACY_POLICY_ADDED: &str = "org.policy.privacy.added";
pub(crate) const ORG_PRIVACY_POLICY_CHANGED: &str = "org.policy.privacy.changed";
pub(crate) const ORG_PRIVACY_POLICY_REMOVED: &str = "org.policy.privacy.removed";
pub(crate) const INSTANCE_PRIVACY_POLICY_ADDED: &str = "instance.policy.privacy.added";
pub(crate) const INSTANCE_PRIVACY_POLICY_CHANGED: &str = "instance.policy.privacy.changed";

pub(crate) const ORG_NOTIFICATION_POLICY_ADDED: &str = "org.policy.notification.added";
pub(crate) const ORG_NOTIFICATION_POLICY_CHANGED: &str = "org.policy.notification.changed";
pub(crate) const ORG_NOTIFICATION_POLICY_REMOVED: &str = "org.policy.notification.removed";
pub(crate) const INSTANCE_NOTIFICATION_POLICY_ADDED: &str = "instance.policy.notification.added";
pub(crate) const INSTANCE_NOTIFICATION_POLICY_CHANGED: &str = "instance.policy.notification.changed";

pub(crate) const ORG_DOMAIN_POLICY_ADDED: &str = "org.policy.domain.added";
pub(crate) const ORG_DOMAIN_POLICY_CHANGED: &str = "org.policy.domain.changed";
pub(crate) const ORG_DOMAIN_POLICY_REMOVED: &str = "org.policy.domain.removed";
pub(crate) const INSTANCE_DOMAIN_POLICY_ADDED: &str = "instance.policy.domain.added";
pub(crate) const INSTANCE_DOMAIN_POLICY_CHANGED: &str = "instance.policy.domain.changed";

pub(crate) const INSTANCE_SECURITY_POLICY_SET: &str = "instance.policy.security.set";

impl PolicyFamily for PrivacyPolicy {
    const ORG_ADDED: &'static str = ORG_PRIVACY_POLICY_ADDED;
    const ORG_CHANGED: &'static str = ORG_PRIVACY_POLICY_CHANGED;
    const ORG_REMOVED: &'static str = ORG_PRIVACY_POLICY_REMOVED;
    const INSTANCE_ADDED: &'static str = INSTANCE_PRIVACY_POLICY_ADDED;
    const INSTANCE_CHANGED: &'static str = INSTANCE_PRIVACY_POLICY_CHANGED;
}

impl PolicyFamily for NotificationPolicy {
    const ORG_ADDED: &'static str = ORG_NOTIFICATION_POLICY_ADDED;
    const ORG_CHANGED: &'static str = ORG_NOTIFICATION_POLICY_CHANGED;
    const ORG_REMOVED: &'static str = ORG_NOTIFICATION_POLICY_REMOVED;
    const INSTANCE_ADDED: &'static str = INSTANCE_NOTIFICATION_POLICY_ADDED;
    const INSTANCE_CHANGED: &'static str = INSTANCE_NOTIFICATION_POLICY_CHANGED;
}

impl PolicyFamily for DomainPolicy {
    const ORG_ADDED: &'static str = ORG_DOMAIN_POLICY_ADDED;
    const ORG_CHANGED: &'static str = ORG_DOMAIN_POLICY_CHANGED;
    const ORG_REMOVED: &'static str = ORG_DOMAIN_POLICY_REMOVED;
    const INSTANCE_ADDED: &'static str = INSTANCE_DOMAIN_POLICY_ADDED;
    const INSTANCE_CHANGED: &'static str = INSTANCE_DOMAIN_POLICY_CHANGED;
}

/// Fold of the instance security policy. Instance-only family.
#[derive(Default)]
pub(crate) struct SecurityPolicyWriteModel {
    base: WriteModelBase,
    pub policy: Option<SecurityPolicy>,
}

impl WriteModel for SecurityPolicyWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_INSTANCE;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        if event.event_type == INSTANCE_SECURITY_POLICY_SET {
            self.policy = Some(event.payload_as()?);
        }
        Ok(())
    }
}

impl Commands {
    pub async fn add_org_privacy_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: PrivacyPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.add_org_policy(ctx, org_id, policy).await
    }

    pub async fn change_org_privacy_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: PrivacyPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_org_policy(ctx, org_id, policy).await
    }

    pub async fn remove_org_privacy_policy(&self, ctx: &Context, org_id: &str) -> Result<ObjectDetails, Error> {
        self.remove_org_policy::<PrivacyPolicy>(ctx, org_id).await
    }

    pub async fn add_default_privacy_policy(&self, ctx: &Context, policy: PrivacyPolicy) -> Result<ObjectDetails, Error> {
        self.add_default_policy(ctx, policy).await
    }

    pub async fn change_default_privacy_policy(
        &self,
        ctx: &Context,
        policy: PrivacyPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_default_policy(ctx, policy).await
    }

    pub async fn add_org_notification_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: NotificationPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.add_org_policy(ctx, org_id, policy).await
    }

    pub async fn change_org_notification_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: NotificationPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_org_policy(ctx, org_id, policy).await
    }

    pub async fn remove_org_notification_policy(&self, ctx: &Context, org_id: &str) -> Result<ObjectDetails, Error> {
        self.remove_org_policy::<NotificationPolicy>(ctx, org_id).await
    }

    pub async fn add_default_notification_policy(
        &self,
        ctx: &Context,
        policy: NotificationPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.add_default_policy(ctx, policy).await
    }

    pub async fn change_default_notification_policy(
        &self,
        ctx: &Context,
        policy: NotificationPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_default_policy(ctx, policy).await
    }

    pub async fn add_org_domain_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: DomainPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.add_org_policy(ctx, org_id, policy).await
    }

    pub async fn change_org_domain_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: DomainPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_org_policy(ctx, org_id, policy).await
    }

    pub async fn remove_org_domain_policy(&self, ctx: &Context, org_id: &str) -> Result<ObjectDetails, Error> {
        self.remove_org_policy::<DomainPolicy>(ctx, org_id).await
    }

    pub async fn add_default_domain_policy(&self, ctx: &Context, policy: DomainPolicy) -> Result<ObjectDetails, Error> {
        self.add_default_policy(ctx, policy).await
    }

    pub async fn change_default_domain_policy(
        &self,
        ctx: &Context,
        policy: DomainPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_default_policy(ctx, policy).await
    }

    /// Sets (or replaces) the instance security policy. Setting the current
    /// value emits nothing.
    pub async fn set_security_policy(&self, ctx: &Context, policy: SecurityPolicy) -> Result<ObjectDetails, Error> {
        let policy = &policy;
        retry_on_conflict(|| async move {
            let mut model: SecurityPolicyWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
            if model.policy.as_ref() == Some(policy) {
                return Ok(model.object_details());
            }

            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, PermissionScope::Instance)
                .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(instance_aggregate(ctx), INSTANCE_SECURITY_POLICY_SET, ctx.creator())
                        .with_payload(policy)?],
                    vec![ExpectedVersion {
                        aggregate: instance_aggregate(ctx),
                        version: model.base().sequence,
                    }],
                )
                .await?;

            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(model.object_details())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::command::test_support::{commands, system_ctx};
    use crate::policy::SecurityPolicy;

    #[tokio::test]
    async fn security_policy_set_is_an_upsert() {
        let (commands, _) = commands();
        let ctx = system_ctx();

        let policy = SecurityPolicy {
            enable_iframe_embedding: true,
            allowed_origins: vec!["https://acme.com".to_owned()],
            enable_impersonation: false,
        };
        let first = commands.set_security_policy(&ctx, policy.clone()).await.unwrap();

        // Same value: nothing new.
        let second = commands.set_security_policy(&ctx, policy.clone()).await.unwrap();
        assert_eq!(first.sequence, second.sequence);

        let third = commands
            .set_security_policy(
                &ctx,
                SecurityPolicy {
                    enable_impersonation: true,
                    ..policy
                },
            )
            .await
            .unwrap();
        assert_eq!(third.sequence, second.sequence + 1);
    }
}
