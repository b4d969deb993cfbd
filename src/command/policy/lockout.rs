use crate::error::Error;
use crate::policy::LockoutPolicy;
use crate::types::ObjectDetails;

use super::super::{Commands, Context};
use super::PolicyFamily;

pub(crate) const ORG_LOCKOUT_POLICY_ADDED: &str = "org.policy.lockout.added";
pub(crate) const ORG_LOCKOUT_POLICY_CHANGED: &str = "org.policy.lockout.changed";
pub(crate) const ORG_LOCKOUT_POLICY_REMOVED: &str = "org.policy.lockout.removed";
pub(crate) const INSTANCE_LOCKOUT_POLICY_ADDED: &str = "instance.policy.lockout.added";
pub(crate) const INSTANCE_LOCKOUT_POLICY_CHANGED: &str = "instance.policy.lockout.changed";

impl PolicyFamily for LockoutPolicy {
    const ORG_ADDED: &'static str = ORG_LOCKOUT_POLICY_ADDED;
    const ORG_CHANGED: &'static str = ORG_LOCKOUT_POLICY_CHANGED;
    const ORG_REMOVED: &'static str = ORG_LOCKOUT_POLICY_REMOVED;
    const INSTANCE_ADDED: &'static str = INSTANCE_LOCKOUT_POLICY_ADDED;
    const INSTANCE_CHANGED: &'static str = INSTANCE_LOCKOUT_POLICY_CHANGED;
}

impl Commands {
    pub async fn add_org_lockout_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: LockoutPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.add_org_policy(ctx, org_id, policy).await
    }

    pub async fn change_org_lockout_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: LockoutPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_org_policy(ctx, org_id, policy).await
    }

    pub async fn remove_org_lockout_policy(&self, ctx: &Context, org_id: &str) -> Result<ObjectDetails, Error> {
        self.remove_org_policy::<LockoutPolicy>(ctx, org_id).await
    }

    pub async fn add_default_lockout_policy(&self, ctx: &Context, policy: LockoutPolicy) -> Result<ObjectDetails, Error> {
        self.add_default_policy(ctx, policy).await
    }

    pub async fn change_default_lockout_policy(
        &self,
        ctx: &Context,
        policy: LockoutPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_default_policy(ctx, policy).await
    }
}

#[cfg(test)]
mod tests {
    use crate::command::test_support::{commands, system_ctx};
    use crate::command::AddOrg;
    use crate::policy::LockoutPolicy;

    #[tokio::test]
    async fn org_policy_lifecycle() {
        let (commands, _) = commands();
        let ctx = system_ctx();
        commands
            .add_org(
                &ctx,
                AddOrg {
                    org_id: Some("org1".to_owned()),
                    name: "Acme".to_owned(),
                },
            )
            .await
            .unwrap();

        let policy = LockoutPolicy {
            max_password_attempts: 2,
            ..Default::default()
        };
        commands.add_org_lockout_policy(&ctx, "org1", policy.clone()).await.unwrap();

        let err = commands.add_org_lockout_policy(&ctx, "org1", policy.clone()).await.unwrap_err();
        assert!(err.is_already_exists());

        // Unchanged value: no event, same sequence.
        let before = commands.change_org_lockout_policy(&ctx, "org1", policy).await.unwrap();
        let after = commands
            .change_org_lockout_policy(
                &ctx,
                "org1",
                LockoutPolicy {
                    max_password_attempts: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(after.sequence, before.sequence + 1);

        commands.remove_org_lockout_policy(&ctx, "org1").await.unwrap();
        let err = commands.remove_org_lockout_policy(&ctx, "org1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn default_policy_lifecycle() {
        let (commands, _) = commands();
        let ctx = system_ctx();

        let err = commands
            .change_default_lockout_policy(&ctx, LockoutPolicy::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        commands
            .add_default_lockout_policy(
                &ctx,
                LockoutPolicy {
                    max_password_attempts: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = commands
            .add_default_lockout_policy(&ctx, LockoutPolicy::default())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        commands
            .change_default_lockout_policy(
                &ctx,
                LockoutPolicy {
                    max_password_attempts: 4,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
}
