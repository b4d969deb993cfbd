use crate::error::Error;
use crate::policy::PasswordComplexityPolicy;
use crate::types::ObjectDetails;
use crate::writemodel;

use super::super::{Commands, Context};
use super::{InstancePolicyWriteModel, OrgPolicyWriteModel, PolicyFamily};

pub(crate) const ORG_PASSWORD_COMPLEXITY_POLICY_ADDED: &str = "org.policy.password.complexity.added";
pub(crate) const ORG_PASSWORD_COMPLEXITY_POLICY_CHANGED: &str = "org.policy.password.complexity.changed";
pub(crate) const ORG_PASSWORD_COMPLEXITY_POLICY_REMOVED: &str = "org.policy.password.complexity.removed";
pub(crate) const INSTANCE_PASSWORD_COMPLEXITY_POLICY_ADDED: &str = "instance.policy.password.complexity.added";
pub(crate) const INSTANCE_PASSWORD_COMPLEXITY_POLICY_CHANGED: &str = "instance.policy.password.complexity.changed";

impl PolicyFamily for PasswordComplexityPolicy {
    const ORG_ADDED: &'static str = ORG_PASSWORD_COMPLEXITY_POLICY_ADDED;
    const ORG_CHANGED: &'static str = ORG_PASSWORD_COMPLEXITY_POLICY_CHANGED;
    const ORG_REMOVED: &'static str = ORG_PASSWORD_COMPLEXITY_POLICY_REMOVED;
    const INSTANCE_ADDED: &'static str = INSTANCE_PASSWORD_COMPLEXITY_POLICY_ADDED;
    const INSTANCE_CHANGED: &'static str = INSTANCE_PASSWORD_COMPLEXITY_POLICY_CHANGED;
}

/// Resolves the complexity policy a password must satisfy: org override,
/// else instance default, else the built-in constant. Used by the user
/// commands before hashing.
pub(crate) async fn effective_password_complexity(
    commands: &Commands,
    ctx: &Context,
    org_id: &str,
) -> Result<PasswordComplexityPolicy, Error> {
    let org: OrgPolicyWriteModel<PasswordComplexityPolicy> =
        writemodel::load(commands.eventstore(), &ctx.instance_id, org_id).await?;
    if let Some(policy) = org.policy {
        return Ok(policy);
    }

    let instance: InstancePolicyWriteModel<PasswordComplexityPolicy> =
        writemodel::load(commands.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
    Ok(instance.policy.unwrap_or_default())
}

impl Commands {
    pub async fn add_org_password_complexity_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: PasswordComplexityPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.add_org_policy(ctx, org_id, policy).await
    }

    pub async fn change_org_password_complexity_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: PasswordComplexityPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_org_policy(ctx, org_id, policy).await
    }

    pub async fn remove_org_password_complexity_policy(
        &self,
        ctx: &Context,
        org_id: &str,
    ) -> Result<ObjectDetails, Error> {
        self.remove_org_policy::<PasswordComplexityPolicy>(ctx, org_id).await
    }

    pub async fn add_default_password_complexity_policy(
        &self,
        ctx: &Context,
        policy: PasswordComplexityPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.add_default_policy(ctx, policy).await
    }

    pub async fn change_default_password_complexity_policy(
        &self,
        ctx: &Context,
        policy: PasswordComplexityPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.change_default_policy(ctx, policy).await
    }
}

#[cfg(test)]
mod tests {
    use crate::command::test_support::{commands, system_ctx};
    use crate::command::AddOrg;
    use crate::policy::PasswordComplexityPolicy;

    use super::effective_password_complexity;

    #[tokio::test]
    async fn resolution_prefers_org_then_instance_then_built_in() {
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

        let effective = effective_password_complexity(&commands, &ctx, "org1").await.unwrap();
        assert_eq!(effective, PasswordComplexityPolicy::default());

        commands
            .add_default_password_complexity_policy(
                &ctx,
                PasswordComplexityPolicy {
                    min_length: 12,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let effective = effective_password_complexity(&commands, &ctx, "org1").await.unwrap();
        assert_eq!(effective.min_length, 12);

        commands
            .add_org_password_complexity_policy(
                &ctx,
                "org1",
                PasswordComplexityPolicy {
                    min_length: 20,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let effective = effective_password_complexity(&commands, &ctx, "org1").await.unwrap();
        assert_eq!(effective.min_length, 20);
    }
}
