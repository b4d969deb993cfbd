use serde::{Deserialize, Serialize};

use crate::authz::{permissions, PermissionScope};
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::policy::{LoginPolicy, MultiFactorType, SecondFactorType};
use crate::store::{ExpectedVersion, StoreError};
use crate::types::{Aggregate, ObjectDetails};
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::super::org::{instance_aggregate, org_aggregate, AGGREGATE_TYPE_INSTANCE, AGGREGATE_TYPE_ORG};
use super::super::{retry_on_conflict, Commands, Context};

pub(crate) const ORG_LOGIN_POLICY_ADDED: &str = "org.policy.login.added";
pub(crate) const ORG_LOGIN_POLICY_CHANGED: &str = "org.policy.login.changed";
pub(crate) const ORG_LOGIN_POLICY_REMOVED: &str = "org.policy.login.removed";
pub(crate) const ORG_LOGIN_POLICY_SECOND_FACTOR_ADDED: &str = "org.policy.login.secondfactor.added";
pub(crate) const ORG_LOGIN_POLICY_SECOND_FACTOR_REMOVED: &str = "org.policy.login.secondfactor.removed";
pub(crate) const ORG_LOGIN_POLICY_MULTI_FACTOR_ADDED: &str = "org.policy.login.multifactor.added";
pub(crate) const ORG_LOGIN_POLICY_MULTI_FACTOR_REMOVED: &str = "org.policy.login.multifactor.removed";
pub(crate) const INSTANCE_LOGIN_POLICY_ADDED: &str = "instance.policy.login.added";
pub(crate) const INSTANCE_LOGIN_POLICY_CHANGED: &str = "instance.policy.login.changed";
pub(crate) const INSTANCE_LOGIN_POLICY_SECOND_FACTOR_ADDED: &str = "instance.policy.login.secondfactor.added";
pub(crate) const INSTANCE_LOGIN_POLICY_SECOND_FACTOR_REMOVED: &str = "instance.policy.login.secondfactor.removed";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SecondFactorPayload {
    pub factor: SecondFactorType,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MultiFactorPayload {
    pub factor: MultiFactorType,
}

/// Fold of a login policy, shared by the org and instance levels.
#[derive(Default)]
pub(crate) struct LoginPolicyFold {
    pub policy: Option<LoginPolicy>,
}

impl LoginPolicyFold {
    fn reduce(
        &mut self,
        event: &StoredEvent,
        added: &str,
        changed: &str,
        removed: Option<&str>,
        sf_added: &str,
        sf_removed: &str,
        mf_added: Option<&str>,
        mf_removed: Option<&str>,
    ) -> Result<(), StoreError> {
        let event_type = event.event_type.as_str();
        if event_type == added || event_type == changed {
            self.policy = Some(event.payload_as()?);
        } else if Some(event_type) == removed {
            self.policy = None;
        } else if event_type == sf_added {
            let payload: SecondFactorPayload = event.payload_as()?;
            if let Some(policy) = &mut self.policy {
                if !policy.second_factors.contains(&payload.factor) {
                    policy.second_factors.push(payload.factor);
                }
            }
        } else if event_type == sf_removed {
            let payload: SecondFactorPayload = event.payload_as()?;
            if let Some(policy) = &mut self.policy {
                policy.second_factors.retain(|factor| *factor != payload.factor);
            }
        } else if Some(event_type) == mf_added {
            let payload: MultiFactorPayload = event.payload_as()?;
            if let Some(policy) = &mut self.policy {
                if !policy.multi_factors.contains(&payload.factor) {
                    policy.multi_factors.push(payload.factor);
                }
            }
        } else if Some(event_type) == mf_removed {
            let payload: MultiFactorPayload = event.payload_as()?;
            if let Some(policy) = &mut self.policy {
                policy.multi_factors.retain(|factor| *factor != payload.factor);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct OrgLoginPolicyWriteModel {
    base: WriteModelBase,
    pub fold: LoginPolicyFold,
}

impl WriteModel for OrgLoginPolicyWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_ORG;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        self.fold.reduce(
            event,
            ORG_LOGIN_POLICY_ADDED,
            ORG_LOGIN_POLICY_CHANGED,
            Some(ORG_LOGIN_POLICY_REMOVED),
            ORG_LOGIN_POLICY_SECOND_FACTOR_ADDED,
            ORG_LOGIN_POLICY_SECOND_FACTOR_REMOVED,
            Some(ORG_LOGIN_POLICY_MULTI_FACTOR_ADDED),
            Some(ORG_LOGIN_POLICY_MULTI_FACTOR_REMOVED),
        )
    }
}

#[derive(Default)]
pub(crate) struct InstanceLoginPolicyWriteModel {
    base: WriteModelBase,
    pub fold: LoginPolicyFold,
}

impl WriteModel for InstanceLoginPolicyWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_INSTANCE;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        self.fold.reduce(
            event,
            INSTANCE_LOGIN_POLICY_ADDED,
            INSTANCE_LOGIN_POLICY_CHANGED,
            None,
            INSTANCE_LOGIN_POLICY_SECOND_FACTOR_ADDED,
            INSTANCE_LOGIN_POLICY_SECOND_FACTOR_REMOVED,
            None,
            None,
        )
    }
}

enum PolicyLevel {
    Org(String),
    Instance,
}

impl PolicyLevel {
    fn aggregate(&self, ctx: &Context) -> Aggregate {
        match self {
            Self::Org(org_id) => org_aggregate(ctx, org_id),
            Self::Instance => instance_aggregate(ctx),
        }
    }

    fn scope(&self) -> PermissionScope {
        match self {
            Self::Org(org_id) => PermissionScope::Org(org_id.clone()),
            Self::Instance => PermissionScope::Instance,
        }
    }
}

impl Commands {
    async fn login_policy_fold(&self, ctx: &Context, level: &PolicyLevel) -> Result<(LoginPolicyFold, i64), Error> {
        match level {
            PolicyLevel::Org(org_id) => {
                let model: OrgLoginPolicyWriteModel =
                    writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
                Ok((model.fold, model.base.sequence))
            }
            PolicyLevel::Instance => {
                let model: InstanceLoginPolicyWriteModel =
                    writemodel::load(self.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
                Ok((model.fold, model.base.sequence))
            }
        }
    }

    async fn push_login_policy_event(
        &self,
        ctx: &Context,
        level: &PolicyLevel,
        sequence: i64,
        command: EventCommand,
    ) -> Result<ObjectDetails, Error> {
        let events = self
            .push_checked(
                vec![command],
                vec![ExpectedVersion {
                    aggregate: level.aggregate(ctx),
                    version: sequence,
                }],
            )
            .await?;
        let event = events.last().expect("push returns the stored events");
        Ok(ObjectDetails {
            sequence: event.aggregate_version,
            event_date: event.created_at,
            resource_owner: event.owner.clone(),
        })
    }

    pub async fn add_org_login_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: LoginPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.existing_org(ctx, org_id).await?;
        let policy = &policy;
        let level = PolicyLevel::Org(org_id.to_owned());
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            if fold.policy.is_some() {
                return Err(Error::already_exists("COMMAND-Login01a", "login policy already exists"));
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), ORG_LOGIN_POLICY_ADDED, ctx.creator()).with_payload(policy)?,
            )
            .await
        })
        .await
    }

    /// Replaces the org login policy wholesale, factor lists included.
    /// Setting the current value emits nothing.
    pub async fn change_org_login_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: LoginPolicy,
    ) -> Result<ObjectDetails, Error> {
        self.existing_org(ctx, org_id).await?;
        let policy = &policy;
        let level = PolicyLevel::Org(org_id.to_owned());
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            let current = fold
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Login02a", "login policy not found"))?;
            if current == policy {
                let model: OrgLoginPolicyWriteModel =
                    writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
                return Ok(model.object_details());
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), ORG_LOGIN_POLICY_CHANGED, ctx.creator())
                    .with_payload(policy)?,
            )
            .await
        })
        .await
    }

    pub async fn remove_org_login_policy(&self, ctx: &Context, org_id: &str) -> Result<ObjectDetails, Error> {
        self.existing_org(ctx, org_id).await?;
        let level = PolicyLevel::Org(org_id.to_owned());
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            if fold.policy.is_none() {
                return Err(Error::not_found("COMMAND-Login03a", "login policy not found"));
            }
            self.check_permission(ctx, "policy", permissions::POLICY_DELETE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), ORG_LOGIN_POLICY_REMOVED, ctx.creator()),
            )
            .await
        })
        .await
    }

    /// Enables a second factor on the org login policy.
    pub async fn add_second_factor_to_org_login_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        factor: SecondFactorType,
    ) -> Result<ObjectDetails, Error> {
        self.existing_org(ctx, org_id).await?;
        let level = PolicyLevel::Org(org_id.to_owned());
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            let policy = fold
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Login04a", "login policy not found"))?;
            if policy.second_factors.contains(&factor) {
                return Err(Error::already_exists("COMMAND-Login04b", "second factor already enabled"));
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), ORG_LOGIN_POLICY_SECOND_FACTOR_ADDED, ctx.creator())
                    .with_payload(&SecondFactorPayload { factor })?,
            )
            .await
        })
        .await
    }

    /// Disables a second factor. Removing a factor that is not enabled
    /// succeeds without an event.
    pub async fn remove_second_factor_from_org_login_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        factor: SecondFactorType,
    ) -> Result<ObjectDetails, Error> {
        self.existing_org(ctx, org_id).await?;
        let level = PolicyLevel::Org(org_id.to_owned());
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            let policy = fold
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Login05a", "login policy not found"))?;
            if !policy.second_factors.contains(&factor) {
                let model: OrgLoginPolicyWriteModel =
                    writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
                return Ok(model.object_details());
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), ORG_LOGIN_POLICY_SECOND_FACTOR_REMOVED, ctx.creator())
                    .with_payload(&SecondFactorPayload { factor })?,
            )
            .await
        })
        .await
    }

    /// Enables a multi factor on the org login policy.
    pub async fn add_multi_factor_to_org_login_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        factor: MultiFactorType,
    ) -> Result<ObjectDetails, Error> {
        self.existing_org(ctx, org_id).await?;
        let level = PolicyLevel::Org(org_id.to_owned());
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            let policy = fold
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Login06a", "login policy not found"))?;
            if policy.multi_factors.contains(&factor) {
                return Err(Error::already_exists("COMMAND-Login06b", "multi factor already enabled"));
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), ORG_LOGIN_POLICY_MULTI_FACTOR_ADDED, ctx.creator())
                    .with_payload(&MultiFactorPayload { factor })?,
            )
            .await
        })
        .await
    }

    /// Disables a multi factor. Removing a factor that is not enabled
    /// succeeds without an event.
    pub async fn remove_multi_factor_from_org_login_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        factor: MultiFactorType,
    ) -> Result<ObjectDetails, Error> {
        self.existing_org(ctx, org_id).await?;
        let level = PolicyLevel::Org(org_id.to_owned());
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            let policy = fold
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Login07a", "login policy not found"))?;
            if !policy.multi_factors.contains(&factor) {
                let model: OrgLoginPolicyWriteModel =
                    writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
                return Ok(model.object_details());
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), ORG_LOGIN_POLICY_MULTI_FACTOR_REMOVED, ctx.creator())
                    .with_payload(&MultiFactorPayload { factor })?,
            )
            .await
        })
        .await
    }

    pub async fn add_default_login_policy(&self, ctx: &Context, policy: LoginPolicy) -> Result<ObjectDetails, Error> {
        let policy = &policy;
        let level = PolicyLevel::Instance;
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            if fold.policy.is_some() {
                return Err(Error::already_exists("COMMAND-Login08a", "login policy already exists"));
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), INSTANCE_LOGIN_POLICY_ADDED, ctx.creator())
                    .with_payload(policy)?,
            )
            .await
        })
        .await
    }

    pub async fn change_default_login_policy(
        &self,
        ctx: &Context,
        policy: LoginPolicy,
    ) -> Result<ObjectDetails, Error> {
        let policy = &policy;
        let level = PolicyLevel::Instance;
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            let current = fold
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Login09a", "login policy not found"))?;
            if current == policy {
                let model: InstanceLoginPolicyWriteModel =
                    writemodel::load(self.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
                return Ok(model.object_details());
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), INSTANCE_LOGIN_POLICY_CHANGED, ctx.creator())
                    .with_payload(policy)?,
            )
            .await
        })
        .await
    }

    pub async fn add_second_factor_to_default_login_policy(
        &self,
        ctx: &Context,
        factor: SecondFactorType,
    ) -> Result<ObjectDetails, Error> {
        let level = PolicyLevel::Instance;
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            let policy = fold
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Login10a", "login policy not found"))?;
            if policy.second_factors.contains(&factor) {
                return Err(Error::already_exists("COMMAND-Login10b", "second factor already enabled"));
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), INSTANCE_LOGIN_POLICY_SECOND_FACTOR_ADDED, ctx.creator())
                    .with_payload(&SecondFactorPayload { factor })?,
            )
            .await
        })
        .await
    }

    pub async fn remove_second_factor_from_default_login_policy(
        &self,
        ctx: &Context,
        factor: SecondFactorType,
    ) -> Result<ObjectDetails, Error> {
        let level = PolicyLevel::Instance;
        let level = &level;
        retry_on_conflict(|| async move {
            let (fold, sequence) = self.login_policy_fold(ctx, &level).await?;
            let policy = fold
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Login11a", "login policy not found"))?;
            if !policy.second_factors.contains(&factor) {
                let model: InstanceLoginPolicyWriteModel =
                    writemodel::load(self.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
                return Ok(model.object_details());
            }
            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, level.scope()).await?;

            self.push_login_policy_event(
                ctx,
                &level,
                sequence,
                EventCommand::new(level.aggregate(ctx), INSTANCE_LOGIN_POLICY_SECOND_FACTOR_REMOVED, ctx.creator())
                    .with_payload(&SecondFactorPayload { factor })?,
            )
            .await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::command::test_support::{commands, system_ctx};
    use crate::command::AddOrg;
    use crate::policy::{LoginPolicy, SecondFactorType};

    #[tokio::test]
    async fn second_factor_round_trip() {
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

        commands
            .add_org_login_policy(&ctx, "org1", LoginPolicy::default())
            .await
            .unwrap();

        // Totp is part of the default factor set.
        let err = commands
            .add_second_factor_to_org_login_policy(&ctx, "org1", SecondFactorType::Totp)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        commands
            .add_second_factor_to_org_login_policy(&ctx, "org1", SecondFactorType::U2f)
            .await
            .unwrap();

        let removed = commands
            .remove_second_factor_from_org_login_policy(&ctx, "org1", SecondFactorType::U2f)
            .await
            .unwrap();

        // Removing a factor that is not enabled is an idempotent success.
        let again = commands
            .remove_second_factor_from_org_login_policy(&ctx, "org1", SecondFactorType::U2f)
            .await
            .unwrap();
        assert_eq!(removed.sequence, again.sequence);
    }

    #[tokio::test]
    async fn change_is_idempotent_including_factors() {
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

        commands
            .add_org_login_policy(&ctx, "org1", LoginPolicy::default())
            .await
            .unwrap();

        let unchanged = commands
            .change_org_login_policy(&ctx, "org1", LoginPolicy::default())
            .await
            .unwrap();

        let changed = commands
            .change_org_login_policy(
                &ctx,
                "org1",
                LoginPolicy {
                    force_mfa: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(changed.sequence, unchanged.sequence + 1);
    }

    #[tokio::test]
    async fn default_policy_with_factors() {
        let (commands, _) = commands();
        let ctx = system_ctx();

        commands
            .add_default_login_policy(&ctx, LoginPolicy::default())
            .await
            .unwrap();
        commands
            .add_second_factor_to_default_login_policy(&ctx, SecondFactorType::OtpEmail)
            .await
            .unwrap();

        let err = commands
            .add_second_factor_to_default_login_policy(&ctx, SecondFactorType::OtpEmail)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }
}
