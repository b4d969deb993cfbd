//! Policy commands: instance defaults plus org overrides for every policy
//! family. At most one default row and one org row may exist per family.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::authz::{permissions, PermissionScope};
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::store::{ExpectedVersion, StoreError};
use crate::types::ObjectDetails;
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::org::{instance_aggregate, org_aggregate, AGGREGATE_TYPE_INSTANCE, AGGREGATE_TYPE_ORG};
use super::{retry_on_conflict, Commands, Context};

mod complexity;
mod lockout;
mod login;
mod misc;

pub(crate) use complexity::effective_password_complexity;

/// Event vocabulary of every policy family.
pub(crate) mod events {
    pub(crate) use super::complexity::{
        INSTANCE_PASSWORD_COMPLEXITY_POLICY_ADDED, INSTANCE_PASSWORD_COMPLEXITY_POLICY_CHANGED,
        ORG_PASSWORD_COMPLEXITY_POLICY_ADDED, ORG_PASSWORD_COMPLEXITY_POLICY_CHANGED,
        ORG_PASSWORD_COMPLEXITY_POLICY_REMOVED,
    };
    pub(crate) use super::lockout::{
        INSTANCE_LOCKOUT_POLICY_ADDED, INSTANCE_LOCKOUT_POLICY_CHANGED, ORG_LOCKOUT_POLICY_ADDED,
        ORG_LOCKOUT_POLICY_CHANGED, ORG_LOCKOUT_POLICY_REMOVED,
    };
    pub(crate) use super::login::{
        MultiFactorPayload, SecondFactorPayload, INSTANCE_LOGIN_POLICY_ADDED, INSTANCE_LOGIN_POLICY_CHANGED,
        INSTANCE_LOGIN_POLICY_SECOND_FACTOR_ADDED, INSTANCE_LOGIN_POLICY_SECOND_FACTOR_REMOVED,
        ORG_LOGIN_POLICY_ADDED, ORG_LOGIN_POLICY_CHANGED, ORG_LOGIN_POLICY_MULTI_FACTOR_ADDED,
        ORG_LOGIN_POLICY_MULTI_FACTOR_REMOVED, ORG_LOGIN_POLICY_REMOVED, ORG_LOGIN_POLICY_SECOND_FACTOR_ADDED,
        ORG_LOGIN_POLICY_SECOND_FACTOR_REMOVED,
    };
    pub(crate) use super::misc::{
        INSTANCE_DOMAIN_POLICY_ADDED, INSTANCE_DOMAIN_POLICY_CHANGED, INSTANCE_NOTIFICATION_POLICY_ADDED,
        INSTANCE_NOTIFICATION_POLICY_CHANGED, INSTANCE_PRIVACY_POLICY_ADDED, INSTANCE_PRIVACY_POLICY_CHANGED,
        INSTANCE_SECURITY_POLICY_SET, ORG_DOMAIN_POLICY_ADDED, ORG_DOMAIN_POLICY_CHANGED, ORG_DOMAIN_POLICY_REMOVED,
        ORG_NOTIFICATION_POLICY_ADDED, ORG_NOTIFICATION_POLICY_CHANGED, ORG_NOTIFICATION_POLICY_REMOVED,
        ORG_PRIVACY_POLICY_ADDED, ORG_PRIVACY_POLICY_CHANGED, ORG_PRIVACY_POLICY_REMOVED,
    };
}

/// One policy family's event vocabulary.
pub(crate) trait PolicyFamily: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync {
    const ORG_ADDED: &'static str;
    const ORG_CHANGED: &'static str;
    const ORG_REMOVED: &'static str;
    const INSTANCE_ADDED: &'static str;
    const INSTANCE_CHANGED: &'static str;
}

/// Fold of one org's override for a policy family.
pub(crate) struct OrgPolicyWriteModel<F> {
    base: WriteModelBase,
    pub policy: Option<F>,
}

impl<F> Default for OrgPolicyWriteModel<F> {
    fn default() -> Self {
        Self {
            base: WriteModelBase::default(),
            policy: None,
        }
    }
}

impl<F: PolicyFamily> WriteModel for OrgPolicyWriteModel<F> {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_ORG;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        let event_type = event.event_type.as_str();
        if event_type == F::ORG_ADDED || event_type == F::ORG_CHANGED {
            self.policy = Some(event.payload_as()?);
        } else if event_type == F::ORG_REMOVED {
            self.policy = None;
        }
        Ok(())
    }
}

/// Fold of the instance default for a policy family.
pub(crate) struct InstancePolicyWriteModel<F> {
    base: WriteModelBase,
    pub policy: Option<F>,
}

impl<F> Default for InstancePolicyWriteModel<F> {
    fn default() -> Self {
        Self {
            base: WriteModelBase::default(),
            policy: None,
        }
    }
}

impl<F: PolicyFamily> WriteModel for InstancePolicyWriteModel<F> {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_INSTANCE;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        let event_type = event.event_type.as_str();
        if event_type == F::INSTANCE_ADDED || event_type == F::INSTANCE_CHANGED {
            self.policy = Some(event.payload_as()?);
        }
        Ok(())
    }
}

impl Commands {
    pub(crate) async fn add_org_policy<F: PolicyFamily>(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: F,
    ) -> Result<ObjectDetails, Error> {
        let policy = &policy;
        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;
            let mut model: OrgPolicyWriteModel<F> =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            if model.policy.is_some() {
                return Err(Error::already_exists("COMMAND-Pol01a", "policy already exists"));
            }

            self.check_permission(
                ctx,
                "policy",
                permissions::POLICY_WRITE,
                PermissionScope::Org(org_id.to_owned()),
            )
            .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(org_aggregate(ctx, org_id), F::ORG_ADDED, ctx.creator())
                        .with_payload(policy)?],
                    vec![ExpectedVersion {
                        aggregate: org_aggregate(ctx, org_id),
                        version: model.base().sequence,
                    }],
                )
                .await?;

            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(model.object_details())
        })
        .await
    }

    pub(crate) async fn change_org_policy<F: PolicyFamily>(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: F,
    ) -> Result<ObjectDetails, Error> {
        let policy = &policy;
        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;
            let mut model: OrgPolicyWriteModel<F> =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            let current = model
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Pol02a", "policy not found"))?;
            if current == policy {
                return Ok(model.object_details());
            }

            self.check_permission(
                ctx,
                "policy",
                permissions::POLICY_WRITE,
                PermissionScope::Org(org_id.to_owned()),
            )
            .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(org_aggregate(ctx, org_id), F::ORG_CHANGED, ctx.creator())
                        .with_payload(policy)?],
                    vec![ExpectedVersion {
                        aggregate: org_aggregate(ctx, org_id),
                        version: model.base().sequence,
                    }],
                )
                .await?;

            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(model.object_details())
        })
        .await
    }

    pub(crate) async fn remove_org_policy<F: PolicyFamily>(
        &self,
        ctx: &Context,
        org_id: &str,
    ) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;
            let mut model: OrgPolicyWriteModel<F> =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            if model.policy.is_none() {
                return Err(Error::not_found("COMMAND-Pol03a", "policy not found"));
            }

            self.check_permission(
                ctx,
                "policy",
                permissions::POLICY_DELETE,
                PermissionScope::Org(org_id.to_owned()),
            )
            .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(org_aggregate(ctx, org_id), F::ORG_REMOVED, ctx.creator())],
                    vec![ExpectedVersion {
                        aggregate: org_aggregate(ctx, org_id),
                        version: model.base().sequence,
                    }],
                )
                .await?;

            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(model.object_details())
        })
        .await
    }

    pub(crate) async fn add_default_policy<F: PolicyFamily>(
        &self,
        ctx: &Context,
        policy: F,
    ) -> Result<ObjectDetails, Error> {
        let policy = &policy;
        retry_on_conflict(|| async move {
            let mut model: InstancePolicyWriteModel<F> =
                writemodel::load(self.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
            if model.policy.is_some() {
                return Err(Error::already_exists("COMMAND-Pol04a", "policy already exists"));
            }

            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, PermissionScope::Instance)
                .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(instance_aggregate(ctx), F::INSTANCE_ADDED, ctx.creator())
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

    pub(crate) async fn change_default_policy<F: PolicyFamily>(
        &self,
        ctx: &Context,
        policy: F,
    ) -> Result<ObjectDetails, Error> {
        let policy = &policy;
        retry_on_conflict(|| async move {
            let mut model: InstancePolicyWriteModel<F> =
                writemodel::load(self.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
            let current = model
                .policy
                .as_ref()
                .ok_or_else(|| Error::not_found("COMMAND-Pol05a", "policy not found"))?;
            if current == policy {
                return Ok(model.object_details());
            }

            self.check_permission(ctx, "policy", permissions::POLICY_WRITE, PermissionScope::Instance)
                .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(instance_aggregate(ctx), F::INSTANCE_CHANGED, ctx.creator())
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
