use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::authz::{permissions, PermissionScope};
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::store::{ExpectedVersion, StoreError};
use crate::types::ObjectDetails;
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::org::{org_aggregate, AGGREGATE_TYPE_ORG};
use super::user::UserWriteModel;
use super::{retry_on_conflict, validate, Commands, Context};

pub(crate) const ORG_MEMBER_ADDED: &str = "org.member.added";
pub(crate) const ORG_MEMBER_CHANGED: &str = "org.member.changed";
pub(crate) const ORG_MEMBER_REMOVED: &str = "org.member.removed";

pub const ORG_OWNER_ROLE: &str = "ORG_OWNER";
pub const ORG_USER_MANAGER_ROLE: &str = "ORG_USER_MANAGER";

const KNOWN_ROLES: &[&str] = &[ORG_OWNER_ROLE, ORG_USER_MANAGER_ROLE];

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MemberPayload {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MemberRemovedPayload {
    pub user_id: String,
}

/// A membership as passed to the member commands.
#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: String,
    pub roles: Vec<String>,
}

/// Fold of one organization's membership, over the org aggregate.
#[derive(Default)]
pub(crate) struct OrgMembersWriteModel {
    base: WriteModelBase,
    members: HashMap<String, Vec<String>>,
}

impl OrgMembersWriteModel {
    fn roles_of(&self, user_id: &str) -> Option<&Vec<String>> {
        self.members.get(user_id)
    }
}

impl WriteModel for OrgMembersWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_ORG;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        match event.event_type.as_str() {
            ORG_MEMBER_ADDED | ORG_MEMBER_CHANGED => {
                let payload: MemberPayload = event.payload_as()?;
                self.members.insert(payload.user_id, payload.roles);
            }
            ORG_MEMBER_REMOVED => {
                let payload: MemberRemovedPayload = event.payload_as()?;
                self.members.remove(&payload.user_id);
            }
            _ => {}
        }
        Ok(())
    }
}

fn validate_roles(roles: &[String]) -> Result<(), Error> {
    if roles.is_empty() {
        return Err(Error::invalid_argument("COMMAND-Mem01a", "at least one role is required"));
    }
    for role in roles {
        if !KNOWN_ROLES.contains(&role.as_str()) {
            return Err(Error::invalid_argument(
                "COMMAND-Mem01b",
                format!("unknown role: {role}"),
            ));
        }
    }
    Ok(())
}

fn normalized(roles: &[String]) -> Vec<String> {
    let mut roles: Vec<String> = roles.to_vec();
    roles.sort();
    roles.dedup();
    roles
}

impl Commands {
    /// Grants a user membership of the organization.
    #[tracing::instrument(skip_all, fields(instance_id = %ctx.instance_id, org_id), err)]
    pub async fn add_org_member(&self, ctx: &Context, org_id: &str, member: Member) -> Result<ObjectDetails, Error> {
        validate::not_empty(&member.user_id, "COMMAND-Mem02a", "user id")?;
        validate_roles(&member.roles)?;

        let member = &member;
        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;

            let user: UserWriteModel = writemodel::load(self.eventstore(), &ctx.instance_id, &member.user_id).await?;
            if !user.exists_and_not_removed() {
                return Err(Error::not_found("COMMAND-Mem02b", "user not found"));
            }

            let mut model: OrgMembersWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            if model.roles_of(&member.user_id).is_some() {
                return Err(Error::already_exists("COMMAND-Mem02c", "member already exists"));
            }

            self.check_permission(
                ctx,
                "org.member",
                permissions::ORG_MEMBER_WRITE,
                PermissionScope::Org(org_id.to_owned()),
            )
            .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(org_aggregate(ctx, org_id), ORG_MEMBER_ADDED, ctx.creator()).with_payload(
                            &MemberPayload {
                                user_id: member.user_id.clone(),
                                roles: normalized(&member.roles),
                            },
                        )?,
                    ],
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

    /// Replaces a member's roles. Setting the current role set emits
    /// nothing and returns the unchanged summary.
    pub async fn change_org_member(&self, ctx: &Context, org_id: &str, member: Member) -> Result<ObjectDetails, Error> {
        validate::not_empty(&member.user_id, "COMMAND-Mem03a", "user id")?;
        validate_roles(&member.roles)?;

        let member = &member;
        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;
            let mut model: OrgMembersWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            let current = model
                .roles_of(&member.user_id)
                .ok_or_else(|| Error::not_found("COMMAND-Mem03b", "member not found"))?;

            let roles = normalized(&member.roles);
            if *current == roles {
                return Ok(model.object_details());
            }

            self.check_permission(
                ctx,
                "org.member",
                permissions::ORG_MEMBER_WRITE,
                PermissionScope::Org(org_id.to_owned()),
            )
            .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(org_aggregate(ctx, org_id), ORG_MEMBER_CHANGED, ctx.creator())
                            .with_payload(&MemberPayload {
                                user_id: member.user_id.clone(),
                                roles,
                            })?,
                    ],
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

    /// Revokes a membership. Removing a non-member succeeds without an
    /// event.
    pub async fn remove_org_member(&self, ctx: &Context, org_id: &str, user_id: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;
            let mut model: OrgMembersWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            if model.roles_of(user_id).is_none() {
                return Ok(model.object_details());
            }

            self.check_permission(
                ctx,
                "org.member",
                permissions::ORG_MEMBER_DELETE,
                PermissionScope::Org(org_id.to_owned()),
            )
            .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(org_aggregate(ctx, org_id), ORG_MEMBER_REMOVED, ctx.creator())
                            .with_payload(&MemberRemovedPayload {
                                user_id: user_id.to_owned(),
                            })?,
                    ],
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
}

#[cfg(test)]
mod tests {
    use crate::command::test_support::{commands, system_ctx};
    use crate::command::user::tests_support::add_active_user;
    use crate::command::{AddOrg, Member};
    use crate::error::Error;
    use crate::store::{EventFilter, Eventstore};

    use super::{ORG_OWNER_ROLE, ORG_USER_MANAGER_ROLE};

    async fn setup() -> (crate::command::Commands, std::sync::Arc<crate::store::memory::InMemoryEventStore>, String) {
        let (commands, store) = commands();
        let ctx = system_ctx();
        let org_id = commands
            .add_org(
                &ctx,
                AddOrg {
                    org_id: Some("org1".to_owned()),
                    name: "Acme".to_owned(),
                },
            )
            .await
            .unwrap()
            .org_id;
        add_active_user(&commands, &ctx, "u1", &org_id).await;
        (commands, store, org_id)
    }

    fn owner(user_id: &str) -> Member {
        Member {
            user_id: user_id.to_owned(),
            roles: vec![ORG_OWNER_ROLE.to_owned()],
        }
    }

    #[tokio::test]
    async fn member_lifecycle() {
        let (commands, store, org_id) = setup().await;
        let ctx = system_ctx();

        commands.add_org_member(&ctx, &org_id, owner("u1")).await.unwrap();

        let err = commands.add_org_member(&ctx, &org_id, owner("u1")).await.unwrap_err();
        assert!(err.is_already_exists());

        // Same roles: no event, same sequence.
        let before = commands.change_org_member(&ctx, &org_id, owner("u1")).await.unwrap();

        let after = commands
            .change_org_member(
                &ctx,
                &org_id,
                Member {
                    user_id: "u1".to_owned(),
                    roles: vec![ORG_USER_MANAGER_ROLE.to_owned()],
                },
            )
            .await
            .unwrap();
        assert_eq!(after.sequence, before.sequence + 1);

        commands.remove_org_member(&ctx, &org_id, "u1").await.unwrap();

        // Removing again is an idempotent success.
        let details = commands.remove_org_member(&ctx, &org_id, "u1").await.unwrap();
        assert_eq!(details.sequence, after.sequence + 1);

        let events = store
            .filter(
                &EventFilter::builder()
                    .instance_id("inst1")
                    .event_types(vec![
                        "org.member.added".to_owned(),
                        "org.member.changed".to_owned(),
                        "org.member.removed".to_owned(),
                    ])
                    .build(),
            )
            .await
            .unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["org.member.added", "org.member.changed", "org.member.removed"]);
    }

    #[tokio::test]
    async fn member_requires_existing_user() {
        let (commands, _, org_id) = setup().await;
        let ctx = system_ctx();

        let err = commands.add_org_member(&ctx, &org_id, owner("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn unknown_roles_are_rejected() {
        let (commands, _, org_id) = setup().await;
        let ctx = system_ctx();

        let err = commands
            .add_org_member(
                &ctx,
                &org_id,
                Member {
                    user_id: "u1".to_owned(),
                    roles: vec!["GALACTIC_EMPEROR".to_owned()],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn change_of_missing_member_is_not_found() {
        let (commands, _, org_id) = setup().await;
        let ctx = system_ctx();

        let err = commands.change_org_member(&ctx, &org_id, owner("u1")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
