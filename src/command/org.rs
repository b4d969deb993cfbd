use serde::{Deserialize, Serialize};

use crate::authz::{permissions, PermissionScope};
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::store::{ExpectedVersion, StoreError};
use crate::types::{Aggregate, ObjectDetails};
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::org_domain::{DomainPayload, ORG_DOMAIN_ADDED, ORG_DOMAIN_PRIMARY_SET, ORG_DOMAIN_VERIFIED};
use super::org_member::{MemberPayload, ORG_MEMBER_ADDED, ORG_OWNER_ROLE};
use super::user::{HumanAddedPayload, AGGREGATE_TYPE_USER, USER_HUMAN_ADDED};
use super::{retry_on_conflict, validate, Commands, Context};

pub(crate) const AGGREGATE_TYPE_ORG: &str = "org";
pub(crate) const AGGREGATE_TYPE_INSTANCE: &str = "instance";

pub(crate) const ORG_ADDED: &str = "org.added";
pub(crate) const ORG_CHANGED: &str = "org.changed";
pub(crate) const ORG_DEACTIVATED: &str = "org.deactivated";
pub(crate) const ORG_REACTIVATED: &str = "org.reactivated";
pub(crate) const ORG_REMOVED: &str = "org.removed";
pub(crate) const INSTANCE_DEFAULT_ORG_SET: &str = "instance.default.org.set";

const MAX_ORG_NAME_LEN: usize = 200;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct OrgNamePayload {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DefaultOrgPayload {
    pub org_id: String,
}

pub(crate) fn org_aggregate(ctx: &Context, org_id: &str) -> Aggregate {
    Aggregate::new(&ctx.instance_id, AGGREGATE_TYPE_ORG, org_id, org_id)
}

pub(crate) fn instance_aggregate(ctx: &Context) -> Aggregate {
    Aggregate::instance_owned(&ctx.instance_id, AGGREGATE_TYPE_INSTANCE, &ctx.instance_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum OrgState {
    #[default]
    Unspecified,
    Active,
    Inactive,
    Removed,
}

/// Fold of one organization's lifecycle events.
#[derive(Default)]
pub(crate) struct OrgWriteModel {
    base: WriteModelBase,
    pub state: OrgState,
    pub name: String,
}

impl OrgWriteModel {
    pub fn is_usable(&self) -> bool {
        matches!(self.state, OrgState::Active | OrgState::Inactive)
    }
}

impl WriteModel for OrgWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_ORG;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        match event.event_type.as_str() {
            ORG_ADDED => {
                let payload: OrgNamePayload = event.payload_as()?;
                self.name = payload.name;
                self.state = OrgState::Active;
            }
            ORG_CHANGED => {
                let payload: OrgNamePayload = event.payload_as()?;
                self.name = payload.name;
            }
            ORG_DEACTIVATED => self.state = OrgState::Inactive,
            ORG_REACTIVATED => self.state = OrgState::Active,
            ORG_REMOVED => self.state = OrgState::Removed,
            _ => {}
        }
        Ok(())
    }
}

/// Fold of the instance aggregate tracking the default organization.
#[derive(Default)]
pub(crate) struct DefaultOrgWriteModel {
    base: WriteModelBase,
    pub default_org_id: Option<String>,
}

impl WriteModel for DefaultOrgWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_INSTANCE;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        if event.event_type == INSTANCE_DEFAULT_ORG_SET {
            let payload: DefaultOrgPayload = event.payload_as()?;
            self.default_org_id = Some(payload.org_id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AddOrg {
    pub org_id: Option<String>,
    pub name: String,
}

/// Outcome of [`Commands::add_org`] / [`Commands::setup_org`].
#[derive(Debug, Clone)]
pub struct OrgSetup {
    pub org_id: String,
    pub admin_user_ids: Vec<String>,
    pub details: ObjectDetails,
}

/// An administrator created as part of [`Commands::setup_org`].
#[derive(Debug, Clone)]
pub struct SetupAdmin {
    pub user_id: Option<String>,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct SetupOrg {
    pub org_id: Option<String>,
    pub name: String,
    pub custom_domain: Option<String>,
    pub admins: Vec<SetupAdmin>,
}

impl Commands {
    /// Creates an organization together with its instance-default domain,
    /// verified and primary from the start.
    #[tracing::instrument(skip_all, fields(instance_id = %ctx.instance_id), err)]
    pub async fn add_org(&self, ctx: &Context, org: AddOrg) -> Result<OrgSetup, Error> {
        validate::not_empty(&org.name, "COMMAND-Org01a", "organization name")?;
        validate::max_len(&org.name, MAX_ORG_NAME_LEN, "COMMAND-Org01b", "organization name")?;

        let org_id = match &org.org_id {
            Some(id) => id.clone(),
            None => self.next_id()?,
        };
        let name = org.name.trim().to_owned();

        let org_id = &org_id;
        let name = &name;
        retry_on_conflict(|| async move {
            let model: OrgWriteModel = writemodel::load(self.eventstore(), &ctx.instance_id, &org_id).await?;
            if model.exists() {
                return Err(Error::already_exists("COMMAND-Org02a", "organization already exists"));
            }

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Instance)
                .await?;

            let aggregate = org_aggregate(ctx, &org_id);
            let creator = ctx.creator();
            let commands = vec![
                EventCommand::new(aggregate.clone(), ORG_ADDED, creator)
                    .with_payload(&OrgNamePayload { name: name.clone() })?,
                EventCommand::new(aggregate.clone(), ORG_DOMAIN_ADDED, creator).with_payload(&DomainPayload {
                    domain: ctx.request_domain.clone(),
                })?,
                EventCommand::new(aggregate.clone(), ORG_DOMAIN_VERIFIED, creator).with_payload(&DomainPayload {
                    domain: ctx.request_domain.clone(),
                })?,
                EventCommand::new(aggregate.clone(), ORG_DOMAIN_PRIMARY_SET, creator).with_payload(&DomainPayload {
                    domain: ctx.request_domain.clone(),
                })?,
            ];

            let expected = vec![ExpectedVersion {
                aggregate,
                version: model.base().sequence,
            }];
            let events = self.push_checked(commands, expected).await?;

            let mut model = model;
            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(OrgSetup {
                org_id: org_id.clone(),
                admin_user_ids: vec![],
                details: model.object_details(),
            })
        })
        .await
    }

    /// Creates an organization, an optional custom domain, and its
    /// administrators in one atomic batch.
    ///
    /// The batch layout is fixed: the org event, then the three domain
    /// events when a custom domain is given, then per admin the user event
    /// followed by the membership event.
    #[tracing::instrument(skip_all, fields(instance_id = %ctx.instance_id), err)]
    pub async fn setup_org(&self, ctx: &Context, setup: SetupOrg) -> Result<OrgSetup, Error> {
        validate::not_empty(&setup.name, "COMMAND-Org03a", "organization name")?;
        validate::max_len(&setup.name, MAX_ORG_NAME_LEN, "COMMAND-Org03b", "organization name")?;
        if let Some(domain) = &setup.custom_domain {
            validate::domain(domain, "COMMAND-Org03c")?;
            if !self.domain_is_valid(domain) {
                return Err(Error::invalid_argument(
                    "COMMAND-Org03d",
                    format!("domain {domain} failed validation"),
                ));
            }
        }
        for admin in &setup.admins {
            validate::not_empty(&admin.username, "COMMAND-Org03e", "admin username")?;
            validate::email(&admin.email, "COMMAND-Org03f")?;
        }

        let org_id = match &setup.org_id {
            Some(id) => id.clone(),
            None => self.next_id()?,
        };
        let admin_ids: Vec<String> = setup
            .admins
            .iter()
            .map(|admin| match &admin.user_id {
                Some(id) => Ok(id.clone()),
                None => self.next_id(),
            })
            .collect::<Result<_, _>>()?;

        let setup = &setup;
        let org_id = &org_id;
        let admin_ids = &admin_ids;
        retry_on_conflict(|| async move {
            let model: OrgWriteModel = writemodel::load(self.eventstore(), &ctx.instance_id, &org_id).await?;
            if model.exists() {
                return Err(Error::already_exists("COMMAND-Org04a", "organization already exists"));
            }

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Instance)
                .await?;

            let aggregate = org_aggregate(ctx, &org_id);
            let creator = ctx.creator();

            let mut commands = vec![EventCommand::new(aggregate.clone(), ORG_ADDED, creator).with_payload(
                &OrgNamePayload {
                    name: setup.name.trim().to_owned(),
                },
            )?];
            let mut expected = vec![ExpectedVersion {
                aggregate: aggregate.clone(),
                version: model.base().sequence,
            }];

            if let Some(domain) = &setup.custom_domain {
                let payload = DomainPayload { domain: domain.clone() };
                commands.push(EventCommand::new(aggregate.clone(), ORG_DOMAIN_ADDED, creator).with_payload(&payload)?);
                commands
                    .push(EventCommand::new(aggregate.clone(), ORG_DOMAIN_VERIFIED, creator).with_payload(&payload)?);
                commands.push(
                    EventCommand::new(aggregate.clone(), ORG_DOMAIN_PRIMARY_SET, creator).with_payload(&payload)?,
                );
            }

            for (admin, user_id) in setup.admins.iter().zip(admin_ids.iter()) {
                let user_aggregate = Aggregate::new(&ctx.instance_id, AGGREGATE_TYPE_USER, user_id, org_id);
                commands.push(
                    EventCommand::new(user_aggregate.clone(), USER_HUMAN_ADDED, creator).with_payload(
                        &HumanAddedPayload {
                            username: admin.username.clone(),
                            first_name: admin.first_name.clone(),
                            last_name: admin.last_name.clone(),
                            email: admin.email.clone(),
                            email_verified: true,
                            phone: None,
                            password_hash: None,
                        },
                    )?,
                );
                commands.push(EventCommand::new(aggregate.clone(), ORG_MEMBER_ADDED, creator).with_payload(
                    &MemberPayload {
                        user_id: user_id.clone(),
                        roles: vec![ORG_OWNER_ROLE.to_owned()],
                    },
                )?);
                expected.push(ExpectedVersion {
                    aggregate: user_aggregate,
                    version: 0,
                });
            }

            let events = self.push_checked(commands, expected).await?;

            let mut model = model;
            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(OrgSetup {
                org_id: org_id.clone(),
                admin_user_ids: admin_ids.clone(),
                details: model.object_details(),
            })
        })
        .await
    }

    /// Renames an organization. Renaming to the current name emits nothing.
    pub async fn change_org(&self, ctx: &Context, org_id: &str, name: &str) -> Result<ObjectDetails, Error> {
        validate::not_empty(name, "COMMAND-Org05a", "organization name")?;
        validate::max_len(name, MAX_ORG_NAME_LEN, "COMMAND-Org05b", "organization name")?;
        let name = name.trim().to_owned();

        let name = &name;
        retry_on_conflict(|| async move {
            let mut model = self.existing_org(ctx, org_id).await?;

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Org(org_id.to_owned()))
                .await?;

            if model.name == *name {
                return Ok(model.object_details());
            }

            let events = self
                .push_checked(
                    vec![EventCommand::new(org_aggregate(ctx, org_id), ORG_CHANGED, ctx.creator())
                        .with_payload(&OrgNamePayload { name: name.clone() })?],
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

    pub async fn deactivate_org(&self, ctx: &Context, org_id: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            let mut model = self.existing_org(ctx, org_id).await?;
            if model.state == OrgState::Inactive {
                return Err(Error::precondition_failed(
                    "COMMAND-Org06a",
                    "organization is already deactivated",
                ));
            }

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Org(org_id.to_owned()))
                .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(org_aggregate(ctx, org_id), ORG_DEACTIVATED, ctx.creator())],
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

    pub async fn reactivate_org(&self, ctx: &Context, org_id: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            let mut model = self.existing_org(ctx, org_id).await?;
            if model.state == OrgState::Active {
                return Err(Error::precondition_failed(
                    "COMMAND-Org07a",
                    "organization is already active",
                ));
            }

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Org(org_id.to_owned()))
                .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(org_aggregate(ctx, org_id), ORG_REACTIVATED, ctx.creator())],
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

    /// Removes an organization. The instance's default organization cannot
    /// be removed.
    pub async fn remove_org(&self, ctx: &Context, org_id: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            let mut model = self.existing_org(ctx, org_id).await?;

            let default_org: DefaultOrgWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
            if default_org.default_org_id.as_deref() == Some(org_id) {
                return Err(Error::precondition_failed(
                    "COMMAND-Org08a",
                    "the default organization cannot be removed",
                ));
            }

            self.check_permission(ctx, "org", permissions::ORG_DELETE, PermissionScope::Org(org_id.to_owned()))
                .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(org_aggregate(ctx, org_id), ORG_REMOVED, ctx.creator())],
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

    /// Marks an organization as the instance default.
    pub async fn set_default_org(&self, ctx: &Context, org_id: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            let org = self.existing_org(ctx, org_id).await?;
            if org.state != OrgState::Active {
                return Err(Error::precondition_failed(
                    "COMMAND-Org09a",
                    "only active organizations can become the default",
                ));
            }

            let mut model: DefaultOrgWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
            if model.default_org_id.as_deref() == Some(org_id) {
                return Ok(model.object_details());
            }

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Instance)
                .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(instance_aggregate(ctx), INSTANCE_DEFAULT_ORG_SET, ctx.creator())
                            .with_payload(&DefaultOrgPayload {
                                org_id: org_id.to_owned(),
                            })?,
                    ],
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

    /// Loads an org write model, failing when the org never existed or was
    /// removed.
    pub(crate) async fn existing_org(&self, ctx: &Context, org_id: &str) -> Result<OrgWriteModel, Error> {
        let model: OrgWriteModel = writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
        if !model.exists() || !model.is_usable() {
            return Err(Error::not_found("COMMAND-Org10a", "organization not found"));
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use crate::command::test_support::{commands, system_ctx};
    use crate::command::{AddOrg, SetupAdmin, SetupOrg};
    use crate::store::{EventFilter, Eventstore};

    use super::*;

    #[tokio::test]
    async fn add_org_stages_default_domain() {
        let (commands, store) = commands();
        let ctx = system_ctx();

        let created = commands
            .add_org(
                &ctx,
                AddOrg {
                    org_id: None,
                    name: "Acme".to_owned(),
                },
            )
            .await
            .unwrap();

        assert_eq!(created.details.sequence, 4);
        assert_eq!(created.details.resource_owner, created.org_id);

        let events = store
            .filter(&EventFilter::for_aggregate(AGGREGATE_TYPE_ORG, "inst1", &created.org_id))
            .await
            .unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["org.added", "org.domain.added", "org.domain.verified", "org.domain.primary.set"]
        );
        assert_eq!(events[1].payload["domain"], "localhost");
        assert_eq!(events[0].creator, "system");
    }

    #[tokio::test]
    async fn add_org_twice_is_already_exists() {
        let (commands, _) = commands();
        let ctx = system_ctx();

        let org = AddOrg {
            org_id: Some("x".to_owned()),
            name: "A".to_owned(),
        };
        commands.add_org(&ctx, org.clone()).await.unwrap();

        let err = commands.add_org(&ctx, org).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn add_then_remove_then_add_same_id_fails() {
        let (commands, _) = commands();
        let ctx = system_ctx();

        let org = AddOrg {
            org_id: Some("org1".to_owned()),
            name: "Acme".to_owned(),
        };
        commands.add_org(&ctx, org.clone()).await.unwrap();
        commands.remove_org(&ctx, "org1").await.unwrap();

        // The aggregate keeps its history: the id is burned.
        let err = commands.add_org(&ctx, org).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn setup_org_event_count_follows_the_law() {
        let (commands, store) = commands();
        let ctx = system_ctx();

        let admins = vec![
            SetupAdmin {
                user_id: None,
                username: "root".to_owned(),
                first_name: "Ada".to_owned(),
                last_name: "Root".to_owned(),
                email: "ada@acme.com".to_owned(),
            },
            SetupAdmin {
                user_id: None,
                username: "ops".to_owned(),
                first_name: "Grace".to_owned(),
                last_name: "Ops".to_owned(),
                email: "grace@acme.com".to_owned(),
            },
        ];

        let created = commands
            .setup_org(
                &ctx,
                SetupOrg {
                    org_id: None,
                    name: "Acme".to_owned(),
                    custom_domain: Some("acme.com".to_owned()),
                    admins,
                },
            )
            .await
            .unwrap();

        assert_eq!(created.admin_user_ids.len(), 2);

        let all = store
            .filter(&EventFilter::builder().instance_id("inst1").build())
            .await
            .unwrap();
        // 1 + 3 (custom domain) + 2·2 admins
        assert_eq!(all.len(), 8);
        // One atomic batch: one global position.
        assert!(all.windows(2).all(|w| w[0].position.global == w[1].position.global));

        let types: Vec<&str> = all.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "org.added",
                "org.domain.added",
                "org.domain.verified",
                "org.domain.primary.set",
                "user.human.added",
                "org.member.added",
                "user.human.added",
                "org.member.added",
            ]
        );
    }

    #[tokio::test]
    async fn setup_org_without_custom_domain_skips_domain_events() {
        let (commands, store) = commands();
        let ctx = system_ctx();

        commands
            .setup_org(
                &ctx,
                SetupOrg {
                    org_id: Some("org1".to_owned()),
                    name: "Acme".to_owned(),
                    custom_domain: None,
                    admins: vec![],
                },
            )
            .await
            .unwrap();

        let all = store
            .filter(&EventFilter::builder().instance_id("inst1").build())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].event_type, "org.added");
    }

    #[tokio::test]
    async fn org_state_machine() {
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

        let err = commands.reactivate_org(&ctx, "org1").await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));

        commands.deactivate_org(&ctx, "org1").await.unwrap();
        let err = commands.deactivate_org(&ctx, "org1").await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));

        commands.reactivate_org(&ctx, "org1").await.unwrap();
        commands.remove_org(&ctx, "org1").await.unwrap();

        // Commands on a removed org fail with NotFound.
        let err = commands.deactivate_org(&ctx, "org1").await.unwrap_err();
        assert!(err.is_not_found());
        let err = commands.remove_org(&ctx, "org1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn default_org_cannot_be_removed() {
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
        commands.set_default_org(&ctx, "org1").await.unwrap();

        let err = commands.remove_org(&ctx, "org1").await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn change_org_is_idempotent_on_same_name() {
        let (commands, store) = commands();
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

        let details = commands.change_org(&ctx, "org1", "Acme").await.unwrap();
        assert_eq!(details.sequence, 4);

        let details = commands.change_org(&ctx, "org1", "Acme Inc").await.unwrap();
        assert_eq!(details.sequence, 5);

        let events = store
            .filter(&EventFilter::for_aggregate(AGGREGATE_TYPE_ORG, "inst1", "org1"))
            .await
            .unwrap();
        assert_eq!(events.last().unwrap().event_type, "org.changed");
    }
}
