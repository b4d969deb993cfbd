use serde::{Deserialize, Serialize};

use crate::authz::{permissions, PermissionScope};
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::store::{ExpectedVersion, StoreError};
use crate::types::ObjectDetails;
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::org::{org_aggregate, AGGREGATE_TYPE_ORG};
use super::{retry_on_conflict, validate, Commands, Context};

pub(crate) const ORG_DOMAIN_ADDED: &str = "org.domain.added";
pub(crate) const ORG_DOMAIN_VERIFIED: &str = "org.domain.verified";
pub(crate) const ORG_DOMAIN_PRIMARY_SET: &str = "org.domain.primary.set";
pub(crate) const ORG_DOMAIN_REMOVED: &str = "org.domain.removed";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DomainPayload {
    pub domain: String,
}

#[derive(Debug, Clone, Default)]
struct DomainEntry {
    domain: String,
    verified: bool,
    primary: bool,
}

/// Fold of one organization's domain set, over the org aggregate.
#[derive(Default)]
pub(crate) struct OrgDomainsWriteModel {
    base: WriteModelBase,
    domains: Vec<DomainEntry>,
}

impl OrgDomainsWriteModel {
    fn entry(&self, domain: &str) -> Option<&DomainEntry> {
        self.domains.iter().find(|entry| entry.domain == domain)
    }

    fn entry_mut(&mut self, domain: &str) -> Option<&mut DomainEntry> {
        self.domains.iter_mut().find(|entry| entry.domain == domain)
    }
}

impl WriteModel for OrgDomainsWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_ORG;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        match event.event_type.as_str() {
            ORG_DOMAIN_ADDED => {
                let payload: DomainPayload = event.payload_as()?;
                self.domains.push(DomainEntry {
                    domain: payload.domain,
                    verified: false,
                    primary: false,
                });
            }
            ORG_DOMAIN_VERIFIED => {
                let payload: DomainPayload = event.payload_as()?;
                if let Some(entry) = self.entry_mut(&payload.domain) {
                    entry.verified = true;
                }
            }
            ORG_DOMAIN_PRIMARY_SET => {
                let payload: DomainPayload = event.payload_as()?;
                for entry in &mut self.domains {
                    entry.primary = entry.domain == payload.domain;
                }
            }
            ORG_DOMAIN_REMOVED => {
                let payload: DomainPayload = event.payload_as()?;
                self.domains.retain(|entry| entry.domain != payload.domain);
            }
            _ => {}
        }
        Ok(())
    }
}

impl Commands {
    /// Stages a new, unverified domain on the organization.
    #[tracing::instrument(skip_all, fields(instance_id = %ctx.instance_id, org_id, domain), err)]
    pub async fn add_org_domain(&self, ctx: &Context, org_id: &str, domain: &str) -> Result<ObjectDetails, Error> {
        validate::domain(domain, "COMMAND-Dom01a")?;
        if !self.domain_is_valid(domain) {
            return Err(Error::invalid_argument(
                "COMMAND-Dom01b",
                format!("domain {domain} failed validation"),
            ));
        }

        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;
            let mut model: OrgDomainsWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            if model.entry(domain).is_some() {
                return Err(Error::already_exists("COMMAND-Dom02a", "domain already exists"));
            }

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Org(org_id.to_owned()))
                .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(org_aggregate(ctx, org_id), ORG_DOMAIN_ADDED, ctx.creator()).with_payload(
                            &DomainPayload {
                                domain: domain.to_owned(),
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

    /// Marks a staged domain as verified. Verifying an already verified
    /// domain emits nothing.
    pub async fn verify_org_domain(&self, ctx: &Context, org_id: &str, domain: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;
            let mut model: OrgDomainsWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            let entry = model
                .entry(domain)
                .ok_or_else(|| Error::not_found("COMMAND-Dom03a", "domain not found"))?;
            if entry.verified {
                return Ok(model.object_details());
            }

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Org(org_id.to_owned()))
                .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(org_aggregate(ctx, org_id), ORG_DOMAIN_VERIFIED, ctx.creator())
                            .with_payload(&DomainPayload {
                                domain: domain.to_owned(),
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

    /// Promotes a verified domain to the organization's primary domain.
    pub async fn set_primary_org_domain(
        &self,
        ctx: &Context,
        org_id: &str,
        domain: &str,
    ) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;
            let mut model: OrgDomainsWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            let entry = model
                .entry(domain)
                .ok_or_else(|| Error::not_found("COMMAND-Dom04a", "domain not found"))?;
            if !entry.verified {
                return Err(Error::precondition_failed(
                    "COMMAND-Dom04b",
                    "only verified domains can become primary",
                ));
            }
            if entry.primary {
                return Ok(model.object_details());
            }

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Org(org_id.to_owned()))
                .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(org_aggregate(ctx, org_id), ORG_DOMAIN_PRIMARY_SET, ctx.creator())
                            .with_payload(&DomainPayload {
                                domain: domain.to_owned(),
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

    /// Removes a staged or verified domain. The primary domain cannot be
    /// removed.
    pub async fn remove_org_domain(&self, ctx: &Context, org_id: &str, domain: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            self.existing_org(ctx, org_id).await?;
            let mut model: OrgDomainsWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
            let entry = model
                .entry(domain)
                .ok_or_else(|| Error::not_found("COMMAND-Dom05a", "domain not found"))?;
            if entry.primary {
                return Err(Error::precondition_failed(
                    "COMMAND-Dom05b",
                    "the primary domain cannot be removed",
                ));
            }

            self.check_permission(ctx, "org", permissions::ORG_WRITE, PermissionScope::Org(org_id.to_owned()))
                .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(org_aggregate(ctx, org_id), ORG_DOMAIN_REMOVED, ctx.creator())
                            .with_payload(&DomainPayload {
                                domain: domain.to_owned(),
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
    use crate::command::AddOrg;
    use crate::error::Error;

    async fn org(commands: &crate::command::Commands) -> String {
        commands
            .add_org(
                &system_ctx(),
                AddOrg {
                    org_id: Some("org1".to_owned()),
                    name: "Acme".to_owned(),
                },
            )
            .await
            .unwrap()
            .org_id
    }

    #[tokio::test]
    async fn primary_requires_verification() {
        let (commands, _) = commands();
        let ctx = system_ctx();
        let org_id = org(&commands).await;

        commands.add_org_domain(&ctx, &org_id, "acme.com").await.unwrap();

        let err = commands.set_primary_org_domain(&ctx, &org_id, "acme.com").await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));

        commands.verify_org_domain(&ctx, &org_id, "acme.com").await.unwrap();
        commands.set_primary_org_domain(&ctx, &org_id, "acme.com").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_domain_is_already_exists() {
        let (commands, _) = commands();
        let ctx = system_ctx();
        let org_id = org(&commands).await;

        commands.add_org_domain(&ctx, &org_id, "acme.com").await.unwrap();
        let err = commands.add_org_domain(&ctx, &org_id, "acme.com").await.unwrap_err();
        assert!(err.is_already_exists());

        // The instance-default domain staged by add_org also counts.
        let err = commands.add_org_domain(&ctx, &org_id, "localhost").await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn verify_is_idempotent() {
        let (commands, _) = commands();
        let ctx = system_ctx();
        let org_id = org(&commands).await;

        commands.add_org_domain(&ctx, &org_id, "acme.com").await.unwrap();
        let first = commands.verify_org_domain(&ctx, &org_id, "acme.com").await.unwrap();
        let second = commands.verify_org_domain(&ctx, &org_id, "acme.com").await.unwrap();
        assert_eq!(first.sequence, second.sequence);
    }

    #[tokio::test]
    async fn primary_domain_cannot_be_removed() {
        let (commands, _) = commands();
        let ctx = system_ctx();
        let org_id = org(&commands).await;

        // `localhost` became primary during add_org.
        let err = commands.remove_org_domain(&ctx, &org_id, "localhost").await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));

        let err = commands.remove_org_domain(&ctx, &org_id, "gone.com").await.unwrap_err();
        assert!(err.is_not_found());

        commands.add_org_domain(&ctx, &org_id, "acme.com").await.unwrap();
        commands.remove_org_domain(&ctx, &org_id, "acme.com").await.unwrap();
        let err = commands.remove_org_domain(&ctx, &org_id, "acme.com").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn invalid_domain_is_rejected() {
        let (commands, _) = commands();
        let ctx = system_ctx();
        let org_id = org(&commands).await;

        let err = commands.add_org_domain(&ctx, &org_id, "-bad-.com").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }
}
