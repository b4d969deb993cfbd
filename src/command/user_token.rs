use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authz::{permissions, PermissionScope};
use crate::crypto;
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::store::{ExpectedVersion, StoreError};
use crate::types::ObjectDetails;
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::user::{user_aggregate, AGGREGATE_TYPE_USER};
use super::{retry_on_conflict, validate, Commands, Context};

pub(crate) const USER_TOKEN_ADDED: &str = "user.token.added";
pub(crate) const USER_TOKEN_REMOVED: &str = "user.token.removed";
pub(crate) const USER_MACHINE_KEY_ADDED: &str = "user.machine.key.added";
pub(crate) const USER_MACHINE_KEY_REMOVED: &str = "user.machine.key.removed";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TokenAddedPayload {
    pub token_id: String,
    pub token_digest: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TokenRemovedPayload {
    pub token_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MachineKeyAddedPayload {
    pub key_id: String,
    pub key_type: String,
    pub public_key: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MachineKeyRemovedPayload {
    pub key_id: String,
}

/// Fold of a user's credentials (personal access tokens, machine keys).
#[derive(Default)]
pub(crate) struct UserAccessWriteModel {
    base: WriteModelBase,
    token_ids: HashSet<String>,
    key_ids: HashSet<String>,
}

impl WriteModel for UserAccessWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_USER;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        match event.event_type.as_str() {
            USER_TOKEN_ADDED => {
                let payload: TokenAddedPayload = event.payload_as()?;
                self.token_ids.insert(payload.token_id);
            }
            USER_TOKEN_REMOVED => {
                let payload: TokenRemovedPayload = event.payload_as()?;
                self.token_ids.remove(&payload.token_id);
            }
            USER_MACHINE_KEY_ADDED => {
                let payload: MachineKeyAddedPayload = event.payload_as()?;
                self.key_ids.insert(payload.key_id);
            }
            USER_MACHINE_KEY_REMOVED => {
                let payload: MachineKeyRemovedPayload = event.payload_as()?;
                self.key_ids.remove(&payload.key_id);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Outcome of [`Commands::add_personal_access_token`]. The `token` value is
/// shown exactly once; only its digest is stored.
#[derive(Debug, Clone)]
pub struct AddedPersonalAccessToken {
    pub token_id: String,
    pub token: String,
    pub details: ObjectDetails,
}

/// Outcome of [`Commands::add_machine_key`].
#[derive(Debug, Clone)]
pub struct AddedMachineKey {
    pub key_id: String,
    pub details: ObjectDetails,
}

impl Commands {
    /// Issues a personal access token for a machine user. Returns the
    /// one-time secret; the store keeps only a digest.
    #[tracing::instrument(skip_all, fields(instance_id = %ctx.instance_id, user_id), err)]
    pub async fn add_personal_access_token(
        &self,
        ctx: &Context,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
        scopes: Vec<String>,
    ) -> Result<AddedPersonalAccessToken, Error> {
        if let Some(expiry) = expires_at {
            if expiry <= self.clock().now() {
                return Err(Error::invalid_argument(
                    "COMMAND-Pat01a",
                    "expiration date must be in the future",
                ));
            }
        }

        let token_id = self.next_id()?;
        let secret = crypto::generate_secret();
        let token = format!("{token_id}_{secret}");

        let token_id = &token_id;
        let token = &token;
        let scopes = &scopes;
        retry_on_conflict(|| async move {
            let user = self.existing_user(ctx, user_id).await?;
            if !user.is_machine() {
                return Err(Error::precondition_failed(
                    "COMMAND-Pat01b",
                    "personal access tokens are only available for machine users",
                ));
            }
            let org_id = user.base().resource_owner.clone();

            self.check_permission(
                ctx,
                "user.token",
                permissions::USER_TOKEN_WRITE,
                PermissionScope::Org(org_id.clone()),
            )
            .await?;

            let mut model: UserAccessWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, user_id).await?;
            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(user_aggregate(ctx, user_id, &org_id), USER_TOKEN_ADDED, ctx.creator())
                            .with_payload(&TokenAddedPayload {
                                token_id: token_id.clone(),
                                token_digest: crypto::digest(&token),
                                expires_at,
                                scopes: scopes.clone(),
                            })?,
                    ],
                    vec![ExpectedVersion {
                        aggregate: user_aggregate(ctx, user_id, &org_id),
                        version: model.base().sequence,
                    }],
                )
                .await?;

            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(AddedPersonalAccessToken {
                token_id: token_id.clone(),
                token: token.clone(),
                details: model.object_details(),
            })
        })
        .await
    }

    /// Revokes a personal access token.
    pub async fn remove_personal_access_token(
        &self,
        ctx: &Context,
        user_id: &str,
        token_id: &str,
    ) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            let user = self.existing_user(ctx, user_id).await?;
            let org_id = user.base().resource_owner.clone();

            let mut model: UserAccessWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, user_id).await?;
            if !model.token_ids.contains(token_id) {
                return Err(Error::not_found("COMMAND-Pat02a", "token not found"));
            }

            self.check_permission(
                ctx,
                "user.token",
                permissions::USER_TOKEN_WRITE,
                PermissionScope::Org(org_id.clone()),
            )
            .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(user_aggregate(ctx, user_id, &org_id), USER_TOKEN_REMOVED, ctx.creator())
                            .with_payload(&TokenRemovedPayload {
                                token_id: token_id.to_owned(),
                            })?,
                    ],
                    vec![ExpectedVersion {
                        aggregate: user_aggregate(ctx, user_id, &org_id),
                        version: model.base().sequence,
                    }],
                )
                .await?;

            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(model.object_details())
        })
        .await
    }

    /// Registers a public key for a machine user.
    pub async fn add_machine_key(
        &self,
        ctx: &Context,
        user_id: &str,
        public_key: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AddedMachineKey, Error> {
        validate::not_empty(public_key, "COMMAND-Key01a", "public key")?;
        if let Some(expiry) = expires_at {
            if expiry <= self.clock().now() {
                return Err(Error::invalid_argument(
                    "COMMAND-Key01b",
                    "expiration date must be in the future",
                ));
            }
        }

        let key_id = self.next_id()?;

        let key_id = &key_id;
        retry_on_conflict(|| async move {
            let user = self.existing_user(ctx, user_id).await?;
            if !user.is_machine() {
                return Err(Error::precondition_failed(
                    "COMMAND-Key01c",
                    "machine keys are only available for machine users",
                ));
            }
            let org_id = user.base().resource_owner.clone();

            self.check_permission(
                ctx,
                "user.key",
                permissions::USER_KEY_WRITE,
                PermissionScope::Org(org_id.clone()),
            )
            .await?;

            let mut model: UserAccessWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, user_id).await?;
            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(user_aggregate(ctx, user_id, &org_id), USER_MACHINE_KEY_ADDED, ctx.creator())
                            .with_payload(&MachineKeyAddedPayload {
                                key_id: key_id.clone(),
                                key_type: "json".to_owned(),
                                public_key: public_key.to_owned(),
                                expires_at,
                            })?,
                    ],
                    vec![ExpectedVersion {
                        aggregate: user_aggregate(ctx, user_id, &org_id),
                        version: model.base().sequence,
                    }],
                )
                .await?;

            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(AddedMachineKey {
                key_id: key_id.clone(),
                details: model.object_details(),
            })
        })
        .await
    }

    /// Removes a machine key.
    pub async fn remove_machine_key(&self, ctx: &Context, user_id: &str, key_id: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            let user = self.existing_user(ctx, user_id).await?;
            let org_id = user.base().resource_owner.clone();

            let mut model: UserAccessWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, user_id).await?;
            if !model.key_ids.contains(key_id) {
                return Err(Error::not_found("COMMAND-Key02a", "key not found"));
            }

            self.check_permission(
                ctx,
                "user.key",
                permissions::USER_KEY_WRITE,
                PermissionScope::Org(org_id.clone()),
            )
            .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(user_aggregate(ctx, user_id, &org_id), USER_MACHINE_KEY_REMOVED, ctx.creator())
                            .with_payload(&MachineKeyRemovedPayload {
                                key_id: key_id.to_owned(),
                            })?,
                    ],
                    vec![ExpectedVersion {
                        aggregate: user_aggregate(ctx, user_id, &org_id),
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
    use crate::command::{AddMachineUser, AddOrg};
    use crate::crypto;
    use crate::error::Error;
    use crate::store::{EventFilter, Eventstore};

    async fn setup_machine() -> (crate::command::Commands, std::sync::Arc<crate::store::memory::InMemoryEventStore>) {
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
        commands
            .add_machine_user(
                &ctx,
                AddMachineUser {
                    user_id: Some("m1".to_owned()),
                    org_id: "org1".to_owned(),
                    username: "robot".to_owned(),
                    name: "Robot".to_owned(),
                    description: String::new(),
                },
            )
            .await
            .unwrap();
        (commands, store)
    }

    #[tokio::test]
    async fn pat_round_trip() {
        let (commands, store) = setup_machine().await;
        let ctx = system_ctx();

        let added = commands
            .add_personal_access_token(&ctx, "m1", None, vec!["openid".to_owned()])
            .await
            .unwrap();
        assert!(added.token.starts_with(&added.token_id));

        // Only the digest reaches the log.
        let events = store
            .filter(
                &EventFilter::builder()
                    .instance_id("inst1")
                    .event_types(vec!["user.token.added".to_owned()])
                    .build(),
            )
            .await
            .unwrap();
        assert_eq!(events[0].payload["token_digest"], crypto::digest(&added.token));
        assert!(events[0].payload["token"].is_null());

        commands
            .remove_personal_access_token(&ctx, "m1", &added.token_id)
            .await
            .unwrap();
        let err = commands
            .remove_personal_access_token(&ctx, "m1", &added.token_id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn pat_requires_machine_user() {
        let (commands, _) = setup_machine().await;
        let ctx = system_ctx();
        add_active_user(&commands, &ctx, "u1", "org1").await;

        let err = commands
            .add_personal_access_token(&ctx, "u1", None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn machine_key_round_trip() {
        let (commands, _) = setup_machine().await;
        let ctx = system_ctx();

        let added = commands
            .add_machine_key(&ctx, "m1", "-----BEGIN PUBLIC KEY-----", None)
            .await
            .unwrap();

        commands.remove_machine_key(&ctx, "m1", &added.key_id).await.unwrap();
        let err = commands.remove_machine_key(&ctx, "m1", &added.key_id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn expired_dates_are_rejected() {
        let (commands, _) = setup_machine().await;
        let ctx = system_ctx();

        let yesterday = chrono::Utc::now() - chrono::Duration::days(1);
        let err = commands
            .add_personal_access_token(&ctx, "m1", Some(yesterday), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }
}
