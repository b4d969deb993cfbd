use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::authz::{permissions, PermissionScope};
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::store::{ExpectedVersion, StoreError};
use crate::types::ObjectDetails;
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::user::{user_aggregate, AGGREGATE_TYPE_USER};
use super::{retry_on_conflict, validate, Commands, Context};

pub(crate) const USER_METADATA_SET: &str = "user.metadata.set";
pub(crate) const USER_METADATA_REMOVED: &str = "user.metadata.removed";

const MAX_METADATA_KEY_LEN: usize = 200;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MetadataSetPayload {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MetadataRemovedPayload {
    pub key: String,
}

/// A metadata key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

/// Fold of one user's metadata entries.
#[derive(Default)]
pub(crate) struct UserMetadataWriteModel {
    base: WriteModelBase,
    entries: HashMap<String, String>,
}

impl WriteModel for UserMetadataWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_USER;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        match event.event_type.as_str() {
            USER_METADATA_SET => {
                let payload: MetadataSetPayload = event.payload_as()?;
                self.entries.insert(payload.key, payload.value);
            }
            USER_METADATA_REMOVED => {
                let payload: MetadataRemovedPayload = event.payload_as()?;
                self.entries.remove(&payload.key);
            }
            _ => {}
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), Error> {
    validate::not_empty(key, "COMMAND-Meta01a", "metadata key")?;
    validate::max_len(key, MAX_METADATA_KEY_LEN, "COMMAND-Meta01b", "metadata key")
}

impl Commands {
    /// Sets one metadata entry. Setting the stored value emits nothing.
    pub async fn set_user_metadata(
        &self,
        ctx: &Context,
        user_id: &str,
        entry: MetadataEntry,
    ) -> Result<ObjectDetails, Error> {
        self.bulk_set_user_metadata(ctx, user_id, vec![entry]).await
    }

    /// Sets several metadata entries in one atomic batch, emitting events
    /// only for the entries that actually change.
    pub async fn bulk_set_user_metadata(
        &self,
        ctx: &Context,
        user_id: &str,
        entries: Vec<MetadataEntry>,
    ) -> Result<ObjectDetails, Error> {
        if entries.is_empty() {
            return Err(Error::invalid_argument("COMMAND-Meta02a", "no metadata entries given"));
        }
        for entry in &entries {
            validate_key(&entry.key)?;
        }

        let entries = &entries;
        retry_on_conflict(|| async move {
            let user = self.existing_user(ctx, user_id).await?;
            let org_id = user.base().resource_owner.clone();

            let mut model: UserMetadataWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, user_id).await?;

            let changed: Vec<&MetadataEntry> = entries
                .iter()
                .filter(|entry| model.entries.get(&entry.key) != Some(&entry.value))
                .collect();
            if changed.is_empty() {
                return Ok(model.object_details());
            }

            self.check_permission(ctx, "user", permissions::USER_WRITE, PermissionScope::Org(org_id.clone()))
                .await?;

            let commands = changed
                .iter()
                .map(|entry| {
                    EventCommand::new(user_aggregate(ctx, user_id, &org_id), USER_METADATA_SET, ctx.creator())
                        .with_payload(&MetadataSetPayload {
                            key: entry.key.clone(),
                            value: entry.value.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let events = self
                .push_checked(
                    commands,
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

    /// Removes one metadata entry. Removing an absent key is an idempotent
    /// success.
    pub async fn remove_user_metadata(&self, ctx: &Context, user_id: &str, key: &str) -> Result<ObjectDetails, Error> {
        validate_key(key)?;
        self.bulk_remove_user_metadata(ctx, user_id, vec![key.to_owned()]).await
    }

    /// Removes several metadata entries atomically; absent keys are
    /// skipped.
    pub async fn bulk_remove_user_metadata(
        &self,
        ctx: &Context,
        user_id: &str,
        keys: Vec<String>,
    ) -> Result<ObjectDetails, Error> {
        if keys.is_empty() {
            return Err(Error::invalid_argument("COMMAND-Meta03a", "no metadata keys given"));
        }
        for key in &keys {
            validate_key(key)?;
        }

        let keys = &keys;
        retry_on_conflict(|| async move {
            let user = self.existing_user(ctx, user_id).await?;
            let org_id = user.base().resource_owner.clone();

            let mut model: UserMetadataWriteModel =
                writemodel::load(self.eventstore(), &ctx.instance_id, user_id).await?;

            let present: Vec<&String> = keys.iter().filter(|key| model.entries.contains_key(*key)).collect();
            if present.is_empty() {
                return Ok(model.object_details());
            }

            self.check_permission(ctx, "user", permissions::USER_WRITE, PermissionScope::Org(org_id.clone()))
                .await?;

            let commands = present
                .iter()
                .map(|key| {
                    EventCommand::new(user_aggregate(ctx, user_id, &org_id), USER_METADATA_REMOVED, ctx.creator())
                        .with_payload(&MetadataRemovedPayload { key: (*key).clone() })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let events = self
                .push_checked(
                    commands,
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
    use crate::command::{AddOrg, MetadataEntry};
    use crate::store::{EventFilter, Eventstore};

    fn entry(key: &str, value: &str) -> MetadataEntry {
        MetadataEntry {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }

    async fn setup() -> (crate::command::Commands, std::sync::Arc<crate::store::memory::InMemoryEventStore>) {
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
        add_active_user(&commands, &ctx, "u1", "org1").await;
        (commands, store)
    }

    #[tokio::test]
    async fn set_is_idempotent_per_value() {
        let (commands, _) = setup().await;
        let ctx = system_ctx();

        let first = commands.set_user_metadata(&ctx, "u1", entry("plan", "pro")).await.unwrap();
        let same = commands.set_user_metadata(&ctx, "u1", entry("plan", "pro")).await.unwrap();
        assert_eq!(first.sequence, same.sequence);

        let changed = commands
            .set_user_metadata(&ctx, "u1", entry("plan", "enterprise"))
            .await
            .unwrap();
        assert_eq!(changed.sequence, same.sequence + 1);
    }

    #[tokio::test]
    async fn bulk_set_emits_only_changes_atomically() {
        let (commands, store) = setup().await;
        let ctx = system_ctx();

        commands.set_user_metadata(&ctx, "u1", entry("a", "1")).await.unwrap();

        commands
            .bulk_set_user_metadata(&ctx, "u1", vec![entry("a", "1"), entry("b", "2"), entry("c", "3")])
            .await
            .unwrap();

        let events = store
            .filter(
                &EventFilter::builder()
                    .instance_id("inst1")
                    .event_types(vec!["user.metadata.set".to_owned()])
                    .build(),
            )
            .await
            .unwrap();
        // 1 initial + 2 changed entries; `a` unchanged emits nothing.
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].position.global, events[2].position.global);
    }

    #[tokio::test]
    async fn remove_of_absent_key_is_idempotent() {
        let (commands, _) = setup().await;
        let ctx = system_ctx();

        commands.set_user_metadata(&ctx, "u1", entry("a", "1")).await.unwrap();
        let removed = commands.remove_user_metadata(&ctx, "u1", "a").await.unwrap();
        let again = commands.remove_user_metadata(&ctx, "u1", "a").await.unwrap();
        assert_eq!(removed.sequence, again.sequence);

        let ghost = commands.remove_user_metadata(&ctx, "u1", "never-set").await.unwrap();
        assert_eq!(ghost.sequence, again.sequence);
    }
}
