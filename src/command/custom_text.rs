use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::authz::{permissions, PermissionScope};
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::store::{ExpectedVersion, StoreError};
use crate::types::{Aggregate, ObjectDetails};
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::org::{instance_aggregate, org_aggregate, AGGREGATE_TYPE_INSTANCE, AGGREGATE_TYPE_ORG};
use super::{retry_on_conflict, validate, Commands, Context};

pub(crate) const ORG_CUSTOM_TEXT_SET: &str = "org.customtext.set";
pub(crate) const ORG_CUSTOM_TEXT_REMOVED: &str = "org.customtext.removed";
pub(crate) const ORG_CUSTOM_TEXT_TEMPLATE_REMOVED: &str = "org.customtext.template.removed";
pub(crate) const INSTANCE_CUSTOM_TEXT_SET: &str = "instance.customtext.set";
pub(crate) const INSTANCE_CUSTOM_TEXT_REMOVED: &str = "instance.customtext.removed";
pub(crate) const INSTANCE_CUSTOM_TEXT_TEMPLATE_REMOVED: &str = "instance.customtext.template.removed";

/// Message-template keys understood by [`Commands::set_custom_message_text`].
pub(crate) const MESSAGE_KEY_TITLE: &str = "Title";
pub(crate) const MESSAGE_KEY_PRE_HEADER: &str = "PreHeader";
pub(crate) const MESSAGE_KEY_SUBJECT: &str = "Subject";
pub(crate) const MESSAGE_KEY_GREETING: &str = "Greeting";
pub(crate) const MESSAGE_KEY_TEXT: &str = "Text";
pub(crate) const MESSAGE_KEY_BUTTON_TEXT: &str = "ButtonText";
pub(crate) const MESSAGE_KEY_FOOTER_TEXT: &str = "FooterText";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CustomTextSetPayload {
    pub template: String,
    pub key: String,
    pub language: String,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CustomTextRemovedPayload {
    pub template: String,
    pub key: String,
    pub language: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CustomTextTemplateRemovedPayload {
    pub template: String,
    pub language: String,
}

/// A single i18n text override.
#[derive(Debug, Clone)]
pub struct SetCustomText {
    pub template: String,
    pub key: String,
    pub language: String,
    pub text: String,
}

/// A message template customization (email/SMS texts).
#[derive(Debug, Clone, Default)]
pub struct SetMessageText {
    pub message_type: String,
    pub language: String,
    pub title: Option<String>,
    pub pre_header: Option<String>,
    pub subject: Option<String>,
    pub greeting: Option<String>,
    pub text: Option<String>,
    pub button_text: Option<String>,
    pub footer_text: Option<String>,
}

/// Fold of the custom texts stored on one aggregate (org or instance).
#[derive(Default)]
struct CustomTextFold {
    texts: HashMap<(String, String, String), String>,
}

impl CustomTextFold {
    fn reduce(&mut self, event: &StoredEvent, set: &str, removed: &str, template_removed: &str) -> Result<(), StoreError> {
        let event_type = event.event_type.as_str();
        if event_type == set {
            let payload: CustomTextSetPayload = event.payload_as()?;
            self.texts
                .insert((payload.template, payload.language, payload.key), payload.text);
        } else if event_type == removed {
            let payload: CustomTextRemovedPayload = event.payload_as()?;
            self.texts.remove(&(payload.template, payload.language, payload.key));
        } else if event_type == template_removed {
            let payload: CustomTextTemplateRemovedPayload = event.payload_as()?;
            self.texts
                .retain(|(template, language, _), _| *template != payload.template || *language != payload.language);
        }
        Ok(())
    }

    fn get(&self, template: &str, language: &str, key: &str) -> Option<&String> {
        self.texts
            .get(&(template.to_owned(), language.to_owned(), key.to_owned()))
    }

    fn has_template(&self, template: &str, language: &str) -> bool {
        self.texts
            .keys()
            .any(|(t, l, _)| t == template && l == language)
    }
}

#[derive(Default)]
struct OrgCustomTextWriteModel {
    base: WriteModelBase,
    fold: CustomTextFold,
}

impl WriteModel for OrgCustomTextWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_ORG;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        self.fold
            .reduce(event, ORG_CUSTOM_TEXT_SET, ORG_CUSTOM_TEXT_REMOVED, ORG_CUSTOM_TEXT_TEMPLATE_REMOVED)
    }
}

#[derive(Default)]
struct InstanceCustomTextWriteModel {
    base: WriteModelBase,
    fold: CustomTextFold,
}

impl WriteModel for InstanceCustomTextWriteModel {
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
            INSTANCE_CUSTOM_TEXT_SET,
            INSTANCE_CUSTOM_TEXT_REMOVED,
            INSTANCE_CUSTOM_TEXT_TEMPLATE_REMOVED,
        )
    }
}

struct TextTarget {
    aggregate: Aggregate,
    set: &'static str,
    removed: &'static str,
    template_removed: &'static str,
}

impl Commands {
    fn text_target(&self, ctx: &Context, org_id: Option<&str>) -> TextTarget {
        match org_id {
            Some(org_id) => TextTarget {
                aggregate: org_aggregate(ctx, org_id),
                set: ORG_CUSTOM_TEXT_SET,
                removed: ORG_CUSTOM_TEXT_REMOVED,
                template_removed: ORG_CUSTOM_TEXT_TEMPLATE_REMOVED,
            },
            None => TextTarget {
                aggregate: instance_aggregate(ctx),
                set: INSTANCE_CUSTOM_TEXT_SET,
                removed: INSTANCE_CUSTOM_TEXT_REMOVED,
                template_removed: INSTANCE_CUSTOM_TEXT_TEMPLATE_REMOVED,
            },
        }
    }

    async fn text_fold(
        &self,
        ctx: &Context,
        org_id: Option<&str>,
    ) -> Result<(CustomTextFold, i64, ObjectDetails), Error> {
        match org_id {
            Some(org_id) => {
                let model: OrgCustomTextWriteModel =
                    writemodel::load(self.eventstore(), &ctx.instance_id, org_id).await?;
                let details = model.object_details();
                Ok((model.fold, model.base.sequence, details))
            }
            None => {
                let model: InstanceCustomTextWriteModel =
                    writemodel::load(self.eventstore(), &ctx.instance_id, &ctx.instance_id).await?;
                let details = model.object_details();
                Ok((model.fold, model.base.sequence, details))
            }
        }
    }

    fn text_scope(org_id: Option<&str>) -> PermissionScope {
        match org_id {
            Some(org_id) => PermissionScope::Org(org_id.to_owned()),
            None => PermissionScope::Instance,
        }
    }

    /// Overrides one i18n text for an org (or, without an org, the whole
    /// instance). Setting the stored text emits nothing.
    #[tracing::instrument(skip_all, fields(instance_id = %ctx.instance_id), err)]
    pub async fn set_custom_text(
        &self,
        ctx: &Context,
        org_id: Option<&str>,
        text: SetCustomText,
    ) -> Result<ObjectDetails, Error> {
        validate::not_empty(&text.template, "COMMAND-Text01a", "template")?;
        validate::not_empty(&text.key, "COMMAND-Text01b", "key")?;
        validate::language_tag(&text.language, "COMMAND-Text01c")?;
        validate::not_empty(&text.text, "COMMAND-Text01d", "text")?;

        let text = &text;
        retry_on_conflict(|| async move {
            if let Some(org_id) = org_id {
                self.existing_org(ctx, org_id).await?;
            }
            let (fold, sequence, details) = self.text_fold(ctx, org_id).await?;
            if fold.get(&text.template, &text.language, &text.key) == Some(&text.text) {
                return Ok(details);
            }

            self.check_permission(ctx, "text", permissions::TEXT_WRITE, Self::text_scope(org_id))
                .await?;

            let target = self.text_target(ctx, org_id);
            let events = self
                .push_checked(
                    vec![EventCommand::new(target.aggregate.clone(), target.set, ctx.creator()).with_payload(
                        &CustomTextSetPayload {
                            template: text.template.clone(),
                            key: text.key.clone(),
                            language: text.language.clone(),
                            text: text.text.clone(),
                        },
                    )?],
                    vec![ExpectedVersion {
                        aggregate: target.aggregate,
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
        })
        .await
    }

    /// Drops every override of a template/language pair, falling back to
    /// the shipped texts. Resetting an untouched template is an idempotent
    /// success.
    pub async fn reset_custom_text(
        &self,
        ctx: &Context,
        org_id: Option<&str>,
        template: &str,
        language: &str,
    ) -> Result<ObjectDetails, Error> {
        validate::not_empty(template, "COMMAND-Text02a", "template")?;
        validate::language_tag(language, "COMMAND-Text02b")?;

        retry_on_conflict(|| async move {
            if let Some(org_id) = org_id {
                self.existing_org(ctx, org_id).await?;
            }
            let (fold, sequence, details) = self.text_fold(ctx, org_id).await?;
            if !fold.has_template(template, language) {
                return Ok(details);
            }

            self.check_permission(ctx, "text", permissions::TEXT_WRITE, Self::text_scope(org_id))
                .await?;

            let target = self.text_target(ctx, org_id);
            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(target.aggregate.clone(), target.template_removed, ctx.creator())
                            .with_payload(&CustomTextTemplateRemovedPayload {
                                template: template.to_owned(),
                                language: language.to_owned(),
                            })?,
                    ],
                    vec![ExpectedVersion {
                        aggregate: target.aggregate,
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
        })
        .await
    }

    /// Customizes a message template (email/SMS). Fields set to `Some` are
    /// written, empty strings clear the stored override, `None` fields are
    /// left untouched. All resulting events form one atomic batch.
    pub async fn set_custom_message_text(
        &self,
        ctx: &Context,
        org_id: Option<&str>,
        message: SetMessageText,
    ) -> Result<ObjectDetails, Error> {
        validate::not_empty(&message.message_type, "COMMAND-Text03a", "message type")?;
        validate::language_tag(&message.language, "COMMAND-Text03b")?;

        let fields: Vec<(&'static str, &Option<String>)> = vec![
            (MESSAGE_KEY_TITLE, &message.title),
            (MESSAGE_KEY_PRE_HEADER, &message.pre_header),
            (MESSAGE_KEY_SUBJECT, &message.subject),
            (MESSAGE_KEY_GREETING, &message.greeting),
            (MESSAGE_KEY_TEXT, &message.text),
            (MESSAGE_KEY_BUTTON_TEXT, &message.button_text),
            (MESSAGE_KEY_FOOTER_TEXT, &message.footer_text),
        ];

        let message = &message;
        let fields = &fields;
        retry_on_conflict(|| async move {
            if let Some(org_id) = org_id {
                self.existing_org(ctx, org_id).await?;
            }
            let (fold, sequence, details) = self.text_fold(ctx, org_id).await?;
            let target = self.text_target(ctx, org_id);

            let mut commands = Vec::new();
            for (key, value) in fields.iter() {
                let current = fold.get(&message.message_type, &message.language, key);
                match value {
                    Some(text) if text.is_empty() => {
                        if current.is_some() {
                            commands.push(
                                EventCommand::new(target.aggregate.clone(), target.removed, ctx.creator())
                                    .with_payload(&CustomTextRemovedPayload {
                                        template: message.message_type.clone(),
                                        key: (*key).to_owned(),
                                        language: message.language.clone(),
                                    })?,
                            );
                        }
                    }
                    Some(text) if current != Some(text) => {
                        commands.push(
                            EventCommand::new(target.aggregate.clone(), target.set, ctx.creator()).with_payload(
                                &CustomTextSetPayload {
                                    template: message.message_type.clone(),
                                    key: (*key).to_owned(),
                                    language: message.language.clone(),
                                    text: text.clone(),
                                },
                            )?,
                        );
                    }
                    _ => {}
                }
            }

            if commands.is_empty() {
                return Ok(details);
            }

            self.check_permission(ctx, "text", permissions::TEXT_WRITE, Self::text_scope(org_id))
                .await?;

            let events = self
                .push_checked(
                    commands,
                    vec![ExpectedVersion {
                        aggregate: target.aggregate,
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
        })
        .await
    }

    /// Drops a message template customization entirely.
    pub async fn reset_custom_message_text(
        &self,
        ctx: &Context,
        org_id: Option<&str>,
        message_type: &str,
        language: &str,
    ) -> Result<ObjectDetails, Error> {
        self.reset_custom_text(ctx, org_id, message_type, language).await
    }
}

#[cfg(test)]
mod tests {
    use crate::command::test_support::{commands, system_ctx};
    use crate::command::{AddOrg, SetCustomText, SetMessageText};
    use crate::error::Error;
    use crate::store::{EventFilter, Eventstore};

    fn text(template: &str, key: &str, value: &str) -> SetCustomText {
        SetCustomText {
            template: template.to_owned(),
            key: key.to_owned(),
            language: "en".to_owned(),
            text: value.to_owned(),
        }
    }

    #[tokio::test]
    async fn set_and_reset_instance_text() {
        let (commands, _) = commands();
        let ctx = system_ctx();

        let first = commands
            .set_custom_text(&ctx, None, text("Login", "title", "Welcome"))
            .await
            .unwrap();

        let same = commands
            .set_custom_text(&ctx, None, text("Login", "title", "Welcome"))
            .await
            .unwrap();
        assert_eq!(first.sequence, same.sequence);

        let reset = commands.reset_custom_text(&ctx, None, "Login", "en").await.unwrap();
        assert_eq!(reset.sequence, same.sequence + 1);

        // Resetting again touches nothing.
        let again = commands.reset_custom_text(&ctx, None, "Login", "en").await.unwrap();
        assert_eq!(reset.sequence, again.sequence);
    }

    #[tokio::test]
    async fn invalid_language_is_rejected() {
        let (commands, _) = commands();
        let ctx = system_ctx();

        let mut bad = text("Login", "title", "Welcome");
        bad.language = "english".to_owned();
        let err = commands.set_custom_text(&ctx, None, bad).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn message_text_batch_only_contains_changes() {
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
            .set_custom_message_text(
                &ctx,
                Some("org1"),
                SetMessageText {
                    message_type: "InitCode".to_owned(),
                    language: "en".to_owned(),
                    subject: Some("Your code".to_owned()),
                    greeting: Some("Hi".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Second call: one changed field, one cleared, one unchanged.
        commands
            .set_custom_message_text(
                &ctx,
                Some("org1"),
                SetMessageText {
                    message_type: "InitCode".to_owned(),
                    language: "en".to_owned(),
                    subject: Some("Your verification code".to_owned()),
                    greeting: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let events = store
            .filter(
                &EventFilter::builder()
                    .instance_id("inst1")
                    .event_types(vec![
                        "org.customtext.set".to_owned(),
                        "org.customtext.removed".to_owned(),
                    ])
                    .build(),
            )
            .await
            .unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "org.customtext.set",
                "org.customtext.set",
                "org.customtext.set",
                "org.customtext.removed",
            ]
        );
    }
}
