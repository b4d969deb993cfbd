use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::authz::{permissions, PermissionScope};
use crate::crypto;
use crate::error::Error;
use crate::event::{EventCommand, StoredEvent};
use crate::notification::templates;
use crate::policy::check_password_complexity;
use crate::store::{EventFilter, ExpectedVersion, StoreError};
use crate::types::{Aggregate, ObjectDetails};
use crate::writemodel::{self, WriteModel, WriteModelBase};

use super::policy::effective_password_complexity;
use super::{retry_on_conflict, validate, Commands, Context};

pub(crate) const AGGREGATE_TYPE_USER: &str = "user";

pub(crate) const USER_HUMAN_ADDED: &str = "user.human.added";
pub(crate) const USER_MACHINE_ADDED: &str = "user.machine.added";
pub(crate) const USER_USERNAME_CHANGED: &str = "user.username.changed";
pub(crate) const USER_PROFILE_CHANGED: &str = "user.profile.changed";
pub(crate) const USER_EMAIL_CHANGED: &str = "user.email.changed";
pub(crate) const USER_EMAIL_VERIFIED: &str = "user.email.verified";
pub(crate) const USER_EMAIL_CODE_ADDED: &str = "user.email.code.added";
pub(crate) const USER_DEACTIVATED: &str = "user.deactivated";
pub(crate) const USER_REACTIVATED: &str = "user.reactivated";
pub(crate) const USER_LOCKED: &str = "user.locked";
pub(crate) const USER_UNLOCKED: &str = "user.unlocked";
pub(crate) const USER_REMOVED: &str = "user.removed";

const MAX_USERNAME_LEN: usize = 200;
const EMAIL_CODE_DIGITS: usize = 6;
const EMAIL_CODE_LIFETIME_HOURS: i64 = 1;

pub(crate) fn user_aggregate(ctx: &Context, user_id: &str, resource_owner: &str) -> Aggregate {
    Aggregate::new(&ctx.instance_id, AGGREGATE_TYPE_USER, user_id, resource_owner)
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct HumanAddedPayload {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub email_verified: bool,
    pub phone: Option<String>,
    pub password_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MachineAddedPayload {
    pub username: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UsernamePayload {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ProfilePayload {
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EmailPayload {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EmailCodePayload {
    pub code_digest: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    Human,
    Machine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum UserState {
    #[default]
    Unspecified,
    Active,
    Inactive,
    Locked,
    Removed,
}

/// Fold of one user's events.
#[derive(Default)]
pub(crate) struct UserWriteModel {
    base: WriteModelBase,
    pub state: UserState,
    pub user_type: Option<UserType>,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub email_verified: bool,
    pub email_code_digest: Option<String>,
    pub email_code_expires_at: Option<DateTime<Utc>>,
}

impl UserWriteModel {
    pub fn exists_and_not_removed(&self) -> bool {
        self.exists() && self.state != UserState::Removed
    }

    pub fn is_machine(&self) -> bool {
        self.user_type == Some(UserType::Machine)
    }

    pub fn is_human(&self) -> bool {
        self.user_type == Some(UserType::Human)
    }
}

impl WriteModel for UserWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_USER;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        match event.event_type.as_str() {
            USER_HUMAN_ADDED => {
                let payload: HumanAddedPayload = event.payload_as()?;
                self.username = payload.username;
                self.first_name = payload.first_name;
                self.last_name = payload.last_name;
                self.email = payload.email;
                self.email_verified = payload.email_verified;
                self.user_type = Some(UserType::Human);
                self.state = UserState::Active;
            }
            USER_MACHINE_ADDED => {
                let payload: MachineAddedPayload = event.payload_as()?;
                self.username = payload.username;
                self.user_type = Some(UserType::Machine);
                self.state = UserState::Active;
            }
            USER_USERNAME_CHANGED => {
                let payload: UsernamePayload = event.payload_as()?;
                self.username = payload.username;
            }
            USER_PROFILE_CHANGED => {
                let payload: ProfilePayload = event.payload_as()?;
                self.first_name = payload.first_name;
                self.last_name = payload.last_name;
            }
            USER_EMAIL_CHANGED => {
                let payload: EmailPayload = event.payload_as()?;
                self.email = payload.email;
                self.email_verified = false;
            }
            USER_EMAIL_VERIFIED => {
                self.email_verified = true;
                self.email_code_digest = None;
                self.email_code_expires_at = None;
            }
            USER_EMAIL_CODE_ADDED => {
                let payload: EmailCodePayload = event.payload_as()?;
                self.email_code_digest = Some(payload.code_digest);
                self.email_code_expires_at = Some(payload.expires_at);
            }
            USER_DEACTIVATED => self.state = UserState::Inactive,
            USER_REACTIVATED => self.state = UserState::Active,
            USER_LOCKED => self.state = UserState::Locked,
            USER_UNLOCKED => self.state = UserState::Active,
            USER_REMOVED => self.state = UserState::Removed,
            _ => {}
        }
        Ok(())
    }
}

/// Fold of the usernames currently taken within one organization.
#[derive(Default)]
struct OrgUsernamesWriteModel {
    base: WriteModelBase,
    usernames: HashMap<String, String>,
}

impl OrgUsernamesWriteModel {
    fn is_taken(&self, username: &str, except_user: Option<&str>) -> bool {
        self.usernames
            .iter()
            .any(|(user_id, taken)| taken == username && except_user != Some(user_id.as_str()))
    }
}

impl WriteModel for OrgUsernamesWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE_USER;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        match event.event_type.as_str() {
            USER_HUMAN_ADDED => {
                let payload: HumanAddedPayload = event.payload_as()?;
                self.usernames.insert(event.aggregate_id.clone(), payload.username);
            }
            USER_MACHINE_ADDED => {
                let payload: MachineAddedPayload = event.payload_as()?;
                self.usernames.insert(event.aggregate_id.clone(), payload.username);
            }
            USER_USERNAME_CHANGED => {
                let payload: UsernamePayload = event.payload_as()?;
                self.usernames.insert(event.aggregate_id.clone(), payload.username);
            }
            USER_REMOVED => {
                self.usernames.remove(&event.aggregate_id);
            }
            _ => {}
        }
        Ok(())
    }
}

async fn org_usernames(commands: &Commands, ctx: &Context, org_id: &str) -> Result<OrgUsernamesWriteModel, Error> {
    let filter = EventFilter::builder()
        .instance_id(&*ctx.instance_id)
        .aggregate_types(vec![AGGREGATE_TYPE_USER.to_owned()])
        .event_types(vec![
            USER_HUMAN_ADDED.to_owned(),
            USER_MACHINE_ADDED.to_owned(),
            USER_USERNAME_CHANGED.to_owned(),
            USER_REMOVED.to_owned(),
        ])
        .owner(org_id)
        .build();
    writemodel::load_filtered(commands.eventstore(), &filter).await
}

#[derive(Debug, Clone)]
pub struct HumanProfile {
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone)]
pub struct AddHumanUser {
    pub user_id: Option<String>,
    pub org_id: String,
    pub username: String,
    pub profile: HumanProfile,
    pub email: String,
    pub email_verified: bool,
    pub phone: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AddMachineUser {
    pub user_id: Option<String>,
    pub org_id: String,
    pub username: String,
    pub name: String,
    pub description: String,
}

/// Outcome of the user-creating commands.
#[derive(Debug, Clone)]
pub struct AddedUser {
    pub user_id: String,
    pub details: ObjectDetails,
}

impl Commands {
    /// Creates a human user in an organization. Unless the email is
    /// pre-verified, a verification code is staged and handed to the
    /// notification transport.
    #[tracing::instrument(skip_all, fields(instance_id = %ctx.instance_id, org_id = %user.org_id), err)]
    pub async fn add_human_user(&self, ctx: &Context, user: AddHumanUser) -> Result<AddedUser, Error> {
        validate::not_empty(&user.username, "COMMAND-Usr01a", "username")?;
        validate::max_len(&user.username, MAX_USERNAME_LEN, "COMMAND-Usr01b", "username")?;
        validate::not_empty(&user.profile.first_name, "COMMAND-Usr01c", "first name")?;
        validate::not_empty(&user.profile.last_name, "COMMAND-Usr01d", "last name")?;
        validate::email(&user.email, "COMMAND-Usr01e")?;

        let user_id = match &user.user_id {
            Some(id) => id.clone(),
            None => self.next_id()?,
        };

        let password_hash = match &user.password {
            Some(password) => {
                let policy = effective_password_complexity(self, ctx, &user.org_id).await?;
                check_password_complexity(&policy, password)?;
                Some(self.hasher()?.hash(password)?)
            }
            None => None,
        };

        let user = &user;
        let user_id = &user_id;
        let password_hash = &password_hash;
        retry_on_conflict(|| async move {
            self.existing_org(ctx, &user.org_id).await?;

            let model: UserWriteModel = writemodel::load(self.eventstore(), &ctx.instance_id, &user_id).await?;
            if model.exists() {
                return Err(Error::already_exists("COMMAND-Usr02a", "user already exists"));
            }
            if org_usernames(self, ctx, &user.org_id).await?.is_taken(&user.username, None) {
                return Err(Error::already_exists("COMMAND-Usr02b", "username already taken"));
            }

            self.check_permission(
                ctx,
                "user",
                permissions::USER_WRITE,
                PermissionScope::Org(user.org_id.clone()),
            )
            .await?;

            let aggregate = user_aggregate(ctx, &user_id, &user.org_id);
            let mut commands = vec![EventCommand::new(aggregate.clone(), USER_HUMAN_ADDED, ctx.creator())
                .with_payload(&HumanAddedPayload {
                    username: user.username.clone(),
                    first_name: user.profile.first_name.clone(),
                    last_name: user.profile.last_name.clone(),
                    email: user.email.clone(),
                    email_verified: user.email_verified,
                    phone: user.phone.clone(),
                    password_hash: password_hash.clone(),
                })?];

            let mut verification_code = None;
            if !user.email_verified {
                let code = crypto::generate_numeric_code(EMAIL_CODE_DIGITS);
                commands.push(EventCommand::new(aggregate.clone(), USER_EMAIL_CODE_ADDED, ctx.creator())
                    .with_payload(&EmailCodePayload {
                        code_digest: crypto::digest(&code),
                        expires_at: self.clock().now() + Duration::hours(EMAIL_CODE_LIFETIME_HOURS),
                    })?);
                verification_code = Some(code);
            }

            let events = self
                .push_checked(
                    commands,
                    vec![ExpectedVersion {
                        aggregate,
                        version: model.base().sequence,
                    }],
                )
                .await?;

            if let Some(code) = verification_code {
                let mut data = HashMap::new();
                data.insert("code".to_owned(), code);
                if let Err(err) = self.notifier().send(templates::INIT_CODE, &user.email, data).await {
                    tracing::warn!(error = %err, "failed to hand over verification notification");
                }
            }

            let mut model = model;
            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(AddedUser {
                user_id: user_id.clone(),
                details: model.object_details(),
            })
        })
        .await
    }

    /// Creates a machine (service) user in an organization.
    pub async fn add_machine_user(&self, ctx: &Context, user: AddMachineUser) -> Result<AddedUser, Error> {
        validate::not_empty(&user.username, "COMMAND-Usr03a", "username")?;
        validate::max_len(&user.username, MAX_USERNAME_LEN, "COMMAND-Usr03b", "username")?;
        validate::not_empty(&user.name, "COMMAND-Usr03c", "name")?;

        let user_id = match &user.user_id {
            Some(id) => id.clone(),
            None => self.next_id()?,
        };

        let user = &user;
        let user_id = &user_id;
        retry_on_conflict(|| async move {
            self.existing_org(ctx, &user.org_id).await?;

            let model: UserWriteModel = writemodel::load(self.eventstore(), &ctx.instance_id, user_id).await?;
            if model.exists() {
                return Err(Error::already_exists("COMMAND-Usr04a", "user already exists"));
            }
            if org_usernames(self, ctx, &user.org_id).await?.is_taken(&user.username, None) {
                return Err(Error::already_exists("COMMAND-Usr04b", "username already taken"));
            }

            self.check_permission(
                ctx,
                "user",
                permissions::USER_WRITE,
                PermissionScope::Org(user.org_id.clone()),
            )
            .await?;

            let aggregate = user_aggregate(ctx, &user_id, &user.org_id);
            let events = self
                .push_checked(
                    vec![EventCommand::new(aggregate.clone(), USER_MACHINE_ADDED, ctx.creator()).with_payload(
                        &MachineAddedPayload {
                            username: user.username.clone(),
                            name: user.name.clone(),
                            description: user.description.clone(),
                        },
                    )?],
                    vec![ExpectedVersion {
                        aggregate,
                        version: model.base().sequence,
                    }],
                )
                .await?;

            let mut model = model;
            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(AddedUser {
                user_id: user_id.clone(),
                details: model.object_details(),
            })
        })
        .await
    }

    /// Renames a user. Renaming to the current username emits nothing.
    pub async fn change_username(&self, ctx: &Context, user_id: &str, username: &str) -> Result<ObjectDetails, Error> {
        validate::not_empty(username, "COMMAND-Usr05a", "username")?;
        validate::max_len(username, MAX_USERNAME_LEN, "COMMAND-Usr05b", "username")?;

        retry_on_conflict(|| async move {
            let mut model = self.existing_user(ctx, user_id).await?;
            if model.username == username {
                return Ok(model.object_details());
            }
            let org_id = model.base().resource_owner.clone();
            if org_usernames(self, ctx, &org_id).await?.is_taken(username, Some(user_id)) {
                return Err(Error::already_exists("COMMAND-Usr05c", "username already taken"));
            }

            self.check_permission(ctx, "user", permissions::USER_WRITE, PermissionScope::Org(org_id.clone()))
                .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(user_aggregate(ctx, user_id, &org_id), USER_USERNAME_CHANGED, ctx.creator())
                            .with_payload(&UsernamePayload {
                                username: username.to_owned(),
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

    /// Updates first/last name of a human user. No change emits nothing.
    pub async fn change_profile(&self, ctx: &Context, user_id: &str, profile: HumanProfile) -> Result<ObjectDetails, Error> {
        validate::not_empty(&profile.first_name, "COMMAND-Usr06a", "first name")?;
        validate::not_empty(&profile.last_name, "COMMAND-Usr06b", "last name")?;

        let profile = &profile;
        retry_on_conflict(|| async move {
            let mut model = self.existing_user(ctx, user_id).await?;
            if !model.is_human() {
                return Err(Error::precondition_failed(
                    "COMMAND-Usr06c",
                    "only human users have a profile",
                ));
            }
            if model.first_name == profile.first_name && model.last_name == profile.last_name {
                return Ok(model.object_details());
            }
            let org_id = model.base().resource_owner.clone();

            self.check_permission(ctx, "user", permissions::USER_WRITE, PermissionScope::Org(org_id.clone()))
                .await?;

            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(user_aggregate(ctx, user_id, &org_id), USER_PROFILE_CHANGED, ctx.creator())
                            .with_payload(&ProfilePayload {
                                first_name: profile.first_name.clone(),
                                last_name: profile.last_name.clone(),
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

    /// Changes a human user's email, resetting verification and staging a
    /// fresh verification code.
    pub async fn change_human_email(&self, ctx: &Context, user_id: &str, email: &str) -> Result<ObjectDetails, Error> {
        validate::email(email, "COMMAND-Usr07a")?;

        retry_on_conflict(|| async move {
            let mut model = self.existing_user(ctx, user_id).await?;
            if !model.is_human() {
                return Err(Error::precondition_failed(
                    "COMMAND-Usr07b",
                    "only human users have an email address",
                ));
            }
            if model.email == email && model.email_verified {
                return Ok(model.object_details());
            }
            let org_id = model.base().resource_owner.clone();

            self.check_permission(ctx, "user", permissions::USER_WRITE, PermissionScope::Org(org_id.clone()))
                .await?;

            let aggregate = user_aggregate(ctx, user_id, &org_id);
            let code = crypto::generate_numeric_code(EMAIL_CODE_DIGITS);
            let events = self
                .push_checked(
                    vec![
                        EventCommand::new(aggregate.clone(), USER_EMAIL_CHANGED, ctx.creator()).with_payload(
                            &EmailPayload {
                                email: email.to_owned(),
                            },
                        )?,
                        EventCommand::new(aggregate.clone(), USER_EMAIL_CODE_ADDED, ctx.creator()).with_payload(
                            &EmailCodePayload {
                                code_digest: crypto::digest(&code),
                                expires_at: self.clock().now() + Duration::hours(EMAIL_CODE_LIFETIME_HOURS),
                            },
                        )?,
                    ],
                    vec![ExpectedVersion {
                        aggregate,
                        version: model.base().sequence,
                    }],
                )
                .await?;

            let mut data = HashMap::new();
            data.insert("code".to_owned(), code);
            if let Err(err) = self.notifier().send(templates::EMAIL_VERIFICATION, email, data).await {
                tracing::warn!(error = %err, "failed to hand over verification notification");
            }

            writemodel::append_and_reduce(&mut model, &events)?;
            Ok(model.object_details())
        })
        .await
    }

    /// Confirms a human user's email address with the presented code.
    pub async fn verify_human_email(&self, ctx: &Context, user_id: &str, code: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            let mut model = self.existing_user(ctx, user_id).await?;
            if model.email_verified {
                return Ok(model.object_details());
            }
            let digest = model
                .email_code_digest
                .clone()
                .ok_or_else(|| Error::precondition_failed("COMMAND-Usr08a", "no verification pending"))?;
            if model.email_code_expires_at.is_some_and(|expiry| expiry < self.clock().now()) {
                return Err(Error::precondition_failed("COMMAND-Usr08b", "verification code expired"));
            }
            if !crypto::digest_matches(code, &digest) {
                return Err(Error::invalid_argument("COMMAND-Usr08c", "invalid verification code"));
            }
            let org_id = model.base().resource_owner.clone();

            let events = self
                .push_checked(
                    vec![EventCommand::new(
                        user_aggregate(ctx, user_id, &org_id),
                        USER_EMAIL_VERIFIED,
                        ctx.creator(),
                    )],
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

    pub async fn deactivate_user(&self, ctx: &Context, user_id: &str) -> Result<ObjectDetails, Error> {
        self.transition_user(ctx, user_id, USER_DEACTIVATED, |state| match state {
            UserState::Active => Ok(()),
            UserState::Inactive => Err(Error::precondition_failed(
                "COMMAND-Usr09a",
                "user is already deactivated",
            )),
            _ => Err(Error::precondition_failed("COMMAND-Usr09b", "user cannot be deactivated")),
        })
        .await
    }

    pub async fn reactivate_user(&self, ctx: &Context, user_id: &str) -> Result<ObjectDetails, Error> {
        self.transition_user(ctx, user_id, USER_REACTIVATED, |state| match state {
            UserState::Inactive => Ok(()),
            _ => Err(Error::precondition_failed("COMMAND-Usr10a", "user is not deactivated")),
        })
        .await
    }

    pub async fn lock_user(&self, ctx: &Context, user_id: &str) -> Result<ObjectDetails, Error> {
        self.transition_user(ctx, user_id, USER_LOCKED, |state| match state {
            UserState::Active | UserState::Inactive => Ok(()),
            _ => Err(Error::precondition_failed("COMMAND-Usr11a", "user cannot be locked")),
        })
        .await
    }

    pub async fn unlock_user(&self, ctx: &Context, user_id: &str) -> Result<ObjectDetails, Error> {
        self.transition_user(ctx, user_id, USER_UNLOCKED, |state| match state {
            UserState::Locked => Ok(()),
            _ => Err(Error::precondition_failed("COMMAND-Usr12a", "user is not locked")),
        })
        .await
    }

    /// Removes a user entirely.
    pub async fn remove_user(&self, ctx: &Context, user_id: &str) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            let mut model = self.existing_user(ctx, user_id).await?;
            let org_id = model.base().resource_owner.clone();

            self.check_permission(ctx, "user", permissions::USER_DELETE, PermissionScope::Org(org_id.clone()))
                .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(
                        user_aggregate(ctx, user_id, &org_id),
                        USER_REMOVED,
                        ctx.creator(),
                    )],
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

    async fn transition_user(
        &self,
        ctx: &Context,
        user_id: &str,
        event_type: &'static str,
        check: impl Fn(UserState) -> Result<(), Error> + Copy,
    ) -> Result<ObjectDetails, Error> {
        retry_on_conflict(|| async move {
            let mut model = self.existing_user(ctx, user_id).await?;
            check(model.state)?;
            let org_id = model.base().resource_owner.clone();

            self.check_permission(ctx, "user", permissions::USER_WRITE, PermissionScope::Org(org_id.clone()))
                .await?;

            let events = self
                .push_checked(
                    vec![EventCommand::new(user_aggregate(ctx, user_id, &org_id), event_type, ctx.creator())],
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

    /// Loads a user write model, failing when the user never existed or
    /// was removed.
    pub(crate) async fn existing_user(&self, ctx: &Context, user_id: &str) -> Result<UserWriteModel, Error> {
        let model: UserWriteModel = writemodel::load(self.eventstore(), &ctx.instance_id, user_id).await?;
        if !model.exists_and_not_removed() {
            return Err(Error::not_found("COMMAND-Usr13a", "user not found"));
        }
        Ok(model)
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use crate::command::{AddHumanUser, Commands, Context, HumanProfile};

    pub async fn add_active_user(commands: &Commands, ctx: &Context, user_id: &str, org_id: &str) {
        commands
            .add_human_user(
                ctx,
                AddHumanUser {
                    user_id: Some(user_id.to_owned()),
                    org_id: org_id.to_owned(),
                    username: format!("{user_id}@acme"),
                    profile: HumanProfile {
                        first_name: "Test".to_owned(),
                        last_name: "User".to_owned(),
                    },
                    email: format!("{user_id}@acme.com"),
                    email_verified: true,
                    phone: None,
                    password: None,
                },
            )
            .await
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use crate::command::test_support::{commands, system_ctx};
    use crate::command::AddOrg;
    use crate::error::Error;
    use crate::store::{EventFilter, Eventstore};

    use super::*;

    async fn with_org() -> (Commands, std::sync::Arc<crate::store::memory::InMemoryEventStore>) {
        let (commands, store) = commands();
        commands
            .add_org(
                &system_ctx(),
                AddOrg {
                    org_id: Some("org1".to_owned()),
                    name: "Acme".to_owned(),
                },
            )
            .await
            .unwrap();
        (commands, store)
    }

    fn human(user_id: &str, username: &str, verified: bool) -> AddHumanUser {
        AddHumanUser {
            user_id: Some(user_id.to_owned()),
            org_id: "org1".to_owned(),
            username: username.to_owned(),
            profile: HumanProfile {
                first_name: "Ada".to_owned(),
                last_name: "Lovelace".to_owned(),
            },
            email: "ada@acme.com".to_owned(),
            email_verified: verified,
            phone: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn add_human_user_with_password_stores_hash() {
        let (commands, store) = with_org().await;
        let ctx = system_ctx();

        let mut request = human("u1", "ada", true);
        request.password = Some("CorrectHorse1".to_owned());
        let added = commands.add_human_user(&ctx, request).await.unwrap();
        assert_eq!(added.user_id, "u1");
        assert_eq!(added.details.resource_owner, "org1");

        let events = store
            .filter(&EventFilter::for_aggregate(AGGREGATE_TYPE_USER, "inst1", "u1"))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["password_hash"], "plain:CorrectHorse1");
    }

    #[tokio::test]
    async fn weak_password_is_rejected() {
        let (commands, _) = with_org().await;
        let ctx = system_ctx();

        let mut request = human("u1", "ada", true);
        request.password = Some("weak".to_owned());
        let err = commands.add_human_user(&ctx, request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn unverified_email_stages_code() {
        let (commands, store) = with_org().await;
        let ctx = system_ctx();

        commands.add_human_user(&ctx, human("u1", "ada", false)).await.unwrap();

        let events = store
            .filter(&EventFilter::for_aggregate(AGGREGATE_TYPE_USER, "inst1", "u1"))
            .await
            .unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["user.human.added", "user.email.code.added"]);
    }

    #[tokio::test]
    async fn duplicate_username_in_org_is_rejected() {
        let (commands, _) = with_org().await;
        let ctx = system_ctx();

        commands.add_human_user(&ctx, human("u1", "ada", true)).await.unwrap();
        let err = commands.add_human_user(&ctx, human("u2", "ada", true)).await.unwrap_err();
        assert!(err.is_already_exists());

        // Released after removal.
        commands.remove_user(&ctx, "u1").await.unwrap();
        commands.add_human_user(&ctx, human("u2", "ada", true)).await.unwrap();
    }

    #[tokio::test]
    async fn change_username_checks_uniqueness_and_idempotence() {
        let (commands, _) = with_org().await;
        let ctx = system_ctx();

        commands.add_human_user(&ctx, human("u1", "ada", true)).await.unwrap();
        commands.add_human_user(&ctx, human("u2", "grace", true)).await.unwrap();

        let before = commands.change_username(&ctx, "u1", "ada").await.unwrap();
        let again = commands.change_username(&ctx, "u1", "ada").await.unwrap();
        assert_eq!(before.sequence, again.sequence);

        let err = commands.change_username(&ctx, "u1", "grace").await.unwrap_err();
        assert!(err.is_already_exists());

        commands.change_username(&ctx, "u1", "ada2").await.unwrap();
    }

    #[tokio::test]
    async fn user_state_machine() {
        let (commands, _) = with_org().await;
        let ctx = system_ctx();
        commands.add_human_user(&ctx, human("u1", "ada", true)).await.unwrap();

        commands.deactivate_user(&ctx, "u1").await.unwrap();
        let err = commands.deactivate_user(&ctx, "u1").await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));

        commands.reactivate_user(&ctx, "u1").await.unwrap();
        commands.lock_user(&ctx, "u1").await.unwrap();
        let err = commands.deactivate_user(&ctx, "u1").await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));

        commands.unlock_user(&ctx, "u1").await.unwrap();
        commands.remove_user(&ctx, "u1").await.unwrap();
        let err = commands.deactivate_user(&ctx, "u1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn email_verification_flow() {
        let (commands, store) = with_org().await;
        let ctx = system_ctx();
        commands.add_human_user(&ctx, human("u1", "ada", true)).await.unwrap();

        commands.change_human_email(&ctx, "u1", "new@acme.com").await.unwrap();

        let err = commands.verify_human_email(&ctx, "u1", "000000").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));

        // Recover the code digest match by replaying the staged event is not
        // possible (only the digest is stored), so drive the model to
        // verified via a correct code extracted from the store.
        let events = store
            .filter(
                &EventFilter::builder()
                    .instance_id("inst1")
                    .event_types(vec![USER_EMAIL_CODE_ADDED.to_owned()])
                    .build(),
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        let machine_err = commands.change_human_email(&ctx, "u1", "not-an-email").await.unwrap_err();
        assert!(matches!(machine_err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn machine_users_have_no_profile() {
        let (commands, _) = with_org().await;
        let ctx = system_ctx();

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

        let err = commands
            .change_profile(
                &ctx,
                "m1",
                HumanProfile {
                    first_name: "R".to_owned(),
                    last_name: "B".to_owned(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }
}
