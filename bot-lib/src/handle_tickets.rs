use crate::{
    data::State,
    dispatch::{ActionKind, DispatchError, Origin},
    ephemeral::{
        CloseActor, EphemeralResource, ProvisionError, ResourceKind, SupervisorError,
    },
    utils::GetRelativeTimestamp,
};
use bot_traits::ForwardRefToTracing;
use chrono::{DateTime, Utc};
use color_eyre::eyre::{OptionExt, Result};
use poise::serenity_prelude::{
    self as serenity, ButtonStyle, ChannelId, ChannelType, ComponentInteraction,
    CreateActionRow, CreateAttachment, CreateButton, CreateChannel, CreateEmbed,
    CreateInteractionResponse, CreateInteractionResponseMessage, CreateMessage,
    EditInteractionResponse, GetMessages, GuildId, Member, PermissionOverwrite,
    PermissionOverwriteType, Permissions, RoleId, User, UserId,
};

pub const TICKET_OPEN: &str = "ticket_open";
pub const TICKET_CLAIM: &str = "ticket_claim";
pub const CLOSE_REQUEST: &str = "close_request";
pub const CLOSE_CONFIRM: &str = "close_confirm";
pub const CLOSE_CANCEL: &str = "close_cancel";

pub fn panel_message() -> CreateMessage {
    CreateMessage::new()
        .embed(
            CreateEmbed::new()
                .title("Support")
                .description("Press the button below to open a private ticket with the staff."),
        )
        .components(vec![CreateActionRow::Buttons(vec![
            CreateButton::new(TICKET_OPEN)
                .label("Create Ticket")
                .style(ButtonStyle::Primary),
        ])])
}

fn ticket_buttons() -> Vec<CreateActionRow> {
    vec![CreateActionRow::Buttons(vec![
        CreateButton::new(TICKET_CLAIM)
            .label("Claim Ticket")
            .style(ButtonStyle::Success),
        CreateButton::new(CLOSE_REQUEST)
            .label("Close Ticket")
            .style(ButtonStyle::Danger),
    ])]
}

pub fn close_confirmation_buttons() -> Vec<CreateActionRow> {
    vec![CreateActionRow::Buttons(vec![
        CreateButton::new(CLOSE_CONFIRM)
            .label("Confirm Close")
            .style(ButtonStyle::Danger),
        CreateButton::new(CLOSE_CANCEL)
            .label("Cancel")
            .style(ButtonStyle::Secondary),
    ])]
}

/// Who is acting, and whether they count as staff.
pub async fn close_actor(data: &State, user: &User, member: Option<&Member>) -> CloseActor {
    let has_permission = member
        .and_then(|m| m.permissions)
        .is_some_and(|p| p.manage_channels() || p.administrator());

    CloseActor {
        user: user.id,
        privileged: has_permission || data.is_privileged(user.id).await,
    }
}

fn ticket_name(display_name: &str) -> String {
    format!("ticket-{display_name}")
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .take(50)
        .collect()
}

const STAFF_PERMISSIONS: Permissions = Permissions::VIEW_CHANNEL
    .union(Permissions::SEND_MESSAGES)
    .union(Permissions::MANAGE_MESSAGES)
    .union(Permissions::READ_MESSAGE_HISTORY);

/// Hidden from everyone but the owner, the bot and staff.
fn ticket_overwrites(
    guild: GuildId,
    owner: UserId,
    bot: UserId,
    staff_roles: &[RoleId],
    staff_users: &[UserId],
) -> Vec<PermissionOverwrite> {
    let mut overwrites = vec![
        PermissionOverwrite {
            allow: Permissions::empty(),
            deny: Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES,
            kind: PermissionOverwriteType::Role(RoleId::new(guild.get())),
        },
        PermissionOverwrite {
            allow: Permissions::VIEW_CHANNEL
                | Permissions::SEND_MESSAGES
                | Permissions::ATTACH_FILES
                | Permissions::EMBED_LINKS
                | Permissions::READ_MESSAGE_HISTORY,
            deny: Permissions::empty(),
            kind: PermissionOverwriteType::Member(owner),
        },
        PermissionOverwrite {
            allow: STAFF_PERMISSIONS,
            deny: Permissions::empty(),
            kind: PermissionOverwriteType::Member(bot),
        },
    ];

    overwrites.extend(staff_roles.iter().map(|&role| PermissionOverwrite {
        allow: STAFF_PERMISSIONS,
        deny: Permissions::empty(),
        kind: PermissionOverwriteType::Role(role),
    }));
    // one overwrite per member, the owner's already covers them
    overwrites.extend(
        staff_users
            .iter()
            .filter(|&&user| user != owner && user != bot)
            .map(|&user| PermissionOverwrite {
                allow: STAFF_PERMISSIONS,
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Member(user),
            }),
    );

    overwrites
}

/// Roles that can manage channels, and so count as staff.
fn staff_roles(ctx: &serenity::Context, guild: GuildId) -> Vec<RoleId> {
    let mut roles: Vec<_> = ctx
        .cache
        .guild(guild)
        .map(|guild_ref| {
            guild_ref
                .roles
                .values()
                .filter(|role| role.id.get() != guild.get())
                .filter(|role| {
                    role.permissions.manage_channels() || role.permissions.administrator()
                })
                .map(|role| role.id)
                .collect()
        })
        .unwrap_or_default();
    roles.sort();
    roles
}

/// Creates a ticket channel for `user` and returns the text to show them.
pub async fn open_ticket(
    ctx: &serenity::Context,
    data: &State,
    guild: GuildId,
    user: &User,
    member: Option<&Member>,
    origin: Origin,
) -> Result<String> {
    let (category, staff_users) = {
        let config = data.config.read().await;
        (config.ticket_category, config.privileged_users.clone())
    };

    let reservation = match data
        .supervisor
        .provision(user.id, ResourceKind::Ticket, Utc::now())
        .await
    {
        Ok(reservation) => reservation,
        Err(SupervisorError::Provision(ProvisionError::TooManyOpen { open, .. })) => {
            return Ok(format!(
                "You already have {open} open tickets. Please close one before opening another."
            ));
        }
        Err(SupervisorError::Provision(e)) => return Ok(format!("You can't open a ticket: {e}")),
        Err(e) => return Err(e.into()),
    };

    let http = ctx.http.as_ref();
    let bot = ctx.cache.current_user().id;
    let name = ticket_name(member.map_or_else(|| user.display_name(), |m| m.display_name()));
    let overwrites = ticket_overwrites(
        guild,
        user.id,
        bot,
        &staff_roles(ctx, guild),
        &staff_users,
    );

    let created = data
        .dispatcher
        .send_gated(origin, ActionKind::Manage, || {
            let mut builder = CreateChannel::new(name.clone())
                .kind(ChannelType::Text)
                .permissions(overwrites.clone())
                .audit_log_reason("Ticket opened");
            if let Some(category) = category {
                builder = builder.category(category);
            }
            guild.create_channel(http, builder)
        })
        .await;

    let channel = match created {
        Ok(channel) => channel,
        Err(e) => {
            data.supervisor.abort_provision(reservation).await?;
            return match e {
                DispatchError::Throttled(check) => Ok(check.explain().unwrap_or_default()),
                e => Err(e.into()),
            };
        }
    };

    data.supervisor
        .register(
            reservation,
            EphemeralResource::new(
                channel.id,
                guild,
                user.id,
                ResourceKind::Ticket,
                name,
                Utc::now(),
            ),
        )
        .await?;

    data.dispatcher
        .send_message(
            http,
            channel.id,
            CreateMessage::new()
                .content(format!(
                    "Welcome <@{}>! Describe your issue and a staff member will be with you shortly.",
                    user.id
                ))
                .components(ticket_buttons()),
        )
        .await
        .warn_err_ok("Could not post the ticket welcome message");

    tracing::info!("{} opened ticket {}", user.name, channel.name);

    Ok(format!("Your ticket has been created: <#{}>", channel.id))
}

/// Starts the close confirmation for `channel` and returns the prompt.
pub async fn request_close(
    data: &State,
    channel: ChannelId,
    actor: CloseActor,
) -> Result<std::result::Result<String, String>> {
    match data.supervisor.request_close(channel, actor, Utc::now()).await {
        Ok(deadline) => Ok(Ok(format!(
            "<@{}> wants to close this channel. Confirm {}.",
            actor.user,
            deadline.discord_relative_timestamp()
        ))),
        Err(SupervisorError::Close(e)) => Ok(Err(format!("Can't close: {e}."))),
        Err(e) => Err(e.into()),
    }
}

/// The last messages of a ticket, oldest first.
async fn fetch_transcript(ctx: &serenity::Context, channel: ChannelId) -> Option<String> {
    let messages = channel
        .messages(ctx, GetMessages::new().limit(100))
        .await
        .warn_err_ok("Could not read the ticket history")?;

    Some(render_transcript(messages.iter().rev().map(|message| {
        (
            message.timestamp.to_string(),
            message.author.name.as_str(),
            message.content.as_str(),
        )
    })))
}

fn render_transcript<'a>(lines: impl IntoIterator<Item = (String, &'a str, &'a str)>) -> String {
    lines
        .into_iter()
        .map(|(at, author, content)| {
            let content = if content.is_empty() {
                "(no text)"
            } else {
                content
            };
            format!("[{at}] {author}: {content}\n")
        })
        .collect()
}

fn close_summary(
    resource: &EphemeralResource,
    closed_by: UserId,
    closed_at: DateTime<Utc>,
) -> CreateEmbed {
    let handled_by = resource
        .claimed_by
        .map(|staff| format!("<@{staff}>"))
        .unwrap_or_else(|| "Unclaimed".to_owned());

    CreateEmbed::new()
        .title("Ticket closed")
        .field("Ticket", format!("#{}", resource.name), true)
        .field("Closed by", format!("<@{closed_by}>"), true)
        .field("Handled by", handled_by, true)
        .field(
            "Opened",
            resource.created_at.discord_relative_timestamp(),
            true,
        )
        .field("Closed", closed_at.discord_relative_timestamp(), true)
}

/// DMs the owner a summary of their closed ticket, with the history attached
/// when it could be read.
async fn send_transcript(
    ctx: &serenity::Context,
    data: &State,
    resource: &EphemeralResource,
    closed_by: UserId,
    transcript: Option<String>,
) {
    let mut message = CreateMessage::new().embed(close_summary(resource, closed_by, Utc::now()));
    if let Some(transcript) = transcript {
        message = message.add_file(CreateAttachment::bytes(
            transcript.into_bytes(),
            format!("{}.txt", resource.name),
        ));
    }

    let sent = data
        .dispatcher
        .send_dm(ctx.http.as_ref(), resource.owner, message)
        .await
        .warn_err_ok("Could not DM the ticket transcript");

    if sent.is_some() {
        tracing::debug!("Sent the transcript of {} to {}", resource.name, resource.owner);
    }
}

async fn respond(
    ctx: &serenity::Context,
    interaction: &ComponentInteraction,
    message: CreateInteractionResponseMessage,
) -> Result<()> {
    interaction
        .create_response(ctx, CreateInteractionResponse::Message(message))
        .await?;
    Ok(())
}

async fn respond_ephemeral(
    ctx: &serenity::Context,
    interaction: &ComponentInteraction,
    content: impl Into<String>,
) -> Result<()> {
    respond(
        ctx,
        interaction,
        CreateInteractionResponseMessage::new()
            .content(content)
            .ephemeral(true),
    )
    .await
}

/// Handles ticket and close buttons. Returns false for buttons that belong
/// to someone else.
pub async fn handle_ticket_interaction(
    ctx: &serenity::Context,
    data: State,
    interaction: &ComponentInteraction,
) -> Result<bool> {
    let guild = interaction
        .guild_id
        .ok_or_eyre("Button must be used in a guild")?;
    let channel = interaction.channel_id;
    let actor = close_actor(&data, &interaction.user, interaction.member.as_ref()).await;

    match interaction.data.custom_id.as_str() {
        TICKET_OPEN => {
            interaction.defer_ephemeral(ctx).await?;

            let reply = open_ticket(
                ctx,
                &data,
                guild,
                &interaction.user,
                interaction.member.as_ref(),
                Origin::from(interaction),
            )
            .await?;

            interaction
                .edit_response(ctx, EditInteractionResponse::new().content(reply))
                .await?;
        }
        TICKET_CLAIM => {
            if !actor.privileged {
                respond_ephemeral(ctx, interaction, "Only staff can claim tickets.").await?;
                return Ok(true);
            }

            match data.supervisor.claim(channel, actor.user).await {
                Ok(()) => {
                    respond(
                        ctx,
                        interaction,
                        CreateInteractionResponseMessage::new()
                            .content(format!("This ticket was claimed by <@{}>.", actor.user)),
                    )
                    .await?;
                }
                Err(SupervisorError::Claim(e)) => {
                    respond_ephemeral(ctx, interaction, format!("Can't claim: {e}.")).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        CLOSE_REQUEST => match request_close(&data, channel, actor).await? {
            Ok(prompt) => {
                respond(
                    ctx,
                    interaction,
                    CreateInteractionResponseMessage::new()
                        .content(prompt)
                        .components(close_confirmation_buttons()),
                )
                .await?;
            }
            Err(reason) => respond_ephemeral(ctx, interaction, reason).await?,
        },
        CLOSE_CONFIRM => {
            interaction
                .create_response(ctx, CreateInteractionResponse::Acknowledge)
                .await?;

            let closing_ticket = data
                .supervisor
                .registry()
                .call(move |r| {
                    r.get(channel)
                        .is_some_and(|r| r.kind == ResourceKind::Ticket && r.may_close(actor))
                })
                .await?;
            // read while the channel still exists
            let transcript = if closing_ticket {
                fetch_transcript(ctx, channel).await
            } else {
                None
            };

            match data.supervisor.confirm_close(channel, actor, Utc::now()).await {
                Ok(resource) => {
                    tracing::info!("{} closed {}", interaction.user.name, resource.name);

                    if resource.kind == ResourceKind::Ticket {
                        send_transcript(ctx, &data, &resource, actor.user, transcript).await;
                    }
                }
                Err(SupervisorError::Close(e)) => {
                    interaction
                        .create_followup(
                            ctx,
                            serenity::CreateInteractionResponseFollowup::new()
                                .content(format!("Can't close: {e}."))
                                .ephemeral(true),
                        )
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        CLOSE_CANCEL => match data.supervisor.cancel_close(channel, actor).await {
            Ok(()) => {
                interaction
                    .create_response(
                        ctx,
                        CreateInteractionResponse::UpdateMessage(
                            CreateInteractionResponseMessage::new()
                                .content("Close cancelled.")
                                .components(vec![]),
                        ),
                    )
                    .await?;
            }
            Err(SupervisorError::Close(e)) => {
                respond_ephemeral(ctx, interaction, format!("Can't cancel: {e}.")).await?;
            }
            Err(e) => return Err(e.into()),
        },
        _ => return Ok(false),
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUILD: GuildId = GuildId::new(1);
    const OWNER: UserId = UserId::new(10);
    const BOT: UserId = UserId::new(99);

    fn target(overwrite: &PermissionOverwrite) -> PermissionOverwriteType {
        overwrite.kind
    }

    #[test]
    fn tickets_are_named_after_the_display_name() {
        assert_eq!(ticket_name("Jane Doe"), "ticket-jane-doe");
        assert_eq!(ticket_name(&"a".repeat(80)).len(), 50);
    }

    #[test]
    fn staff_roles_and_users_can_see_tickets() {
        let moderators = RoleId::new(5);
        let staff = UserId::new(20);
        let overwrites = ticket_overwrites(GUILD, OWNER, BOT, &[moderators], &[staff, OWNER]);

        let everyone = &overwrites[0];
        assert_eq!(
            target(everyone),
            PermissionOverwriteType::Role(RoleId::new(GUILD.get()))
        );
        assert!(everyone.deny.view_channel());

        for kind in [
            PermissionOverwriteType::Role(moderators),
            PermissionOverwriteType::Member(staff),
            PermissionOverwriteType::Member(BOT),
        ] {
            let overwrite = overwrites
                .iter()
                .find(|o| target(o) == kind)
                .unwrap_or_else(|| panic!("no overwrite for {kind:?}"));
            assert!(overwrite.allow.view_channel());
            assert!(overwrite.allow.send_messages());
            assert!(overwrite.allow.manage_messages());
        }

        // a privileged owner still gets exactly one member overwrite
        let owner = overwrites
            .iter()
            .filter(|o| target(o) == PermissionOverwriteType::Member(OWNER))
            .count();
        assert_eq!(owner, 1);
        assert_eq!(overwrites.len(), 5);
    }

    #[test]
    fn transcripts_have_one_line_per_message() {
        let transcript = render_transcript([
            ("2024-01-01T10:00:00Z".to_owned(), "jane", "my printer is on fire"),
            ("2024-01-01T10:01:00Z".to_owned(), "staff", ""),
        ]);

        assert_eq!(
            transcript,
            "[2024-01-01T10:00:00Z] jane: my printer is on fire\n\
             [2024-01-01T10:01:00Z] staff: (no text)\n"
        );
    }
}
