use crate::{
    data::State,
    dispatch::ActionKind,
    ephemeral::{EphemeralResource, ProvisionError, ResourceKind, SupervisorError},
    utils::format_remaining,
};
use bot_traits::ForwardRefToTracing;
use chrono::Utc;
use color_eyre::eyre::{OptionExt, Result};
use poise::serenity_prelude::{
    self as serenity, ChannelId, ChannelType, CreateChannel, CreateEmbed, CreateMessage, GuildId,
    Member,
    PermissionOverwrite, PermissionOverwriteType, Permissions, VoiceState,
};

pub async fn handle_voice_state(
    ctx: &serenity::Context,
    data: State,
    old: Option<&VoiceState>,
    new: &VoiceState,
) -> Result<()> {
    let joined = new.channel_id;
    let left = old
        .and_then(|old| old.channel_id)
        .filter(|&left| Some(left) != joined);
    let now = Utc::now();

    if let Some(left) = left {
        data.supervisor.check_occupancy(left, now).await?;
    }

    let Some(joined) = joined else {
        return Ok(());
    };

    let hub = data
        .supervisor
        .registry()
        .call(move |r| r.hub(joined))
        .await?;

    match hub {
        Some(category) => {
            let member = new.member.as_ref().ok_or_eyre("Voice state without member")?;
            let category = category.or_else(|| parent_of(ctx, member.guild_id, joined));

            create_from_hub(ctx, &data, member, category).await
        }
        None => {
            data.supervisor.activate(joined, now).await?;
            Ok(())
        }
    }
}

fn parent_of(ctx: &serenity::Context, guild: GuildId, channel: ChannelId) -> Option<ChannelId> {
    ctx.cache
        .guild(guild)
        .and_then(|guild| guild.channels.get(&channel).and_then(|c| c.parent_id))
}

/// Someone joined a hub: give them their own channel and move them there.
async fn create_from_hub(
    ctx: &serenity::Context,
    data: &State,
    member: &Member,
    category: Option<ChannelId>,
) -> Result<()> {
    let guild = member.guild_id;
    let user = member.user.id;
    let http = ctx.http.as_ref();
    let dispatcher = &data.dispatcher;

    let reservation = match data
        .supervisor
        .provision(user, ResourceKind::Voice, Utc::now())
        .await
    {
        Ok(reservation) => reservation,
        Err(SupervisorError::Provision(ProvisionError::Cooldown { remaining })) => {
            let remaining = format_remaining(remaining);
            tracing::debug!("{} is on voice cooldown for {remaining}", member.user.name);

            dispatcher
                .send(ActionKind::Manage, || guild.disconnect_member(http, user))
                .await
                .warn_err_ok("Could not disconnect member on cooldown");

            dispatcher
                .send_dm(
                    http,
                    user,
                    CreateMessage::new().content(format!(
                        "Please wait {remaining} before creating another voice channel, or ask a moderator to remove your cooldown."
                    )),
                )
                .await
                .warn_err_ok("Could not DM member on cooldown");

            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let name = format!("{}'s Channel", member.display_name());
    let owner_permissions = PermissionOverwrite {
        allow: Permissions::MANAGE_CHANNELS
            | Permissions::CONNECT
            | Permissions::SPEAK
            | Permissions::MOVE_MEMBERS
            | Permissions::PRIORITY_SPEAKER,
        deny: Permissions::empty(),
        kind: PermissionOverwriteType::Member(user),
    };

    let created = dispatcher
        .send(ActionKind::Manage, || {
            let mut builder = CreateChannel::new(name.clone())
                .kind(ChannelType::Voice)
                .permissions(vec![owner_permissions.clone()])
                .audit_log_reason("Temporary voice channel");
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
            dispatcher
                .send(ActionKind::Manage, || guild.disconnect_member(http, user))
                .await
                .trace_err_ok();
            return Err(e.into());
        }
    };

    data.supervisor
        .register(
            reservation,
            EphemeralResource::new(
                channel.id,
                guild,
                user,
                ResourceKind::Voice,
                name,
                Utc::now(),
            ),
        )
        .await?;

    if let Err(e) = dispatcher
        .send(ActionKind::Manage, || guild.move_member(http, user, channel.id))
        .await
    {
        // the scan picks the empty channel up once the grace period is over
        tracing::warn!("Could not move {} into {}: {e}", member.user.name, channel.name);
    }

    welcome_once(ctx, data, member, &channel.name).await?;

    Ok(())
}

/// First-time owners get a DM explaining what they can do with their channel.
async fn welcome_once(
    ctx: &serenity::Context,
    data: &State,
    member: &Member,
    channel: &str,
) -> Result<()> {
    let user = member.user.id;
    let registry = data.supervisor.registry();

    if registry.call(move |r| r.is_welcomed(user)).await? {
        return Ok(());
    }

    let embed = CreateEmbed::new()
        .title("Your voice channel is ready")
        .description(format!(
            "You own **{channel}** until everyone leaves, then it is deleted automatically."
        ))
        .field(
            "What you can do",
            "Rename it, change who may join, lock it, or move members in and out from the channel settings.",
            false,
        )
        .field(
            "Need another?",
            "Join the hub again once your cooldown is over.",
            false,
        );

    let sent = data
        .dispatcher
        .send_dm(ctx.http.as_ref(), user, CreateMessage::new().embed(embed))
        .await
        .warn_err_ok("Could not send the voice channel walkthrough");

    // closed DMs are retried next time
    if sent.is_some() {
        registry.call(move |r| r.mark_welcomed(user)).await?;
    }

    Ok(())
}
