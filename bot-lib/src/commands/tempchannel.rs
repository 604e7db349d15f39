use crate::{
    commands::is_moderator,
    data::PoiseContext,
    dispatch::{ActionKind, DispatchError},
    ephemeral::{EphemeralResource, ProvisionError, ResourceKind, SupervisorError},
    utils::format_remaining,
};
use chrono::Utc;
use color_eyre::eyre::{OptionExt, Result};
use poise::serenity_prelude::{ChannelType, CreateChannel, GuildChannel};

/// Two hours between messages per member.
const SLOWMODE_SECONDS: u16 = 7200;

/// Create a temporary text channel with a 2 hour slowmode
#[poise::command(slash_command, ephemeral = true, guild_only, check = is_moderator)]
pub async fn tempchannel(
    ctx: PoiseContext<'_>,
    #[description = "The name for the new channel"] name: String,
    #[description = "The category to create the channel in"]
    #[channel_types("Category")]
    category: Option<GuildChannel>,
) -> Result<()> {
    let guild = ctx.guild_id().ok_or_eyre("Command must be used in a guild")?;
    let data = ctx.data();
    let author = ctx.author().id;

    let name = name.trim().to_owned();
    if name.is_empty() || name.len() > 100 {
        ctx.say("Channel names must be between 1 and 100 characters.")
            .await?;
        return Ok(());
    }

    let (category, overwrites) = match category {
        Some(category) => (Some(category.id), category.permission_overwrites),
        None => (data.config.read().await.text_category, Vec::new()),
    };

    let reservation = match data
        .supervisor
        .provision(author, ResourceKind::Text, Utc::now())
        .await
    {
        Ok(reservation) => reservation,
        Err(SupervisorError::Provision(ProvisionError::Cooldown { remaining })) => {
            ctx.say(format!(
                "Please wait {} before creating another channel.",
                format_remaining(remaining)
            ))
            .await?;
            return Ok(());
        }
        Err(SupervisorError::Provision(e)) => {
            ctx.say(format!("You can't create a channel right now: {e}."))
                .await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let http = ctx.http();
    let created = data
        .dispatcher
        .send_gated(ctx.into(), ActionKind::Manage, || {
            let mut builder = CreateChannel::new(name.clone())
                .kind(ChannelType::Text)
                .rate_limit_per_user(SLOWMODE_SECONDS)
                .permissions(overwrites.clone())
                .audit_log_reason("Temporary text channel");
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
                DispatchError::Throttled(check) => {
                    ctx.say(check.explain().unwrap_or_default()).await?;
                    Ok(())
                }
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
                author,
                ResourceKind::Text,
                channel.name.clone(),
                Utc::now(),
            ),
        )
        .await?;

    tracing::info!("{} created temporary channel {}", ctx.author().name, channel.name);

    ctx.say(format!(
        "Created <#{}> with a 2 hour slowmode. Use `/close` inside it when you're done.",
        channel.id
    ))
    .await?;

    Ok(())
}
