use crate::{
    commands::is_moderator,
    data::PoiseContext,
    dispatch::{ActionKind, DispatchError},
    ephemeral::ResourceKind,
};
use color_eyre::eyre::{OptionExt, Result};
use poise::serenity_prelude::{ChannelType, CreateChannel, GuildChannel, User};

pub const HUB_NAME: &str = "➕ Create Voice Channel";

/// Parent command for temporary voice channels
#[poise::command(
    slash_command,
    subcommands("setup", "removecooldown"),
    guild_only,
    check = is_moderator
)]
pub async fn tempvoice(_: PoiseContext<'_>) -> Result<()> {
    Ok(())
}

/// Create a hub channel that hands out temporary voice channels
#[poise::command(slash_command, ephemeral = true, guild_only, check = is_moderator)]
async fn setup(
    ctx: PoiseContext<'_>,
    #[description = "Category for the hub and the channels it creates"]
    #[channel_types("Category")]
    category: Option<GuildChannel>,
) -> Result<()> {
    let guild = ctx.guild_id().ok_or_eyre("Command must be used in a guild")?;
    let category = category.map(|category| category.id);
    let data = ctx.data();
    let http = ctx.http();

    let hub = data
        .dispatcher
        .send_gated(ctx.into(), ActionKind::Manage, || {
            let mut builder = CreateChannel::new(HUB_NAME)
                .kind(ChannelType::Voice)
                .audit_log_reason("Temporary voice hub");
            if let Some(category) = category {
                builder = builder.category(category);
            }
            guild.create_channel(http, builder)
        })
        .await;

    let hub = match hub {
        Ok(hub) => hub,
        Err(DispatchError::Throttled(check)) => {
            ctx.say(check.explain().unwrap_or_default()).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    data.supervisor
        .registry()
        .call(move |r| r.add_hub(hub.id, category))
        .await?;

    tracing::info!("{} created voice hub {}", ctx.author().name, hub.id);

    ctx.say(format!(
        "Created <#{}>. Join it to get your own voice channel.",
        hub.id
    ))
    .await?;

    Ok(())
}

/// Let someone create a voice channel again right away
#[poise::command(slash_command, ephemeral = true, guild_only, check = is_moderator)]
async fn removecooldown(
    ctx: PoiseContext<'_>,
    #[description = "The member whose cooldown to remove"] user: User,
) -> Result<()> {
    let owner = user.id;
    let removed = ctx
        .data()
        .supervisor
        .registry()
        .call(move |r| r.clear_cooldown(owner, ResourceKind::Voice))
        .await?;

    if removed {
        ctx.say(format!("Removed the voice cooldown for <@{owner}>."))
            .await?;
    } else {
        ctx.say(format!("<@{owner}> has no voice cooldown.")).await?;
    }

    Ok(())
}
