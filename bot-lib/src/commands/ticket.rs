use crate::{
    SayThenDelete,
    commands::is_moderator,
    data::PoiseContext,
    handle_tickets::{open_ticket, panel_message},
};
use color_eyre::eyre::{OptionExt, Result};

/// Parent command for support tickets
#[poise::command(slash_command, subcommands("panel", "open"), guild_only)]
pub async fn ticket(_: PoiseContext<'_>) -> Result<()> {
    Ok(())
}

/// Post the "Create Ticket" panel in this channel
#[poise::command(slash_command, guild_only, check = is_moderator)]
async fn panel(ctx: PoiseContext<'_>) -> Result<()> {
    ctx.data()
        .dispatcher
        .send_message(ctx.http(), ctx.channel_id(), panel_message())
        .await?;

    tracing::info!("{} posted a ticket panel in {}", ctx.author().name, ctx.channel_id());

    ctx.say_then_delete("Ticket panel posted.").await
}

/// Open a private ticket with the staff
#[poise::command(slash_command, guild_only)]
async fn open(ctx: PoiseContext<'_>) -> Result<()> {
    let guild = ctx.guild_id().ok_or_eyre("Command must be used in a guild")?;
    ctx.defer_ephemeral().await?;

    let member = ctx.author_member().await;
    let reply = open_ticket(
        ctx.serenity_context(),
        ctx.data(),
        guild,
        ctx.author(),
        member.as_deref(),
        ctx.into(),
    )
    .await?;

    ctx.say(reply).await?;

    Ok(())
}
