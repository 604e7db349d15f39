use crate::{
    data::PoiseContext,
    handle_tickets::{close_actor, close_confirmation_buttons, request_close},
};
use color_eyre::eyre::Result;
use poise::CreateReply;

/// Close this temporary channel or ticket, after a confirmation
#[poise::command(slash_command, guild_only)]
pub async fn close(ctx: PoiseContext<'_>) -> Result<()> {
    let member = ctx.author_member().await;
    let actor = close_actor(ctx.data(), ctx.author(), member.as_deref()).await;

    let reply = match request_close(ctx.data(), ctx.channel_id(), actor).await? {
        Ok(prompt) => CreateReply::default()
            .content(prompt)
            .components(close_confirmation_buttons()),
        Err(reason) => CreateReply::default().content(reason).ephemeral(true),
    };

    ctx.send(reply).await?;

    Ok(())
}
