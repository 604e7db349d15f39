use crate::{commands::is_moderator, data::PoiseContext, ephemeral::ResourceKind};
use color_eyre::eyre::Result;
use poise::{CreateReply, serenity_prelude::CreateEmbed};

/// Show dispatch counters, rate limit state and open temporary channels
#[poise::command(slash_command, ephemeral = true, guild_only, check = is_moderator)]
pub async fn stats(ctx: PoiseContext<'_>) -> Result<()> {
    let data = ctx.data();
    let dispatch = data.dispatcher.stats();

    let ledger = match data.dispatcher.ledger() {
        Some(ledger) => {
            let stats = ledger.stats().await?;
            format!(
                "{} users and {} channels tracked\n{} users and {} channels blocked\n{} requests in the global window",
                stats.active_users,
                stats.active_channels,
                stats.blocked_users,
                stats.blocked_channels,
                stats.global_requests
            )
        }
        None => "Disabled".to_owned(),
    };

    let resources = data.supervisor.registry().call(|r| r.list()).await?;
    let open = |kind| resources.iter().filter(|r| r.kind == kind).count();

    let embed = CreateEmbed::new()
        .title("Steward stats")
        .field(
            "Dispatch",
            format!(
                "{} sent, {} edited, {} managed\n{} retries, {} rate limited, {} throttled, {} errors",
                dispatch.sent,
                dispatch.edited,
                dispatch.managed,
                dispatch.retries,
                dispatch.rate_limited,
                dispatch.throttled,
                dispatch.errors
            ),
            false,
        )
        .field("Rate limits", ledger, false)
        .field(
            "Open",
            format!(
                "{} voice channels, {} text channels, {} tickets",
                open(ResourceKind::Voice),
                open(ResourceKind::Text),
                open(ResourceKind::Ticket)
            ),
            false,
        )
        .field(
            "Background task failures",
            data.tasks.failures().to_string(),
            false,
        );

    ctx.send(CreateReply::default().embed(embed)).await?;

    Ok(())
}

/// Check every temporary channel now instead of waiting for the next scan
#[poise::command(slash_command, ephemeral = true, guild_only, check = is_moderator)]
pub async fn cleanup(ctx: PoiseContext<'_>) -> Result<()> {
    let report = ctx.data().supervisor.scan(chrono::Utc::now()).await?;

    if report.skipped {
        ctx.say("A scan is already running, try again in a moment.")
            .await?;
        return Ok(());
    }

    ctx.say(format!(
        "Checked {}, removed {}, forgot {} already deleted, {} failed.",
        report.checked, report.reclaimed, report.forgotten, report.failed
    ))
    .await?;

    Ok(())
}
