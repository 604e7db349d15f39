use crate::{commands::is_moderator, data::PoiseContext, utils::GetRelativeTimestamp};
use bot_db::audit::{AuditEvent, AuditKind};
use color_eyre::eyre::Result;
use itertools::Itertools;
use poise::{CreateReply, serenity_prelude::CreateEmbed};

/// Parent command for the audit log
#[poise::command(
    slash_command,
    subcommands("recent", "counts"),
    guild_only,
    check = is_moderator
)]
pub async fn audit(_: PoiseContext<'_>) -> Result<()> {
    Ok(())
}

fn describe(event: &AuditEvent) -> String {
    let when = event
        .timestamp()
        .map(|at| at.discord_relative_timestamp())
        .unwrap_or_default();
    let channel = event
        .channel_id
        .map(|id| format!(" in <#{id}>"))
        .unwrap_or_default();
    let context = event
        .context
        .as_deref()
        .map(|context| format!(" ({context})"))
        .unwrap_or_default();

    format!(
        "{when} `{}` <@{}>{channel}: {}{context} [{:?}]",
        event.kind, event.actor_id, event.reason, event.severity
    )
}

/// Show the newest audit events
#[poise::command(slash_command, ephemeral = true, guild_only, check = is_moderator)]
async fn recent(
    ctx: PoiseContext<'_>,
    #[description = "How many events to show (default 10)"]
    #[min = 1]
    #[max = 25]
    limit: Option<usize>,
) -> Result<()> {
    let events = ctx
        .data()
        .audit
        .recent(limit.unwrap_or(10))
        .map(|event| describe(&event))
        .join("\n");

    if events.is_empty() {
        ctx.say("The audit log is empty.").await?;
    } else {
        ctx.send(
            CreateReply::default().embed(
                CreateEmbed::new()
                    .title("Recent audit events")
                    .description(events),
            ),
        )
        .await?;
    }

    Ok(())
}

/// Show how many events of each kind were recorded
#[poise::command(slash_command, ephemeral = true, guild_only, check = is_moderator)]
async fn counts(ctx: PoiseContext<'_>) -> Result<()> {
    let audit = &ctx.data().audit;

    let counts = AuditKind::ALL
        .into_iter()
        .map(|kind| Ok((kind, audit.count(kind)?)))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(kind, count)| format!("`{kind}`: {count}"))
        .join("\n");

    if counts.is_empty() {
        ctx.say("Nothing has been recorded yet.").await?;
        return Ok(());
    }

    ctx.say(counts).await?;

    Ok(())
}
