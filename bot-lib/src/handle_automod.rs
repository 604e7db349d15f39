use crate::{TimeoutExt, audit::AuditSink, data::State, dispatch::ActionKind};
use bot_db::audit::{AuditEvent, AuditKind, Severity};
use bot_traits::ForwardRefToTracing;
use color_eyre::eyre::Result;
use poise::serenity_prelude::{self as serenity, CreateEmbed, CreateMessage, GuildId, Message};

const BAN_REASON: &str = "AutoMod: use of banned words";

/// Runs a guild message past the word filter and the duplicate tracker.
pub async fn handle_automod(ctx: &serenity::Context, data: &State, message: &Message) -> Result<()> {
    let Some(guild) = message.guild_id else {
        return Ok(());
    };

    if let Some(word) = data.words.find(&message.content) {
        if !data.is_privileged(message.author.id).await {
            return handle_banned_word(ctx, data, guild, message, &word).await;
        }
    }

    handle_spam(ctx, data, guild, message).await
}

/// Removes the message, bans the author when configured and lets them know why.
async fn handle_banned_word(
    ctx: &serenity::Context,
    data: &State,
    guild: GuildId,
    message: &Message,
    word: &str,
) -> Result<()> {
    let author = &message.author;
    let http = ctx.http.as_ref();
    let ban = data.words.bans();

    tracing::info!("{} used banned word {word:?} in {}", author.name, message.channel_id);

    data.dispatcher
        .send(ActionKind::Manage, || message.delete(http))
        .await
        .warn_err_ok("Could not delete message with banned word");

    // before the ban, afterwards there is no shared guild to DM through
    data.dispatcher
        .send_dm(
            http,
            author.id,
            CreateMessage::new().content(if ban {
                "You were banned for using a banned word."
            } else {
                "Your message was removed because it contained a banned word."
            }),
        )
        .await
        .warn_err_ok("Could not DM member about banned word");

    if ban {
        data.dispatcher
            .send(ActionKind::Manage, || {
                guild.ban_with_reason(http, author.id, 0, BAN_REASON)
            })
            .await
            .warn_err_ok("Could not ban member");
    }

    let action = if ban { "Banned" } else { "Message removed" };
    report(
        ctx,
        data,
        CreateEmbed::new()
            .title("AutoMod: banned word")
            .field("User", format!("<@{}>", author.id), true)
            .field("Channel", format!("<#{}>", message.channel_id), true)
            .field("Action", action, true)
            .field("Matched", format!("`{word}`"), false),
    )
    .await;

    data.audit.record(
        AuditEvent::new(author.id, AuditKind::BannedWord, action)
            .context(word)
            .channel(message.channel_id)
            .severity(Severity::High),
    );

    Ok(())
}

/// Deletes the whole run of repeated messages, times the author out and lets
/// them know why.
async fn handle_spam(
    ctx: &serenity::Context,
    data: &State,
    guild: GuildId,
    message: &Message,
) -> Result<()> {
    let author = &message.author;
    let Some(run) = data
        .spam
        .observe(author.id, (message.channel_id, message.id), &message.content)
    else {
        return Ok(());
    };
    if data.is_privileged(author.id).await {
        return Ok(());
    }

    let timeout = data.spam.config().timeout;
    let http = ctx.http.as_ref();

    tracing::info!(
        "{} flagged for {} duplicate messages in {}",
        author.name,
        run.len(),
        message.channel_id
    );

    for (channel, id) in &run {
        data.dispatcher
            .send(ActionKind::Manage, || channel.delete_message(http, *id))
            .await
            .warn_err_ok("Could not delete spam message");
    }

    guild
        .timeout(ctx, &author.id, timeout, "Duplicate message spam")
        .await
        .warn_err_ok("Could not time out spammer");

    data.dispatcher
        .send_dm(
            http,
            author.id,
            CreateMessage::new().content(format!(
                "You were timed out for {} for sending the same message repeatedly.",
                humantime::format_duration(timeout)
            )),
        )
        .await
        .warn_err_ok("Could not DM spammer");

    report(
        ctx,
        data,
        CreateEmbed::new()
            .title("AutoMod: spam")
            .field("User", format!("<@{}>", author.id), true)
            .field("Channel", format!("<#{}>", message.channel_id), true)
            .field("Removed", run.len().to_string(), true)
            .field(
                "Timed out for",
                humantime::format_duration(timeout).to_string(),
                true,
            ),
    )
    .await;

    data.audit.record(
        AuditEvent::new(author.id, AuditKind::SpamDetected, "Repeated identical messages")
            .context(message.content.chars().take(200).collect::<String>())
            .channel(message.channel_id)
            .severity(Severity::High),
    );

    Ok(())
}

/// Posts to the moderation log channel, if one is configured.
async fn report(ctx: &serenity::Context, data: &State, embed: CreateEmbed) {
    let Some(channel) = data.config.read().await.log_channel else {
        return;
    };

    data.dispatcher
        .send_message(ctx.http.as_ref(), channel, CreateMessage::new().embed(embed))
        .await
        .warn_err_ok("Could not post to the log channel");
}
