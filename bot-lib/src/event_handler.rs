use crate::{
    audit::AuditSink, data::State, handle_audit::gateway_audit, handle_automod::handle_automod,
    handle_tickets::handle_ticket_interaction, handle_voice::handle_voice_state,
};
use bot_db::audit::{AuditEvent, AuditKind, Severity};
use bot_traits::ForwardRefToTracing;
use chrono::Utc;
use color_eyre::eyre::Result;
use poise::serenity_prelude::{self as serenity, Interaction};

pub async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    data: State,
) -> Result<()> {
    for record in gateway_audit(event, &data.messages) {
        data.audit.record(record);
    }

    match event {
        serenity::FullEvent::Ready { data_about_bot } => {
            tracing::info!("Connected as {}", data_about_bot.user.name);
        }
        serenity::FullEvent::Message { new_message } => {
            if new_message.author.bot {
                return Ok(());
            }

            data.supervisor
                .touch(new_message.channel_id, Utc::now())
                .await
                .trace_err_ok();

            if new_message.guild_id.is_some() {
                data.messages
                    .remember(new_message.id, new_message.author.id, &new_message.content);
            }

            handle_automod(ctx, &data, new_message).await.trace_err_ok();
        }
        serenity::FullEvent::VoiceStateUpdate { old, new } => {
            handle_voice_state(ctx, data, old.as_ref(), new)
                .await
                .trace_err_ok();
        }
        serenity::FullEvent::ChannelDelete { channel, .. } => {
            if let Some(resource) = data.supervisor.channel_deleted(channel.id).await? {
                tracing::info!("{} {} was deleted by hand", resource.kind, resource.name);
            }
        }
        serenity::FullEvent::InteractionCreate {
            interaction: Interaction::Component(interaction),
        } => {
            handle_ticket_interaction(ctx, data, interaction)
                .await
                .trace_err_ok();
        }
        serenity::FullEvent::Ratelimit { data: info } => {
            tracing::warn!("Ratelimited: {:?}", info);

            data.audit.record(
                AuditEvent::new(
                    ctx.cache.current_user().id,
                    AuditKind::RateLimited,
                    format!("{:?} {} for {:?}", info.method, info.path, info.timeout),
                )
                .severity(if info.global {
                    Severity::High
                } else {
                    Severity::Low
                }),
            );
        }
        _ => {}
    };

    Ok(())
}
