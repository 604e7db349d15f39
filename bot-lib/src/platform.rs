use crate::{
    dispatch::{is_not_found, ActionKind, DispatchError, Dispatcher},
    ephemeral::{EphemeralResource, Platform, ReclaimReason, ResourceKind},
    CloneableCtx,
};
use color_eyre::eyre::{eyre, Result};
use poise::serenity_prelude::CacheHttp;

/// Discord as seen by the ephemeral resource supervisor.
///
/// Occupancy comes from the gateway cache, deletes go through the
/// [`Dispatcher`] so they share its retries and counters.
pub struct DiscordPlatform {
    ctx: CloneableCtx,
    dispatcher: Dispatcher,
}

impl DiscordPlatform {
    pub fn new(ctx: CloneableCtx, dispatcher: Dispatcher) -> Self {
        Self { ctx, dispatcher }
    }
}

impl Platform for DiscordPlatform {
    /// Text channels and tickets only ever report whether they still exist,
    /// they are cleaned up by inactivity instead.
    async fn occupants(&self, resource: &EphemeralResource) -> Result<Option<usize>> {
        let cache = &self.ctx.0;
        let Some(guild) = cache.guild(resource.guild) else {
            return Err(eyre!("guild {} is not cached yet", resource.guild));
        };

        if !guild.channels.contains_key(&resource.id) {
            return Ok(None);
        }

        Ok(Some(match resource.kind {
            ResourceKind::Voice => guild
                .voice_states
                .values()
                .filter(|state| state.channel_id == Some(resource.id))
                .count(),
            ResourceKind::Text | ResourceKind::Ticket => 1,
        }))
    }

    async fn delete(&self, resource: &EphemeralResource, reason: ReclaimReason) -> Result<()> {
        let http = self.ctx.http();
        let channel = resource.id;
        let audit_reason = format!("Temporary {} {reason}", resource.kind);
        let audit_reason = audit_reason.as_str();

        let result = self
            .dispatcher
            .send(ActionKind::Manage, || async move {
                http.delete_channel(channel, Some(audit_reason)).await
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(DispatchError::Rejected(e)) if is_not_found(&e) => {
                tracing::debug!("{} was already deleted", resource.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
