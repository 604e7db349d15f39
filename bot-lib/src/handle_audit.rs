use crate::audit::MessageMemory;
use bot_db::audit::{AuditEvent, AuditKind, Severity};
use itertools::Itertools;
use poise::serenity_prelude::{FullEvent, RoleId};

/// Stands in for the actor when the gateway doesn't say who did it.
const UNKNOWN: u64 = 0;

/// Translates membership, message and channel events into audit records.
pub fn gateway_audit(event: &FullEvent, memory: &MessageMemory) -> Vec<AuditEvent> {
    match event {
        FullEvent::GuildMemberAddition { new_member } => {
            let user = &new_member.user;
            vec![
                AuditEvent::new(user.id, AuditKind::MemberJoined, format!("{} joined", user.name))
                    .context(format!("account created {}", user.id.created_at()))
                    .severity(Severity::Low),
            ]
        }
        FullEvent::GuildMemberRemoval { user, .. } => vec![
            AuditEvent::new(user.id, AuditKind::MemberLeft, format!("{} left", user.name))
                .severity(Severity::Low),
        ],
        FullEvent::GuildBanAddition { banned_user, .. } => vec![
            AuditEvent::new(
                banned_user.id,
                AuditKind::MemberBanned,
                format!("{} was banned", banned_user.name),
            )
            .severity(Severity::High),
        ],
        FullEvent::GuildBanRemoval { unbanned_user, .. } => vec![AuditEvent::new(
            unbanned_user.id,
            AuditKind::MemberUnbanned,
            format!("{} was unbanned", unbanned_user.name),
        )],
        FullEvent::MessageDelete {
            channel_id,
            deleted_message_id,
            ..
        } => memory
            .take(*deleted_message_id)
            .map(|message| {
                AuditEvent::new(message.author, AuditKind::MessageDeleted, "Message deleted")
                    .context(message.excerpt)
                    .channel(*channel_id)
                    .severity(Severity::Low)
            })
            .into_iter()
            .collect(),
        FullEvent::MessageDeleteBulk {
            channel_id,
            multiple_deleted_messages_ids,
            ..
        } => {
            for id in multiple_deleted_messages_ids {
                memory.take(*id);
            }
            vec![
                AuditEvent::new(
                    UNKNOWN,
                    AuditKind::MessagesBulkDeleted,
                    format!("{} messages deleted", multiple_deleted_messages_ids.len()),
                )
                .channel(*channel_id),
            ]
        }
        FullEvent::GuildMemberUpdate {
            old_if_available: Some(old),
            event,
            ..
        } => {
            let (added, removed) = role_changes(&old.roles, &event.roles);
            let user = event.user.id;

            added
                .into_iter()
                .map(|role| (AuditKind::RoleAdded, "Role added", role))
                .chain(
                    removed
                        .into_iter()
                        .map(|role| (AuditKind::RoleRemoved, "Role removed", role)),
                )
                .map(|(kind, reason, role)| {
                    AuditEvent::new(user, kind, reason)
                        .context(format!("<@&{role}>"))
                        .severity(Severity::Low)
                })
                .collect()
        }
        FullEvent::ChannelCreate { channel } => vec![
            AuditEvent::new(
                UNKNOWN,
                AuditKind::ChannelCreated,
                format!("#{} created", channel.name),
            )
            .channel(channel.id)
            .severity(Severity::Low),
        ],
        FullEvent::ChannelUpdate { old: Some(old), new } => {
            let changes = [
                field_change("name", Some(old.name.as_str()), Some(new.name.as_str())),
                field_change("topic", old.topic.as_deref(), new.topic.as_deref()),
            ]
            .into_iter()
            .flatten()
            .join("; ");

            if changes.is_empty() {
                return vec![];
            }
            vec![
                AuditEvent::new(
                    UNKNOWN,
                    AuditKind::ChannelUpdated,
                    format!("#{} updated", new.name),
                )
                .context(changes)
                .channel(new.id)
                .severity(Severity::Low),
            ]
        }
        FullEvent::ChannelDelete { channel, .. } => vec![
            AuditEvent::new(
                UNKNOWN,
                AuditKind::ChannelDeleted,
                format!("#{} deleted", channel.name),
            )
            .channel(channel.id),
        ],
        FullEvent::GuildUpdate {
            old_data_if_available: Some(old),
            new_data: new,
        } => {
            let old_icon = old.icon.map(|hash| hash.to_string());
            let new_icon = new.icon.map(|hash| hash.to_string());
            let changes = [
                field_change("name", Some(old.name.as_str()), Some(new.name.as_str())),
                field_change("icon", old_icon.as_deref(), new_icon.as_deref()),
                field_change("banner", old.banner.as_deref(), new.banner.as_deref()),
            ]
            .into_iter()
            .flatten()
            .join("; ");

            if changes.is_empty() {
                return vec![];
            }
            vec![
                AuditEvent::new(UNKNOWN, AuditKind::GuildUpdated, "Server settings changed")
                    .context(changes)
                    .severity(Severity::Low),
            ]
        }
        _ => vec![],
    }
}

/// Roles in `new` but not `old`, and the other way around.
fn role_changes(old: &[RoleId], new: &[RoleId]) -> (Vec<RoleId>, Vec<RoleId>) {
    let added = new.iter().filter(|r| !old.contains(r)).copied().collect();
    let removed = old.iter().filter(|r| !new.contains(r)).copied().collect();

    (added, removed)
}

fn field_change(field: &str, old: Option<&str>, new: Option<&str>) -> Option<String> {
    (old != new).then(|| {
        format!(
            "{field}: {} -> {}",
            old.unwrap_or("none"),
            new.unwrap_or("none")
        )
    })
}
