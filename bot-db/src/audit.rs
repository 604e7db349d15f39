use crate::{ReadWriteTree, StewardDb};
use chrono::{DateTime, Utc};
use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditKind {
    ResourceCreated,
    ResourceReclaimed,
    TicketClaimed,
    SpamDetected,
    RateLimited,
    BannedWord,
    MemberJoined,
    MemberLeft,
    MemberBanned,
    MemberUnbanned,
    RoleAdded,
    RoleRemoved,
    MessageDeleted,
    MessagesBulkDeleted,
    ChannelCreated,
    ChannelUpdated,
    ChannelDeleted,
    GuildUpdated,
}

impl AuditKind {
    /// Every kind, in declaration order. New kinds go at the end so stored
    /// records keep decoding.
    pub const ALL: [AuditKind; 18] = [
        AuditKind::ResourceCreated,
        AuditKind::ResourceReclaimed,
        AuditKind::TicketClaimed,
        AuditKind::SpamDetected,
        AuditKind::RateLimited,
        AuditKind::BannedWord,
        AuditKind::MemberJoined,
        AuditKind::MemberLeft,
        AuditKind::MemberBanned,
        AuditKind::MemberUnbanned,
        AuditKind::RoleAdded,
        AuditKind::RoleRemoved,
        AuditKind::MessageDeleted,
        AuditKind::MessagesBulkDeleted,
        AuditKind::ChannelCreated,
        AuditKind::ChannelUpdated,
        AuditKind::ChannelDeleted,
        AuditKind::GuildUpdated,
    ];
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditKind::ResourceCreated => "resource_created",
            AuditKind::ResourceReclaimed => "resource_reclaimed",
            AuditKind::TicketClaimed => "ticket_claimed",
            AuditKind::SpamDetected => "spam_detected",
            AuditKind::RateLimited => "rate_limited",
            AuditKind::BannedWord => "banned_word",
            AuditKind::MemberJoined => "member_joined",
            AuditKind::MemberLeft => "member_left",
            AuditKind::MemberBanned => "member_banned",
            AuditKind::MemberUnbanned => "member_unbanned",
            AuditKind::RoleAdded => "role_added",
            AuditKind::RoleRemoved => "role_removed",
            AuditKind::MessageDeleted => "message_deleted",
            AuditKind::MessagesBulkDeleted => "messages_bulk_deleted",
            AuditKind::ChannelCreated => "channel_created",
            AuditKind::ChannelUpdated => "channel_updated",
            AuditKind::ChannelDeleted => "channel_deleted",
            AuditKind::GuildUpdated => "guild_updated",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

/// A single audit record.
///
/// Ids are stored as plain `u64`s since bincode can't decode serenity's
/// string-or-number snowflakes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor_id: u64,
    pub kind: AuditKind,
    pub reason: String,
    pub context: Option<String>,
    pub channel_id: Option<u64>,
    pub severity: Severity,
    /// Unix seconds
    pub at: i64,
}

impl AuditEvent {
    pub fn new(actor_id: impl Into<u64>, kind: AuditKind, reason: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            kind,
            reason: reason.into(),
            context: None,
            channel_id: None,
            severity: Severity::default(),
            at: Utc::now().timestamp(),
        }
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn channel(mut self, channel_id: impl Into<u64>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.at, 0)
    }
}

/// Append-only audit log plus per-kind counters.
pub struct AuditLog {
    events: Tree,
    counts: Tree,
    db: StewardDb,
}

impl AuditLog {
    pub fn new(db: &StewardDb) -> Result<Self> {
        let events = db.open_tree("audit_events")?;
        let counts = db.open_tree("audit_counts")?;

        fn increment(
            _key: &[u8],
            old_value: Option<&[u8]>,
            _merged_bytes: &[u8],
        ) -> Option<Vec<u8>> {
            StewardDb::create_update_with_deserialization::<u64>(
                old_value,
                |value| value + 1,
                || 0,
            )
        }

        counts.set_merge_operator(increment);

        Ok(AuditLog {
            events,
            counts,
            db: db.clone(),
        })
    }

    pub fn insert(&self, event: &AuditEvent) -> Result<u64> {
        let id = self.db.generate_id()?;
        // Big-endian keys keep sled's lexicographic order chronological.
        self.events
            .insert(id.to_be_bytes(), bincode::serialize(event)?)?;
        self.counts.typed_merge::<AuditKind, u64>(&event.kind, &1)?;
        Ok(id)
    }

    pub fn count(&self, kind: AuditKind) -> Result<u64> {
        Ok(self.counts.typed_get::<AuditKind, u64>(&kind)?.unwrap_or(0))
    }

    /// The newest `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> impl Iterator<Item = AuditEvent> + '_ {
        self.events
            .iter()
            .rev()
            .filter_map(|i| i.ok())
            .filter_map(|(_, value)| bincode::deserialize::<AuditEvent>(&value).ok())
            .take(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_is_newest_first_and_counts_add_up() {
        let db = StewardDb::temporary().unwrap();
        let log = AuditLog::new(&db).unwrap();

        for reason in ["first", "second", "third"] {
            log.insert(&AuditEvent::new(7u64, AuditKind::ResourceReclaimed, reason))
                .unwrap();
        }
        log.insert(
            &AuditEvent::new(8u64, AuditKind::SpamDetected, "dupes")
                .channel(99u64)
                .severity(Severity::High),
        )
        .unwrap();

        let reasons: Vec<_> = log.recent(3).map(|e| e.reason).collect();
        assert_eq!(reasons, ["dupes", "third", "second"]);

        assert_eq!(log.count(AuditKind::ResourceReclaimed).unwrap(), 3);
        assert_eq!(log.count(AuditKind::SpamDetected).unwrap(), 1);
        assert_eq!(log.count(AuditKind::TicketClaimed).unwrap(), 0);
    }

    #[test]
    fn every_kind_is_listed_once_with_its_own_name() {
        let names: std::collections::HashSet<_> =
            AuditKind::ALL.iter().map(|kind| kind.to_string()).collect();
        assert_eq!(names.len(), AuditKind::ALL.len());

        // bincode stores the variant index, older records must keep theirs
        let encoded = bincode::serialize(&AuditKind::RateLimited).unwrap();
        assert_eq!(bincode::deserialize::<u32>(&encoded).unwrap(), 4);
        let encoded = bincode::serialize(&AuditKind::GuildUpdated).unwrap();
        assert_eq!(bincode::deserialize::<u32>(&encoded).unwrap(), 17);
    }
}
