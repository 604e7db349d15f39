//! Channels and tickets created on behalf of members, and their cleanup.
//!
//! [`registry::Registry`] is the bookkeeping (pure, owned by one task through
//! [`crate::actor::Confined`]); [`supervisor::Supervisor`] drives it against
//! discord through a [`Platform`].

pub mod registry;
pub mod supervisor;

use chrono::{DateTime, TimeDelta, Utc};
use color_eyre::eyre::Result;
use poise::serenity_prelude::{ChannelId, GuildId, UserId};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::{fmt, future::Future, time::Duration};
use thiserror::Error;

pub use registry::{Registry, RegistrySnapshot, Reservation};
pub use supervisor::{ScanReport, Settled, Supervisor, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Voice,
    Text,
    Ticket,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Voice => "voice channel",
            ResourceKind::Text => "text channel",
            ResourceKind::Ticket => "ticket",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Created, nobody has shown up yet.
    Provisioned,
    Active,
    /// Waiting for the closer to confirm before `deadline`.
    CloseRequested {
        by: UserId,
        deadline: DateTime<Utc>,
    },
    /// The platform delete is in flight.
    Reclaiming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralResource {
    pub id: ChannelId,
    pub guild: GuildId,
    pub owner: UserId,
    pub kind: ResourceKind,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub claimed_by: Option<UserId>,
    pub state: ResourceState,
}

impl EphemeralResource {
    /// Voice channels start out provisioned until someone joins; text
    /// channels and tickets are in use right away.
    pub fn new(
        id: ChannelId,
        guild: GuildId,
        owner: UserId,
        kind: ResourceKind,
        name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            guild,
            owner,
            kind,
            name: name.into(),
            created_at: now,
            last_activity_at: now,
            claimed_by: None,
            state: match kind {
                ResourceKind::Voice => ResourceState::Provisioned,
                ResourceKind::Text | ResourceKind::Ticket => ResourceState::Active,
            },
        }
    }

    pub fn may_close(&self, actor: CloseActor) -> bool {
        actor.privileged || actor.user == self.owner || Some(actor.user) == self.claimed_by
    }
}

/// Someone trying to close a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseActor {
    pub user: UserId,
    /// Holds a management permission in the guild.
    pub privileged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    Empty,
    Inactive,
    Closed { by: UserId },
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReclaimReason::Empty => f.write_str("empty"),
            ReclaimReason::Inactive => f.write_str("inactive"),
            ReclaimReason::Closed { by } => write!(f, "closed by {by}"),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("on cooldown for another {} seconds", remaining.num_seconds())]
    Cooldown { remaining: TimeDelta },
    #[error("{open} already open, the limit is {max}")]
    TooManyOpen { open: usize, max: usize },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseError {
    #[error("not a tracked resource")]
    Unknown,
    #[error("only the owner, the assigned staff member or a moderator can close this")]
    NotAllowed,
    #[error("no close was requested")]
    NotRequested,
    #[error("the close confirmation expired")]
    Expired,
    #[error("already being closed")]
    AlreadyClosing,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimError {
    #[error("not a tracked ticket")]
    Unknown,
    #[error("already claimed by {0}")]
    AlreadyClaimed(UserId),
}

/// Per kind rules for provisioning and automatic cleanup.
#[serde_as]
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct KindPolicy {
    /// Minimum time between two creations by the same owner.
    #[serde_as(as = "Option<DurationSeconds<i64>>")]
    pub cooldown: Option<TimeDelta>,
    /// Most resources of this kind one owner may hold at once.
    pub max_open: Option<usize>,
    /// Reclaim after this long without activity.
    #[serde_as(as = "Option<DurationSeconds<i64>>")]
    pub idle_timeout: Option<TimeDelta>,
}

#[serde_as]
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct EphemeralConfig {
    pub voice: KindPolicy,
    pub text: KindPolicy,
    pub ticket: KindPolicy,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub scan_interval: Duration,
    #[serde_as(as = "DurationSeconds<i64>")]
    pub close_confirmation: TimeDelta,
    /// How long a fresh voice channel may sit empty before the scan looks at it.
    #[serde_as(as = "DurationSeconds<i64>")]
    pub provision_grace: TimeDelta,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            voice: KindPolicy {
                cooldown: Some(TimeDelta::seconds(300)),
                ..Default::default()
            },
            text: KindPolicy {
                cooldown: Some(TimeDelta::seconds(30)),
                ..Default::default()
            },
            ticket: KindPolicy {
                max_open: Some(3),
                idle_timeout: Some(TimeDelta::days(1)),
                ..Default::default()
            },
            scan_interval: Duration::from_secs(10),
            close_confirmation: TimeDelta::seconds(30),
            provision_grace: TimeDelta::seconds(30),
        }
    }
}

impl EphemeralConfig {
    pub fn policy(&self, kind: ResourceKind) -> &KindPolicy {
        match kind {
            ResourceKind::Voice => &self.voice,
            ResourceKind::Text => &self.text,
            ResourceKind::Ticket => &self.ticket,
        }
    }
}

/// The chat platform as far as cleanup is concerned.
pub trait Platform: Send + Sync + 'static {
    /// How many members are in the resource, `None` once it no longer exists.
    fn occupants(
        &self,
        resource: &EphemeralResource,
    ) -> impl Future<Output = Result<Option<usize>>> + Send;

    /// Deletes the resource. Deleting something that's already gone succeeds.
    fn delete(
        &self,
        resource: &EphemeralResource,
        reason: ReclaimReason,
    ) -> impl Future<Output = Result<()>> + Send;
}
