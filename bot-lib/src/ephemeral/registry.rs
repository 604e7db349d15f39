use super::{
    ClaimError, CloseActor, CloseError, EphemeralConfig, EphemeralResource, ProvisionError,
    ResourceKind, ResourceState,
};
use crate::actor::Owned;
use ahash::{AHashMap, AHashSet};
use bot_db::snapshot::{LoadOutcome, SnapshotStore};
use bot_traits::ForwardRefToTracing;
use chrono::{DateTime, Utc};
use color_eyre::eyre::Result;
use poise::serenity_prelude::{ChannelId, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A slot handed out by [`Registry::provision`].
///
/// Either [`Registry::register`] or [`Registry::abort_provision`] must
/// consume it, otherwise the slot stays counted against the owner.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    pub owner: UserId,
    pub kind: ResourceKind,
    /// Whether provisioning wrote a cooldown stamp, and what it replaced.
    stamped: bool,
    previous_stamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownStamp {
    pub owner: UserId,
    pub kind: ResourceKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hub {
    pub channel: ChannelId,
    /// Where created channels go, next to the hub when `None`.
    pub category: Option<ChannelId>,
}

/// What survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub resources: Vec<EphemeralResource>,
    pub cooldowns: Vec<CooldownStamp>,
    pub hubs: Vec<Hub>,
    /// Owners who already got the voice channel walkthrough.
    #[serde(default)]
    pub welcomed: Vec<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCheck {
    /// Ask the platform how many members are inside.
    Occupancy,
    /// Idle past the kind's timeout.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    pub resource: EphemeralResource,
    pub check: ScanCheck,
}

pub struct Registry {
    config: EphemeralConfig,
    resources: AHashMap<ChannelId, EphemeralResource>,
    cooldowns: AHashMap<(UserId, ResourceKind), DateTime<Utc>>,
    reservations: AHashMap<(UserId, ResourceKind), usize>,
    /// State each resource was in before its reclaim began.
    reclaiming: AHashMap<ChannelId, ResourceState>,
    hubs: AHashMap<ChannelId, Option<ChannelId>>,
    welcomed: AHashSet<UserId>,
    store: Option<SnapshotStore<RegistrySnapshot>>,
    dirty: bool,
}

impl Registry {
    /// A registry that keeps everything in memory.
    pub fn new(config: EphemeralConfig) -> Self {
        Self {
            config,
            resources: AHashMap::new(),
            cooldowns: AHashMap::new(),
            reservations: AHashMap::new(),
            reclaiming: AHashMap::new(),
            hubs: AHashMap::new(),
            welcomed: AHashSet::new(),
            store: None,
            dirty: false,
        }
    }

    /// Loads the previous snapshot from `store` and keeps writing to it.
    pub fn with_store(
        config: EphemeralConfig,
        store: SnapshotStore<RegistrySnapshot>,
    ) -> Result<Self> {
        let (snapshot, outcome) = store.load()?;

        match &outcome {
            LoadOutcome::Loaded => tracing::info!(
                "Restored {} ephemeral resources from {}",
                snapshot.resources.len(),
                store.path().display()
            ),
            LoadOutcome::Missing => {
                tracing::info!("No registry snapshot at {}", store.path().display())
            }
            LoadOutcome::Recovered(aside) => {
                tracing::warn!("Registry snapshot was corrupt, kept at {}", aside.display())
            }
        }

        let mut registry = Self::new(config);
        registry.restore(snapshot);
        registry.store = Some(store);
        registry.dirty = outcome != LoadOutcome::Loaded;

        Ok(registry)
    }

    fn restore(&mut self, snapshot: RegistrySnapshot) {
        for mut resource in snapshot.resources {
            // Nobody is around to confirm or finish these anymore.
            if matches!(
                resource.state,
                ResourceState::CloseRequested { .. } | ResourceState::Reclaiming
            ) {
                resource.state = ResourceState::Active;
            }
            self.resources.insert(resource.id, resource);
        }

        for stamp in snapshot.cooldowns {
            self.cooldowns.insert((stamp.owner, stamp.kind), stamp.at);
        }

        for hub in snapshot.hubs {
            self.hubs.insert(hub.channel, hub.category);
        }

        self.welcomed.extend(snapshot.welcomed);
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut resources: Vec<_> = self.resources.values().cloned().collect();
        resources.sort_by_key(|r| r.id);

        let mut cooldowns: Vec<_> = self
            .cooldowns
            .iter()
            .map(|(&(owner, kind), &at)| CooldownStamp { owner, kind, at })
            .collect();
        cooldowns.sort_by_key(|s| (s.owner, s.at));

        let mut hubs: Vec<_> = self
            .hubs
            .iter()
            .map(|(&channel, &category)| Hub { channel, category })
            .collect();
        hubs.sort_by_key(|h| h.channel);

        let mut welcomed: Vec<_> = self.welcomed.iter().copied().collect();
        welcomed.sort();

        RegistrySnapshot {
            resources,
            cooldowns,
            hubs,
            welcomed,
        }
    }

    pub fn config(&self) -> &EphemeralConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: EphemeralConfig) {
        self.config = config;
    }

    pub fn get(&self, id: ChannelId) -> Option<&EphemeralResource> {
        self.resources.get(&id)
    }

    pub fn list(&self) -> Vec<EphemeralResource> {
        self.resources.values().cloned().collect()
    }

    /// Resources of `kind` held by `owner`, not counting reservations.
    pub fn open_by(&self, owner: UserId, kind: ResourceKind) -> usize {
        self.resources
            .values()
            .filter(|r| r.owner == owner && r.kind == kind)
            .count()
    }

    pub fn provision(
        &mut self,
        owner: UserId,
        kind: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<Reservation, ProvisionError> {
        let policy = *self.config.policy(kind);

        if let (Some(cooldown), Some(&last)) = (policy.cooldown, self.cooldowns.get(&(owner, kind)))
        {
            let elapsed = now - last;
            if elapsed < cooldown {
                return Err(ProvisionError::Cooldown {
                    remaining: cooldown - elapsed,
                });
            }
        }

        if let Some(max) = policy.max_open {
            let reserved = self.reservations.get(&(owner, kind)).copied().unwrap_or(0);
            let open = self.open_by(owner, kind) + reserved;
            if open >= max {
                return Err(ProvisionError::TooManyOpen { open, max });
            }
        }

        *self.reservations.entry((owner, kind)).or_default() += 1;
        let stamped = policy.cooldown.is_some();
        let previous_stamp = if stamped {
            self.cooldowns.insert((owner, kind), now)
        } else {
            None
        };
        self.dirty = true;

        Ok(Reservation {
            owner,
            kind,
            stamped,
            previous_stamp,
        })
    }

    fn release(&mut self, reservation: &Reservation) {
        let key = (reservation.owner, reservation.kind);
        if let Some(count) = self.reservations.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.reservations.remove(&key);
            }
        }
    }

    /// The platform couldn't create the resource, give the slot back and
    /// undo the cooldown stamp.
    pub fn abort_provision(&mut self, reservation: Reservation) {
        self.release(&reservation);

        if reservation.stamped {
            let key = (reservation.owner, reservation.kind);
            match reservation.previous_stamp {
                Some(at) => self.cooldowns.insert(key, at),
                None => self.cooldowns.remove(&key),
            };
        }
        self.dirty = true;
    }

    pub fn register(&mut self, reservation: Reservation, resource: EphemeralResource) {
        self.release(&reservation);
        tracing::debug!(
            "Registered {} {} for {}",
            resource.kind,
            resource.name,
            resource.owner
        );
        self.resources.insert(resource.id, resource);
        self.dirty = true;
    }

    /// A member showed up in a provisioned channel.
    pub fn activate(&mut self, id: ChannelId, now: DateTime<Utc>) -> bool {
        let Some(resource) = self.resources.get_mut(&id) else {
            return false;
        };

        resource.last_activity_at = now;
        if resource.state == ResourceState::Provisioned {
            resource.state = ResourceState::Active;
        }
        self.dirty = true;
        true
    }

    pub fn touch(&mut self, id: ChannelId, now: DateTime<Utc>) -> bool {
        match self.resources.get_mut(&id) {
            Some(resource) => {
                resource.last_activity_at = resource.last_activity_at.max(now);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn claim(&mut self, id: ChannelId, claimant: UserId) -> Result<(), ClaimError> {
        let resource = self
            .resources
            .get_mut(&id)
            .filter(|r| r.kind == ResourceKind::Ticket)
            .ok_or(ClaimError::Unknown)?;

        match resource.claimed_by {
            Some(current) if current != claimant => Err(ClaimError::AlreadyClaimed(current)),
            Some(_) => Ok(()),
            None => {
                resource.claimed_by = Some(claimant);
                self.dirty = true;
                Ok(())
            }
        }
    }

    /// Returns the deadline by which the close has to be confirmed.
    pub fn request_close(
        &mut self,
        id: ChannelId,
        actor: CloseActor,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CloseError> {
        let window = self.config.close_confirmation;
        let resource = self.resources.get_mut(&id).ok_or(CloseError::Unknown)?;

        if !resource.may_close(actor) {
            return Err(CloseError::NotAllowed);
        }
        if resource.state == ResourceState::Reclaiming {
            return Err(CloseError::AlreadyClosing);
        }

        let deadline = now + window;
        resource.state = ResourceState::CloseRequested {
            by: actor.user,
            deadline,
        };
        self.dirty = true;

        Ok(deadline)
    }

    /// Moves a pending close into reclamation and returns the resource to
    /// delete.
    pub fn confirm_close(
        &mut self,
        id: ChannelId,
        actor: CloseActor,
        now: DateTime<Utc>,
    ) -> Result<EphemeralResource, CloseError> {
        let resource = self.resources.get_mut(&id).ok_or(CloseError::Unknown)?;

        if !resource.may_close(actor) {
            return Err(CloseError::NotAllowed);
        }

        match resource.state {
            ResourceState::CloseRequested { deadline, .. } if now > deadline => {
                resource.state = ResourceState::Active;
                self.dirty = true;
                Err(CloseError::Expired)
            }
            ResourceState::CloseRequested { .. } => {
                let previous = std::mem::replace(&mut resource.state, ResourceState::Reclaiming);
                let resource = resource.clone();
                self.reclaiming.insert(id, previous);
                self.dirty = true;
                Ok(resource)
            }
            ResourceState::Reclaiming => Err(CloseError::AlreadyClosing),
            ResourceState::Provisioned | ResourceState::Active => Err(CloseError::NotRequested),
        }
    }

    pub fn cancel_close(&mut self, id: ChannelId, actor: CloseActor) -> Result<(), CloseError> {
        let resource = self.resources.get_mut(&id).ok_or(CloseError::Unknown)?;

        if !resource.may_close(actor) {
            return Err(CloseError::NotAllowed);
        }
        let ResourceState::CloseRequested { .. } = resource.state else {
            return Err(CloseError::NotRequested);
        };

        resource.state = ResourceState::Active;
        self.dirty = true;
        Ok(())
    }

    /// Marks `id` as being reclaimed. Only the first caller gets the
    /// resource back, every later call returns `None` until the reclaim is
    /// finished or aborted.
    pub fn begin_reclaim(&mut self, id: ChannelId) -> Option<EphemeralResource> {
        let resource = self.resources.get_mut(&id)?;
        if resource.state == ResourceState::Reclaiming {
            return None;
        }

        let previous = std::mem::replace(&mut resource.state, ResourceState::Reclaiming);
        self.reclaiming.insert(id, previous);
        self.dirty = true;
        Some(resource.clone())
    }

    pub fn finish_reclaim(&mut self, id: ChannelId) -> Option<EphemeralResource> {
        self.reclaiming.remove(&id);
        self.forget(id)
    }

    /// The delete failed, put the resource back the way it was.
    pub fn abort_reclaim(&mut self, id: ChannelId) {
        let previous = self.reclaiming.remove(&id);

        if let Some(resource) = self.resources.get_mut(&id) {
            resource.state = match previous {
                Some(ResourceState::Provisioned) => ResourceState::Provisioned,
                _ => ResourceState::Active,
            };
            self.dirty = true;
        }
    }

    /// Drops `id` without touching the platform.
    pub fn forget(&mut self, id: ChannelId) -> Option<EphemeralResource> {
        let removed = self.resources.remove(&id);
        if removed.is_some() {
            self.reclaiming.remove(&id);
            self.dirty = true;
        }
        removed
    }

    pub fn clear_cooldown(&mut self, owner: UserId, kind: ResourceKind) -> bool {
        let cleared = self.cooldowns.remove(&(owner, kind)).is_some();
        self.dirty |= cleared;
        cleared
    }

    pub fn add_hub(&mut self, channel: ChannelId, category: Option<ChannelId>) {
        self.hubs.insert(channel, category);
        self.dirty = true;
    }

    pub fn remove_hub(&mut self, channel: ChannelId) -> bool {
        let removed = self.hubs.remove(&channel).is_some();
        self.dirty |= removed;
        removed
    }

    /// `Some(category)` when `channel` is a join-to-create hub.
    pub fn hub(&self, channel: ChannelId) -> Option<Option<ChannelId>> {
        self.hubs.get(&channel).copied()
    }

    pub fn is_welcomed(&self, owner: UserId) -> bool {
        self.welcomed.contains(&owner)
    }

    /// Remembers that `owner` got the walkthrough. False if they already had.
    pub fn mark_welcomed(&mut self, owner: UserId) -> bool {
        let added = self.welcomed.insert(owner);
        self.dirty |= added;
        added
    }

    /// Drops cooldown stamps that no longer hold anyone back, including
    /// stamps for kinds whose cooldown was switched off.
    pub fn prune_cooldowns(&mut self, now: DateTime<Utc>) -> usize {
        let config = self.config;
        let before = self.cooldowns.len();

        self.cooldowns.retain(|(_, kind), at| {
            config
                .policy(*kind)
                .cooldown
                .is_some_and(|cooldown| now - *at < cooldown)
        });

        let pruned = before - self.cooldowns.len();
        self.dirty |= pruned > 0;
        pruned
    }

    pub fn cooldown_count(&self) -> usize {
        self.cooldowns.len()
    }

    /// Reverts close requests whose deadline passed, drops expired cooldowns
    /// and lists what the supervisor should look at.
    pub fn scan_candidates(&mut self, now: DateTime<Utc>) -> Vec<ScanCandidate> {
        self.prune_cooldowns(now);

        let grace = self.config.provision_grace;
        let mut candidates = Vec::new();

        for resource in self.resources.values_mut() {
            if let ResourceState::CloseRequested { deadline, .. } = resource.state {
                if now > deadline {
                    tracing::debug!("Close request for {} expired", resource.name);
                    resource.state = ResourceState::Active;
                    self.dirty = true;
                }
            }

            let idle_timeout = self.config.policy(resource.kind).idle_timeout;
            let check = match resource.state {
                ResourceState::Reclaiming | ResourceState::CloseRequested { .. } => None,
                _ if idle_timeout.is_some_and(|t| now - resource.last_activity_at >= t) => {
                    Some(ScanCheck::Idle)
                }
                ResourceState::Active if resource.kind == ResourceKind::Voice => {
                    Some(ScanCheck::Occupancy)
                }
                ResourceState::Provisioned if now - resource.created_at >= grace => {
                    Some(ScanCheck::Occupancy)
                }
                _ => None,
            };

            if let Some(check) = check {
                candidates.push(ScanCandidate {
                    resource: resource.clone(),
                    check,
                });
            }
        }

        candidates.sort_by_key(|c| c.resource.created_at);
        candidates
    }

    fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(store) = &self.store else {
            self.dirty = false;
            return;
        };

        if store.save(&self.snapshot()).trace_err_ok().is_some() {
            self.dirty = false;
        }
    }
}

impl Owned for Registry {
    fn tick_period(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    fn tick(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use poise::serenity_prelude::GuildId;

    const GUILD: GuildId = GuildId::new(1);
    const OWNER: UserId = UserId::new(10);
    const STAFF: UserId = UserId::new(20);
    const STRANGER: UserId = UserId::new(30);

    fn t(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn user(user: UserId) -> CloseActor {
        CloseActor {
            user,
            privileged: false,
        }
    }

    fn create(
        registry: &mut Registry,
        id: u64,
        owner: UserId,
        kind: ResourceKind,
        now: DateTime<Utc>,
    ) -> ChannelId {
        let reservation = registry.provision(owner, kind, now).unwrap();
        let id = ChannelId::new(id);
        registry.register(
            reservation,
            EphemeralResource::new(id, GUILD, owner, kind, format!("res-{id}"), now),
        );
        id
    }

    #[test]
    fn cooldown_counts_from_last_creation() {
        let mut registry = Registry::new(EphemeralConfig::default());

        create(&mut registry, 100, OWNER, ResourceKind::Voice, t(0));

        assert_eq!(
            registry.provision(OWNER, ResourceKind::Voice, t(100)),
            Err(ProvisionError::Cooldown {
                remaining: TimeDelta::seconds(200)
            })
        );
        // other kinds and other owners are unaffected
        let text = registry.provision(OWNER, ResourceKind::Text, t(100)).unwrap();
        registry.abort_provision(text);
        let other = registry.provision(STAFF, ResourceKind::Voice, t(100)).unwrap();
        registry.abort_provision(other);

        assert!(registry.provision(OWNER, ResourceKind::Voice, t(301)).is_ok());
    }

    #[test]
    fn expired_cooldowns_are_pruned_by_the_scan() {
        let mut registry = Registry::new(EphemeralConfig::default());

        for owner in 1..=1000u64 {
            let id = create(&mut registry, owner, UserId::new(owner), ResourceKind::Voice, t(0));
            assert!(registry.begin_reclaim(id).is_some());
            assert!(registry.finish_reclaim(id).is_some());
        }
        assert_eq!(registry.cooldown_count(), 1000);

        // still cooling down, nothing to drop yet
        registry.scan_candidates(t(299));
        assert_eq!(registry.cooldown_count(), 1000);

        registry.scan_candidates(t(86_400));
        registry.tick();
        assert_eq!(registry.list().len(), 0);
        assert_eq!(registry.cooldown_count(), 0);
        assert!(registry.provision(UserId::new(1), ResourceKind::Voice, t(86_400)).is_ok());
    }

    #[test]
    fn kinds_without_a_cooldown_leave_no_stamp() {
        let mut registry = Registry::new(EphemeralConfig::default());

        create(&mut registry, 1, OWNER, ResourceKind::Ticket, t(0));
        let pending = registry.provision(OWNER, ResourceKind::Ticket, t(1)).unwrap();
        registry.abort_provision(pending);

        assert_eq!(registry.cooldown_count(), 0);
        assert_eq!(registry.snapshot().cooldowns, vec![]);
    }

    #[test]
    fn aborted_provision_gives_the_slot_back() {
        let mut registry = Registry::new(EphemeralConfig::default());

        let reservation = registry.provision(OWNER, ResourceKind::Voice, t(0)).unwrap();
        registry.abort_provision(reservation);

        assert!(registry.provision(OWNER, ResourceKind::Voice, t(1)).is_ok());
    }

    #[test]
    fn ticket_limit_counts_reservations() {
        let mut registry = Registry::new(EphemeralConfig::default());

        create(&mut registry, 1, OWNER, ResourceKind::Ticket, t(0));
        create(&mut registry, 2, OWNER, ResourceKind::Ticket, t(1));
        let pending = registry.provision(OWNER, ResourceKind::Ticket, t(2)).unwrap();

        assert_eq!(
            registry.provision(OWNER, ResourceKind::Ticket, t(3)),
            Err(ProvisionError::TooManyOpen { open: 3, max: 3 })
        );

        registry.abort_provision(pending);
        assert!(registry.provision(OWNER, ResourceKind::Ticket, t(4)).is_ok());
    }

    #[test]
    fn claims_are_exclusive() {
        let mut registry = Registry::new(EphemeralConfig::default());
        let ticket = create(&mut registry, 1, OWNER, ResourceKind::Ticket, t(0));
        let voice = create(&mut registry, 2, OWNER, ResourceKind::Voice, t(0));

        assert_eq!(registry.claim(ticket, STAFF), Ok(()));
        assert_eq!(registry.claim(ticket, STAFF), Ok(()));
        assert_eq!(
            registry.claim(ticket, STRANGER),
            Err(ClaimError::AlreadyClaimed(STAFF))
        );
        assert_eq!(registry.claim(voice, STAFF), Err(ClaimError::Unknown));
    }

    #[test]
    fn close_permissions() {
        let mut registry = Registry::new(EphemeralConfig::default());
        let ticket = create(&mut registry, 1, OWNER, ResourceKind::Ticket, t(0));

        assert_eq!(
            registry.request_close(ticket, user(STRANGER), t(1)),
            Err(CloseError::NotAllowed)
        );

        registry.claim(ticket, STAFF).unwrap();
        assert_eq!(
            registry.request_close(ticket, user(STAFF), t(1)),
            Ok(t(31))
        );
        assert_eq!(
            registry.confirm_close(ticket, user(STRANGER), t(2)),
            Err(CloseError::NotAllowed)
        );

        let moderator = CloseActor {
            user: STRANGER,
            privileged: true,
        };
        let closing = registry.confirm_close(ticket, moderator, t(2)).unwrap();
        assert_eq!(closing.id, ticket);
        assert_eq!(
            registry.get(ticket).map(|r| r.state),
            Some(ResourceState::Reclaiming)
        );
        assert_eq!(
            registry.request_close(ticket, user(OWNER), t(3)),
            Err(CloseError::AlreadyClosing)
        );
    }

    #[test]
    fn late_confirmation_reverts_to_active() {
        let mut registry = Registry::new(EphemeralConfig::default());
        let ticket = create(&mut registry, 1, OWNER, ResourceKind::Ticket, t(0));

        registry.request_close(ticket, user(OWNER), t(10)).unwrap();
        assert_eq!(
            registry.confirm_close(ticket, user(OWNER), t(41)),
            Err(CloseError::Expired)
        );
        assert_eq!(
            registry.get(ticket).map(|r| r.state),
            Some(ResourceState::Active)
        );
        assert_eq!(
            registry.confirm_close(ticket, user(OWNER), t(42)),
            Err(CloseError::NotRequested)
        );

        registry.request_close(ticket, user(OWNER), t(50)).unwrap();
        assert_eq!(registry.cancel_close(ticket, user(OWNER)), Ok(()));
        assert_eq!(
            registry.cancel_close(ticket, user(OWNER)),
            Err(CloseError::NotRequested)
        );
    }

    #[test]
    fn scan_reverts_expired_requests_and_picks_candidates() {
        let mut registry = Registry::new(EphemeralConfig::default());
        let fresh_voice = create(&mut registry, 1, OWNER, ResourceKind::Voice, t(0));
        let old_voice = create(&mut registry, 2, STAFF, ResourceKind::Voice, t(-60));
        let ticket = create(&mut registry, 3, OWNER, ResourceKind::Ticket, t(0));
        let idle_ticket = create(&mut registry, 4, STAFF, ResourceKind::Ticket, t(-90_000));

        registry.request_close(ticket, user(OWNER), t(0)).unwrap();

        let candidates = registry.scan_candidates(t(10));
        let found: Vec<_> = candidates
            .iter()
            .map(|c| (c.resource.id, c.check))
            .collect();
        assert_eq!(
            found,
            [
                (idle_ticket, ScanCheck::Idle),
                (old_voice, ScanCheck::Occupancy)
            ]
        );
        assert!(matches!(
            registry.get(ticket).map(|r| r.state),
            Some(ResourceState::CloseRequested { .. })
        ));

        registry.activate(fresh_voice, t(11));
        let later: Vec<_> = registry
            .scan_candidates(t(40))
            .into_iter()
            .map(|c| c.resource.id)
            .collect();
        assert!(later.contains(&fresh_voice));
        assert_eq!(
            registry.get(ticket).map(|r| r.state),
            Some(ResourceState::Active)
        );
    }

    #[test]
    fn reclaim_is_handed_out_once() {
        let mut registry = Registry::new(EphemeralConfig::default());
        let voice = create(&mut registry, 1, OWNER, ResourceKind::Voice, t(0));

        assert!(registry.begin_reclaim(voice).is_some());
        assert!(registry.begin_reclaim(voice).is_none());

        registry.abort_reclaim(voice);
        assert_eq!(
            registry.get(voice).map(|r| r.state),
            Some(ResourceState::Provisioned)
        );

        assert!(registry.begin_reclaim(voice).is_some());
        assert!(registry.finish_reclaim(voice).is_some());
        assert!(registry.finish_reclaim(voice).is_none());
        assert!(registry.begin_reclaim(voice).is_none());
    }

    #[test]
    fn snapshot_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut registry =
            Registry::with_store(EphemeralConfig::default(), SnapshotStore::new(&path)).unwrap();
        let voice = create(&mut registry, 1, OWNER, ResourceKind::Voice, t(0));
        let ticket = create(&mut registry, 2, OWNER, ResourceKind::Ticket, t(0));
        registry.add_hub(ChannelId::new(500), Some(ChannelId::new(600)));
        registry.request_close(ticket, user(OWNER), t(5)).unwrap();
        registry.tick();
        assert!(!registry.dirty);

        let mut restored =
            Registry::with_store(EphemeralConfig::default(), SnapshotStore::new(&path)).unwrap();

        assert_eq!(
            restored.get(voice).map(|r| r.state),
            Some(ResourceState::Provisioned)
        );
        assert_eq!(
            restored.get(ticket).map(|r| r.state),
            Some(ResourceState::Active)
        );
        assert_eq!(
            restored.hub(ChannelId::new(500)),
            Some(Some(ChannelId::new(600)))
        );
        assert!(matches!(
            restored.provision(OWNER, ResourceKind::Voice, t(10)),
            Err(ProvisionError::Cooldown { .. })
        ));
    }

    #[test]
    fn owners_are_welcomed_once_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        // written before the welcome list existed
        std::fs::write(&path, r#"{"resources":[],"cooldowns":[],"hubs":[]}"#).unwrap();

        let mut registry =
            Registry::with_store(EphemeralConfig::default(), SnapshotStore::new(&path)).unwrap();
        assert!(!registry.is_welcomed(OWNER));
        assert!(registry.mark_welcomed(OWNER));
        assert!(!registry.mark_welcomed(OWNER));
        registry.tick();

        let restored =
            Registry::with_store(EphemeralConfig::default(), SnapshotStore::new(&path)).unwrap();
        assert!(restored.is_welcomed(OWNER));
        assert!(!restored.is_welcomed(STRANGER));
    }
}
