use super::{
    registry::{Registry, Reservation, ScanCheck},
    ClaimError, CloseActor, CloseError, EphemeralResource, Platform, ProvisionError,
    ReclaimReason, ResourceKind, ResourceState,
};
use crate::{
    actor::{Confined, StateClosed},
    audit::AuditSink,
};
use bot_db::audit::{AuditEvent, AuditKind, Severity};
use chrono::{DateTime, Utc};
use poise::serenity_prelude::{ChannelId, UserId};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Close(#[from] CloseError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Closed(#[from] StateClosed),
    #[error("platform call failed: {0:#}")]
    Platform(color_eyre::eyre::Report),
}

/// What one pass of [`Supervisor::scan`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Another scan was already running.
    pub skipped: bool,
    pub checked: usize,
    pub reclaimed: usize,
    pub forgotten: usize,
    pub failed: usize,
}

/// What happened to a resource that was looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Kept,
    Reclaimed,
    Forgotten,
    Failed,
}

/// Drives the [`Registry`] against the platform: creation bookkeeping,
/// close confirmation, periodic cleanup and the audit trail.
pub struct Supervisor<P> {
    registry: Confined<Registry>,
    platform: Arc<P>,
    audit: Arc<dyn AuditSink>,
    scanning: Arc<AtomicBool>,
}

impl<P> Clone for Supervisor<P> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            platform: self.platform.clone(),
            audit: self.audit.clone(),
            scanning: self.scanning.clone(),
        }
    }
}

struct ScanGuard<'a>(&'a AtomicBool);

impl<'a> ScanGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ScanGuard(flag))
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<P: Platform> Supervisor<P> {
    pub fn new(registry: Confined<Registry>, platform: Arc<P>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            registry,
            platform,
            audit,
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn registry(&self) -> &Confined<Registry> {
        &self.registry
    }

    pub async fn provision(
        &self,
        owner: UserId,
        kind: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<Reservation, SupervisorError> {
        Ok(self
            .registry
            .call(move |r| r.provision(owner, kind, now))
            .await??)
    }

    pub async fn abort_provision(&self, reservation: Reservation) -> Result<(), SupervisorError> {
        Ok(self
            .registry
            .call(move |r| r.abort_provision(reservation))
            .await?)
    }

    pub async fn register(
        &self,
        reservation: Reservation,
        resource: EphemeralResource,
    ) -> Result<(), SupervisorError> {
        let event = AuditEvent::new(
            resource.owner,
            AuditKind::ResourceCreated,
            format!("{} {}", resource.kind, resource.name),
        )
        .channel(resource.id)
        .severity(Severity::Low);

        self.registry
            .call(move |r| r.register(reservation, resource))
            .await?;
        self.audit.record(event);

        Ok(())
    }

    pub async fn activate(&self, id: ChannelId, now: DateTime<Utc>) -> Result<bool, StateClosed> {
        self.registry.call(move |r| r.activate(id, now)).await
    }

    pub async fn touch(&self, id: ChannelId, now: DateTime<Utc>) -> Result<bool, StateClosed> {
        self.registry.call(move |r| r.touch(id, now)).await
    }

    pub async fn forget(&self, id: ChannelId) -> Result<Option<EphemeralResource>, StateClosed> {
        self.registry.call(move |r| r.forget(id)).await
    }

    /// The channel was deleted outside the bot: drop whatever we tracked
    /// for it, resource or hub.
    pub async fn channel_deleted(
        &self,
        id: ChannelId,
    ) -> Result<Option<EphemeralResource>, StateClosed> {
        let (resource, was_hub) = self
            .registry
            .call(move |r| (r.forget(id), r.remove_hub(id)))
            .await?;

        if was_hub {
            tracing::info!("Voice hub {id} was deleted, no longer watching it");
        }

        Ok(resource)
    }

    pub async fn claim(&self, id: ChannelId, claimant: UserId) -> Result<(), SupervisorError> {
        self.registry.call(move |r| r.claim(id, claimant)).await??;

        self.audit.record(
            AuditEvent::new(claimant, AuditKind::TicketClaimed, "claimed")
                .channel(id)
                .severity(Severity::Low),
        );

        Ok(())
    }

    pub async fn request_close(
        &self,
        id: ChannelId,
        actor: CloseActor,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SupervisorError> {
        Ok(self
            .registry
            .call(move |r| r.request_close(id, actor, now))
            .await??)
    }

    pub async fn cancel_close(&self, id: ChannelId, actor: CloseActor) -> Result<(), SupervisorError> {
        Ok(self
            .registry
            .call(move |r| r.cancel_close(id, actor))
            .await??)
    }

    /// Confirms a pending close and deletes the resource.
    pub async fn confirm_close(
        &self,
        id: ChannelId,
        actor: CloseActor,
        now: DateTime<Utc>,
    ) -> Result<EphemeralResource, SupervisorError> {
        let resource = self
            .registry
            .call(move |r| r.confirm_close(id, actor, now))
            .await??;

        self.complete_reclaim(&resource, ReclaimReason::Closed { by: actor.user })
            .await?;

        Ok(resource)
    }

    /// Deletes `id` from the platform and the registry.
    ///
    /// Returns `false` when `id` is unknown or already being reclaimed by
    /// someone else, in which case nothing is deleted or audited.
    pub async fn reclaim(&self, id: ChannelId, reason: ReclaimReason) -> Result<bool, SupervisorError> {
        let Some(resource) = self.registry.call(move |r| r.begin_reclaim(id)).await? else {
            return Ok(false);
        };

        self.complete_reclaim(&resource, reason).await?;

        Ok(true)
    }

    async fn complete_reclaim(
        &self,
        resource: &EphemeralResource,
        reason: ReclaimReason,
    ) -> Result<(), SupervisorError> {
        let id = resource.id;

        if let Err(e) = self.platform.delete(resource, reason).await {
            self.registry.call(move |r| r.abort_reclaim(id)).await?;
            return Err(SupervisorError::Platform(e));
        }

        self.registry.call(move |r| r.finish_reclaim(id)).await?;

        tracing::info!(
            "Reclaimed {} {} owned by {} ({reason})",
            resource.kind,
            resource.name,
            resource.owner
        );
        self.audit.record(
            AuditEvent::new(resource.owner, AuditKind::ResourceReclaimed, reason.to_string())
                .context(format!("{} {}", resource.kind, resource.name))
                .channel(id)
                .severity(Severity::Low),
        );

        Ok(())
    }

    /// Looks at a single voice channel right away, eg. after someone left it.
    pub async fn check_occupancy(
        &self,
        id: ChannelId,
        now: DateTime<Utc>,
    ) -> Result<Settled, StateClosed> {
        let resource = self
            .registry
            .call(move |r| {
                r.get(id)
                    .filter(|res| {
                        res.kind == ResourceKind::Voice
                            && matches!(res.state, ResourceState::Provisioned | ResourceState::Active)
                    })
                    .cloned()
            })
            .await?;

        match resource {
            Some(resource) => self.settle(resource, ScanCheck::Occupancy, now).await,
            None => Ok(Settled::Kept),
        }
    }

    async fn settle(
        &self,
        resource: EphemeralResource,
        check: ScanCheck,
        now: DateTime<Utc>,
    ) -> Result<Settled, StateClosed> {
        let reason = match check {
            ScanCheck::Idle => ReclaimReason::Inactive,
            ScanCheck::Occupancy => match self.platform.occupants(&resource).await {
                Ok(Some(0)) => ReclaimReason::Empty,
                Ok(Some(_)) => {
                    self.activate(resource.id, now).await?;
                    return Ok(Settled::Kept);
                }
                Ok(None) => {
                    tracing::info!("{} {} vanished, forgetting it", resource.kind, resource.name);
                    self.forget(resource.id).await?;
                    return Ok(Settled::Forgotten);
                }
                Err(e) => {
                    tracing::warn!("Could not check occupancy of {}: {e:?}", resource.name);
                    return Ok(Settled::Failed);
                }
            },
        };

        match self.reclaim(resource.id, reason).await {
            Ok(true) => Ok(Settled::Reclaimed),
            Ok(false) => Ok(Settled::Kept),
            Err(SupervisorError::Closed(e)) => Err(e),
            Err(e) => {
                tracing::warn!("Could not reclaim {}: {e}", resource.name);
                Ok(Settled::Failed)
            }
        }
    }

    /// One cleanup pass. A scan that starts while another is still running
    /// returns immediately with [`ScanReport::skipped`] set.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ScanReport, SupervisorError> {
        let Some(_guard) = ScanGuard::acquire(&self.scanning) else {
            tracing::debug!("Scan already running, skipping");
            return Ok(ScanReport {
                skipped: true,
                ..Default::default()
            });
        };

        let candidates = self.registry.call(move |r| r.scan_candidates(now)).await?;
        let mut report = ScanReport {
            checked: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            match self.settle(candidate.resource, candidate.check, now).await? {
                Settled::Kept => {}
                Settled::Reclaimed => report.reclaimed += 1,
                Settled::Forgotten => report.forgotten += 1,
                Settled::Failed => report.failed += 1,
            }
        }

        if report.reclaimed + report.forgotten + report.failed > 0 {
            tracing::info!(?report, "Ephemeral scan finished");
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::testing::RecordingSink,
        ephemeral::EphemeralConfig,
        tasks::TaskSupervisor,
    };
    use ahash::AHashMap;
    use color_eyre::eyre::{eyre, Result};
    use parking_lot::Mutex;
    use poise::serenity_prelude::GuildId;
    use std::time::Duration;

    const GUILD: GuildId = GuildId::new(1);
    const OWNER: UserId = UserId::new(10);

    #[derive(Default)]
    struct FakePlatform {
        occupants: Mutex<AHashMap<ChannelId, usize>>,
        deleted: Mutex<Vec<ChannelId>>,
        fail_deletes: AtomicBool,
        latency: Duration,
    }

    impl Platform for FakePlatform {
        async fn occupants(&self, resource: &EphemeralResource) -> Result<Option<usize>> {
            tokio::time::sleep(self.latency).await;
            Ok(self.occupants.lock().get(&resource.id).copied())
        }

        async fn delete(&self, resource: &EphemeralResource, _reason: ReclaimReason) -> Result<()> {
            tokio::time::sleep(self.latency).await;
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(eyre!("missing permissions"));
            }
            self.deleted.lock().push(resource.id);
            self.occupants.lock().remove(&resource.id);
            Ok(())
        }
    }

    fn t(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn setup(
        platform: FakePlatform,
    ) -> (
        Supervisor<FakePlatform>,
        Arc<FakePlatform>,
        Arc<RecordingSink>,
        TaskSupervisor,
    ) {
        let tasks = TaskSupervisor::new();
        let registry = Confined::spawn(
            "registry",
            Registry::new(EphemeralConfig::default()),
            &tasks,
        );
        let platform = Arc::new(platform);
        let audit = Arc::new(RecordingSink::default());

        (
            Supervisor::new(registry, platform.clone(), audit.clone()),
            platform,
            audit,
            tasks,
        )
    }

    async fn create_voice(
        supervisor: &Supervisor<FakePlatform>,
        id: u64,
        now: DateTime<Utc>,
    ) -> ChannelId {
        let owner = UserId::new(id);
        let reservation = supervisor
            .provision(owner, ResourceKind::Voice, now)
            .await
            .unwrap();
        let id = ChannelId::new(id);
        supervisor
            .register(
                reservation,
                EphemeralResource::new(id, GUILD, owner, ResourceKind::Voice, "hangout", now),
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test(start_paused = true)]
    async fn double_reclaim_deletes_and_audits_once() {
        let (supervisor, platform, audit, _tasks) = setup(FakePlatform::default());
        let id = create_voice(&supervisor, 1, t(0)).await;

        assert!(supervisor.reclaim(id, ReclaimReason::Empty).await.unwrap());
        assert!(!supervisor.reclaim(id, ReclaimReason::Empty).await.unwrap());

        assert_eq!(*platform.deleted.lock(), [id]);
        assert_eq!(audit.count(AuditKind::ResourceReclaimed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reclaims_race_to_one_delete() {
        let (supervisor, platform, audit, _tasks) = setup(FakePlatform {
            latency: Duration::from_millis(500),
            ..Default::default()
        });
        let id = create_voice(&supervisor, 1, t(0)).await;

        let (first, second) = tokio::join!(
            supervisor.reclaim(id, ReclaimReason::Empty),
            supervisor.reclaim(id, ReclaimReason::Inactive),
        );

        assert_ne!(first.unwrap(), second.unwrap());
        assert_eq!(platform.deleted.lock().len(), 1);
        assert_eq!(audit.count(AuditKind::ResourceReclaimed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_scans_reclaim_once() {
        let (supervisor, platform, audit, _tasks) = setup(FakePlatform {
            latency: Duration::from_secs(1),
            ..Default::default()
        });
        let id = create_voice(&supervisor, 1, t(0)).await;
        platform.occupants.lock().insert(id, 0);

        let (first, second) = tokio::join!(supervisor.scan(t(60)), supervisor.scan(t(60)));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert!(first.skipped ^ second.skipped);
        assert_eq!(first.reclaimed + second.reclaimed, 1);
        assert_eq!(*platform.deleted.lock(), [id]);
        assert_eq!(audit.count(AuditKind::ResourceReclaimed), 1);

        let again = supervisor.scan(t(70)).await.unwrap();
        assert_eq!(again, ScanReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_activates_occupied_and_forgets_vanished() {
        let (supervisor, platform, _audit, _tasks) = setup(FakePlatform::default());
        let busy = create_voice(&supervisor, 1, t(0)).await;
        let gone = create_voice(&supervisor, 2, t(0)).await;
        let fresh = create_voice(&supervisor, 3, t(50)).await;
        platform.occupants.lock().insert(busy, 2);
        platform.occupants.lock().insert(fresh, 0);

        let report = supervisor.scan(t(60)).await.unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.forgotten, 1);
        assert_eq!(report.reclaimed, 0);
        assert!(platform.deleted.lock().is_empty());

        let state = supervisor
            .registry()
            .call(move |r| (r.get(busy).map(|r| r.state), r.get(gone).is_some()))
            .await
            .unwrap();
        assert_eq!(state, (Some(ResourceState::Active), false));
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_channels_drop_resources_and_hubs() {
        let (supervisor, platform, audit, _tasks) = setup(FakePlatform::default());
        let id = create_voice(&supervisor, 1, t(0)).await;
        let hub = ChannelId::new(500);
        supervisor
            .registry()
            .call(move |r| r.add_hub(hub, None))
            .await
            .unwrap();

        let forgotten = supervisor.channel_deleted(id).await.unwrap();
        assert_eq!(forgotten.map(|r| r.id), Some(id));
        assert_eq!(supervisor.channel_deleted(hub).await.unwrap(), None);

        let (hub_left, snapshot) = supervisor
            .registry()
            .call(move |r| (r.hub(hub), r.snapshot()))
            .await
            .unwrap();
        assert_eq!(hub_left, None);
        assert!(snapshot.hubs.is_empty());
        assert!(snapshot.resources.is_empty());

        assert!(platform.deleted.lock().is_empty());
        assert_eq!(audit.count(AuditKind::ResourceReclaimed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_the_last_member_reclaims_right_away() {
        let (supervisor, platform, audit, _tasks) = setup(FakePlatform::default());
        let id = create_voice(&supervisor, 1, t(0)).await;

        platform.occupants.lock().insert(id, 1);
        assert_eq!(supervisor.check_occupancy(id, t(2)).await, Ok(Settled::Kept));

        platform.occupants.lock().insert(id, 0);
        assert_eq!(
            supervisor.check_occupancy(id, t(5)).await,
            Ok(Settled::Reclaimed)
        );
        assert_eq!(
            supervisor.check_occupancy(id, t(6)).await,
            Ok(Settled::Kept)
        );
        assert_eq!(audit.count(AuditKind::ResourceReclaimed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delete_puts_the_resource_back() {
        let (supervisor, platform, audit, _tasks) = setup(FakePlatform::default());
        let id = create_voice(&supervisor, 1, t(0)).await;
        platform.fail_deletes.store(true, Ordering::SeqCst);

        let result = supervisor.reclaim(id, ReclaimReason::Empty).await;
        assert!(matches!(result, Err(SupervisorError::Platform(_))));
        assert_eq!(audit.count(AuditKind::ResourceReclaimed), 0);

        platform.fail_deletes.store(false, Ordering::SeqCst);
        assert!(supervisor.reclaim(id, ReclaimReason::Empty).await.unwrap());
        assert_eq!(audit.count(AuditKind::ResourceReclaimed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_close_deletes_with_the_closer_as_reason() {
        let (supervisor, platform, audit, _tasks) = setup(FakePlatform::default());
        let owner = CloseActor {
            user: OWNER,
            privileged: false,
        };
        let reservation = supervisor
            .provision(OWNER, ResourceKind::Ticket, t(0))
            .await
            .unwrap();
        let id = ChannelId::new(77);
        supervisor
            .register(
                reservation,
                EphemeralResource::new(id, GUILD, OWNER, ResourceKind::Ticket, "ticket-1", t(0)),
            )
            .await
            .unwrap();

        assert!(matches!(
            supervisor.confirm_close(id, owner, t(1)).await,
            Err(SupervisorError::Close(CloseError::NotRequested))
        ));

        supervisor.request_close(id, owner, t(1)).await.unwrap();
        supervisor.confirm_close(id, owner, t(20)).await.unwrap();

        assert_eq!(*platform.deleted.lock(), [id]);
        assert_eq!(audit.count(AuditKind::ResourceCreated), 1);
        let events = audit.events.lock();
        let reclaimed = events
            .iter()
            .find(|e| e.kind == AuditKind::ResourceReclaimed)
            .unwrap();
        assert_eq!(reclaimed.reason, format!("closed by {OWNER}"));
        assert_eq!(reclaimed.channel_id, Some(77));
    }
}
