use crate::actor::{Confined, Owned, StateClosed};
use ahash::AHashMap;
use poise::serenity_prelude::{ChannelId, UserId};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

#[serde_as]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests per window before a user gets blocked.
    pub user_limit: usize,
    /// Requests per window before a channel gets blocked.
    pub channel_limit: usize,
    /// Requests per window across the whole bot.
    pub global_limit: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub window: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub block_duration: Duration,
    /// Wait reported when the global limit is hit. Nothing gets blocked.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub global_cooldown: Duration,
    pub user_capacity: usize,
    pub channel_capacity: usize,
    pub global_capacity: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_limit: 10,
            channel_limit: 30,
            global_limit: 500,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
            global_cooldown: Duration::from_secs(60),
            user_capacity: 50,
            channel_capacity: 100,
            global_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorKey {
    User(UserId),
    Channel(ChannelId),
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    None,
    UserBlocked,
    ChannelBlocked,
    UserLimit,
    ChannelLimit,
    GlobalLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitCheck {
    pub kind: LimitKind,
    pub retry_after: Duration,
}

impl RateLimitCheck {
    pub const CLEAR: Self = Self {
        kind: LimitKind::None,
        retry_after: Duration::ZERO,
    };

    fn limited(kind: LimitKind, retry_after: Duration) -> Self {
        Self { kind, retry_after }
    }

    pub fn is_limited(&self) -> bool {
        self.kind != LimitKind::None
    }

    /// Text shown to whoever got limited.
    pub fn explain(&self) -> Option<String> {
        let seconds = self.retry_after.as_secs().max(1);

        Some(match self.kind {
            LimitKind::None => return None,
            LimitKind::UserBlocked => {
                format!("You are temporarily rate limited. Try again in {seconds} seconds.")
            }
            LimitKind::ChannelBlocked => {
                format!("This channel is temporarily rate limited. Try again in {seconds} seconds.")
            }
            LimitKind::UserLimit => {
                format!("You've sent too many requests. Please wait {seconds} seconds.")
            }
            LimitKind::ChannelLimit => {
                format!("Too many requests in this channel. Please wait {seconds} seconds.")
            }
            LimitKind::GlobalLimit => {
                format!("The bot is busy right now. Please wait {seconds} seconds.")
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerStats {
    pub active_users: usize,
    pub active_channels: usize,
    pub blocked_users: usize,
    pub blocked_channels: usize,
    pub global_requests: usize,
}

/// Sliding-window request counters per user, channel and globally.
///
/// Nothing in here fails: an actor with no data has simply never made a
/// request.
#[derive(Debug)]
pub struct Ledger {
    config: RateLimitConfig,
    windows: AHashMap<ActorKey, VecDeque<Instant>>,
    global: VecDeque<Instant>,
    blocks: AHashMap<ActorKey, Instant>,
}

impl Ledger {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: AHashMap::new(),
            global: VecDeque::new(),
            blocks: AHashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RateLimitConfig) {
        self.config = config;
    }

    pub fn record_attempt(&mut self, key: ActorKey) {
        self.record_attempt_at(key, Instant::now());
    }

    pub fn record_attempt_at(&mut self, key: ActorKey, now: Instant) {
        if key != ActorKey::Global {
            let capacity = self.capacity(key);
            push_bounded(self.windows.entry(key).or_default(), now, capacity);
        }

        let capacity = self.capacity(ActorKey::Global);
        push_bounded(&mut self.global, now, capacity);
    }

    /// Records one request made by `user` in `channel`.
    pub fn record_request_at(&mut self, user: UserId, channel: ChannelId, now: Instant) {
        for key in [ActorKey::User(user), ActorKey::Channel(channel)] {
            let capacity = self.capacity(key);
            push_bounded(self.windows.entry(key).or_default(), now, capacity);
        }

        let capacity = self.capacity(ActorKey::Global);
        push_bounded(&mut self.global, now, capacity);
    }

    pub fn is_limited(&mut self, user: UserId, channel: ChannelId) -> RateLimitCheck {
        self.is_limited_at(user, channel, Instant::now())
    }

    pub fn is_limited_at(&mut self, user: UserId, channel: ChannelId, now: Instant) -> RateLimitCheck {
        if !self.config.enabled {
            return RateLimitCheck::CLEAR;
        }

        let block_duration = self.config.block_duration;

        for (key, kind) in [
            (ActorKey::User(user), LimitKind::UserBlocked),
            (ActorKey::Channel(channel), LimitKind::ChannelBlocked),
        ] {
            if let Some(started) = self.blocks.get(&key) {
                let elapsed = now.saturating_duration_since(*started);

                if elapsed < block_duration {
                    return RateLimitCheck::limited(kind, block_duration - elapsed);
                }

                self.blocks.remove(&key);
            }
        }

        for (key, limit, kind) in [
            (
                ActorKey::User(user),
                self.config.user_limit,
                LimitKind::UserLimit,
            ),
            (
                ActorKey::Channel(channel),
                self.config.channel_limit,
                LimitKind::ChannelLimit,
            ),
        ] {
            if self.window_len(key, now) >= limit {
                tracing::info!("Blocking {key:?} for {block_duration:?}");
                self.blocks.insert(key, now);
                return RateLimitCheck::limited(kind, block_duration);
            }
        }

        if self.window_len(ActorKey::Global, now) >= self.config.global_limit {
            return RateLimitCheck::limited(LimitKind::GlobalLimit, self.config.global_cooldown);
        }

        RateLimitCheck::CLEAR
    }

    /// Checks the limits and records the request only when it's allowed.
    pub fn check_and_record_at(
        &mut self,
        user: UserId,
        channel: ChannelId,
        now: Instant,
    ) -> RateLimitCheck {
        let check = self.is_limited_at(user, channel, now);

        if !check.is_limited() {
            self.record_request_at(user, channel, now);
        }

        check
    }

    /// Drops everything that fell out of the window and every expired block.
    pub fn purge_expired(&mut self, now: Instant) {
        let window = self.config.window;
        let block_duration = self.config.block_duration;

        self.windows.retain(|_, timestamps| {
            prune(timestamps, now, window);
            !timestamps.is_empty()
        });
        prune(&mut self.global, now, window);
        self.blocks
            .retain(|_, started| now.saturating_duration_since(*started) < block_duration);
    }

    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats {
            global_requests: self.global.len(),
            ..Default::default()
        };

        for key in self.windows.keys() {
            match key {
                ActorKey::User(_) => stats.active_users += 1,
                ActorKey::Channel(_) => stats.active_channels += 1,
                ActorKey::Global => {}
            }
        }

        for key in self.blocks.keys() {
            match key {
                ActorKey::User(_) => stats.blocked_users += 1,
                ActorKey::Channel(_) => stats.blocked_channels += 1,
                ActorKey::Global => {}
            }
        }

        stats
    }

    fn window_len(&mut self, key: ActorKey, now: Instant) -> usize {
        let window = self.config.window;

        if key == ActorKey::Global {
            prune(&mut self.global, now, window);
            return self.global.len();
        }

        let Some(timestamps) = self.windows.get_mut(&key) else {
            return 0;
        };

        prune(timestamps, now, window);
        let len = timestamps.len();

        if len == 0 {
            self.windows.remove(&key);
        }

        len
    }

    fn capacity(&self, key: ActorKey) -> usize {
        match key {
            ActorKey::User(_) => self.config.user_capacity.max(self.config.user_limit),
            ActorKey::Channel(_) => self.config.channel_capacity.max(self.config.channel_limit),
            ActorKey::Global => self.config.global_capacity.max(self.config.global_limit),
        }
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while timestamps
        .front()
        .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= window)
    {
        timestamps.pop_front();
    }
}

fn push_bounded(timestamps: &mut VecDeque<Instant>, now: Instant, capacity: usize) {
    while timestamps.len() >= capacity.max(1) {
        timestamps.pop_front();
    }
    timestamps.push_back(now);
}

impl Owned for Ledger {
    fn tick_period(&self) -> Option<Duration> {
        Some(MAINTENANCE_PERIOD)
    }

    fn tick(&mut self) {
        self.purge_expired(Instant::now());
    }

    fn shutdown(&mut self) {}
}

impl Confined<Ledger> {
    pub async fn check_and_record(
        &self,
        user: UserId,
        channel: ChannelId,
    ) -> Result<RateLimitCheck, StateClosed> {
        self.call(move |ledger| ledger.check_and_record_at(user, channel, Instant::now()))
            .await
    }

    pub async fn stats(&self) -> Result<LedgerStats, StateClosed> {
        self.call(|ledger| ledger.stats()).await
    }

    pub async fn set_config(&self, config: RateLimitConfig) -> Result<(), StateClosed> {
        self.call(move |ledger| ledger.set_config(config)).await
    }
}
