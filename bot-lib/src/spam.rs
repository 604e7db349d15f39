use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use poise::serenity_prelude::{ChannelId, MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds, DurationSecondsWithFrac};
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

#[serde_as]
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct SpamConfig {
    pub enabled: bool,
    /// Identical messages in a row that count as spam.
    pub repeats: usize,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub window: Duration,
    /// How long a flagged member is timed out for.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repeats: 3,
            window: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Where a message was posted, enough to delete it later.
pub type Posted = (ChannelId, MessageId);

struct Seen {
    at: Instant,
    content: String,
    posted: Posted,
}

/// Flags members who post the same text several times in quick succession.
///
/// Only exact repeats count, a single changed character resets the streak.
pub struct DuplicateTracker {
    config: Mutex<SpamConfig>,
    recent: Mutex<AHashMap<UserId, VecDeque<Seen>>>,
}

impl DuplicateTracker {
    pub fn new(config: SpamConfig) -> Self {
        Self {
            config: Mutex::new(config),
            recent: Mutex::new(AHashMap::new()),
        }
    }

    pub fn config(&self) -> SpamConfig {
        *self.config.lock()
    }

    pub fn set_config(&self, config: SpamConfig) {
        *self.config.lock() = config;
    }

    pub fn observe(&self, user: UserId, posted: Posted, content: &str) -> Option<Vec<Posted>> {
        self.observe_at(user, posted, content, Instant::now())
    }

    /// Records a message. When it completes a run of repeats, returns every
    /// message of the run so all of them can be removed. The run is forgotten
    /// once flagged.
    pub fn observe_at(
        &self,
        user: UserId,
        posted: Posted,
        content: &str,
        now: Instant,
    ) -> Option<Vec<Posted>> {
        let config = *self.config.lock();
        if !config.enabled || config.repeats < 2 || content.trim().is_empty() {
            return None;
        }

        let mut recent = self.recent.lock();
        let history = recent.entry(user).or_default();

        if history.back().is_some_and(|last| last.content != content) {
            history.clear();
        }
        history.push_back(Seen {
            at: now,
            content: content.to_owned(),
            posted,
        });

        while history
            .front()
            .is_some_and(|seen| now.duration_since(seen.at) > config.window)
        {
            history.pop_front();
        }
        while history.len() > config.repeats {
            history.pop_front();
        }

        if history.len() == config.repeats {
            return recent
                .remove(&user)
                .map(|run| run.into_iter().map(|seen| seen.posted).collect());
        }

        None
    }

    /// Drops histories with nothing inside the window.
    pub fn purge(&self) {
        let window = self.config.lock().window;
        let now = Instant::now();

        self.recent.lock().retain(|_, history| {
            history
                .back()
                .is_some_and(|seen| now.duration_since(seen.at) <= window)
        });
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AutomodConfig {
    /// Text that gets a message removed, matched case-insensitively anywhere
    /// in the message.
    pub banned_words: Vec<String>,
    /// Ban the author as well as removing the message.
    pub ban: bool,
}

impl Default for AutomodConfig {
    fn default() -> Self {
        Self {
            banned_words: vec![],
            ban: true,
        }
    }
}

/// Case-insensitive substring filter over a configurable word list.
pub struct WordFilter {
    config: RwLock<AutomodConfig>,
}

impl WordFilter {
    pub fn new(config: AutomodConfig) -> Self {
        let filter = Self {
            config: RwLock::new(AutomodConfig::default()),
        };
        filter.set_config(config);
        filter
    }

    pub fn set_config(&self, mut config: AutomodConfig) {
        config.banned_words = config
            .banned_words
            .into_iter()
            .map(|word| word.trim().to_lowercase())
            .filter(|word| !word.is_empty())
            .collect();
        *self.config.write() = config;
    }

    pub fn bans(&self) -> bool {
        self.config.read().ban
    }

    /// The first banned word found in `content`, if any.
    pub fn find(&self, content: &str) -> Option<String> {
        let content = content.to_lowercase();

        self.config
            .read()
            .banned_words
            .iter()
            .find(|word| content.contains(word.as_str()))
            .cloned()
    }
}
