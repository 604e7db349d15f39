use crate::{
    dispatch::RetryConfig, ephemeral::EphemeralConfig, ratelimit::RateLimitConfig,
    spam::{AutomodConfig, SpamConfig},
};
use color_eyre::eyre::{Result, WrapErr};
use poise::serenity_prelude::{ChannelId, UserId};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// The id of the guild the bot is in.
    pub guild_id: u64,
    /// The help text for the bot. `/help`
    pub help_text: Option<Arc<String>>,
    /// Users that can always close tickets and use the moderator commands.
    #[serde(default)]
    pub privileged_users: Vec<UserId>,
    /// Where new tickets are created.
    pub ticket_category: Option<ChannelId>,
    /// Where temporary text channels are created.
    pub text_category: Option<ChannelId>,
    /// Where automod actions are reported.
    pub log_channel: Option<ChannelId>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ephemeral: EphemeralConfig,
    #[serde(default)]
    pub spam: SpamConfig,
    #[serde(default)]
    pub automod: AutomodConfig,
    #[serde(default)]
    pub paths: Paths,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Paths {
    /// The sled database holding the audit log.
    pub db: PathBuf,
    /// The json snapshot of temporary channels and tickets.
    pub state: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            db: "steward.db".into(),
            state: "steward-state.json".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            guild_id: 0,
            help_text: None,
            privileged_users: vec![],
            ticket_category: None,
            text_category: None,
            log_channel: None,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            ephemeral: EphemeralConfig::default(),
            spam: SpamConfig::default(),
            automod: AutomodConfig::default(),
            paths: Paths::default(),
        }
    }
}

impl Config {
    /// Fetches the config from the config file in the root directory.
    pub fn create_from_file(config_path: impl AsRef<Path>) -> Result<Config> {
        let file = std::fs::read_to_string(config_path).wrap_err("Could not read config file")?;

        toml::from_str(&file).wrap_err("Could not parse config file")
    }

    /// Reloads the config file and updates the configuration.
    ///
    /// A file that fails to parse leaves the current config in place.
    pub fn reload(&mut self, config_path: impl AsRef<Path>) -> bool {
        match Config::create_from_file(config_path) {
            Ok(config) => {
                *self = config;
                true
            }
            Err(e) => {
                tracing::error!("Keeping the previous config: {e:?}");
                false
            }
        }
    }

    pub fn save(&self, config_path: impl AsRef<Path>) -> Result<()> {
        let config_path = config_path.as_ref();
        let toml = toml::to_string(&self).wrap_err("Could not serialize config")?;

        if config_path.exists() {
            let mut backup = config_path.as_os_str().to_owned();
            backup.push(".bak");
            std::fs::copy(config_path, backup).wrap_err("Could not back up config")?;
        }

        std::fs::write(config_path, toml).wrap_err("Could not save config")
    }

    pub fn is_privileged(&self, user: UserId) -> bool {
        self.privileged_users.contains(&user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::time::Duration;

    #[test]
    fn parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            guild_id = 1234
            privileged_users = [42]
            ticket_category = 99

            [rate_limit]
            user_limit = 5

            [retry]
            max_attempts = 3
            initial = 0.5

            [ephemeral]
            scan_interval = 30

            [ephemeral.ticket]
            max_open = 1
            idle_timeout = 3600

            [automod]
            banned_words = ["discord.gg/"]
            "#,
        )
        .unwrap();

        assert_eq!(config.guild_id, 1234);
        assert!(config.is_privileged(UserId::new(42)));
        assert_eq!(config.ticket_category, Some(ChannelId::new(99)));

        assert_eq!(config.rate_limit.user_limit, 5);
        assert_eq!(config.rate_limit.channel_limit, 30);
        assert_eq!(config.rate_limit.block_duration, Duration::from_secs(300));

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff.initial, Duration::from_millis(500));
        assert_eq!(config.retry.backoff.cap, Duration::from_secs(60));

        assert_eq!(config.ephemeral.scan_interval, Duration::from_secs(30));
        assert_eq!(config.ephemeral.ticket.max_open, Some(1));
        assert_eq!(
            config.ephemeral.ticket.idle_timeout,
            Some(TimeDelta::hours(1))
        );
        assert_eq!(
            config.ephemeral.voice.cooldown,
            Some(TimeDelta::seconds(300))
        );
        assert_eq!(config.spam.repeats, 3);
        assert_eq!(config.automod.banned_words, vec!["discord.gg/".to_owned()]);
        assert!(config.automod.ban);
        assert_eq!(config.log_channel, None);
        assert_eq!(config.paths.state, PathBuf::from("steward-state.json"));
    }

    #[test]
    fn save_keeps_a_backup_and_reload_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config {
            guild_id: 1,
            ..Default::default()
        };
        config.save(&path).unwrap();
        config.guild_id = 2;
        config.save(&path).unwrap();

        let backup = Config::create_from_file(dir.path().join("config.toml.bak")).unwrap();
        assert_eq!(backup.guild_id, 1);

        std::fs::write(&path, "guild_id = [").unwrap();
        assert!(!config.reload(&path));
        assert_eq!(config.guild_id, 2);
    }
}
