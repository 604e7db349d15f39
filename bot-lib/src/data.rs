use crate::{
    actor::{Confined, StateClosed},
    audit::MessageMemory,
    config::Config,
    dispatch::Dispatcher,
    ephemeral::{registry::Registry, Supervisor},
    platform::DiscordPlatform,
    ratelimit::Ledger,
    spam::{DuplicateTracker, WordFilter},
    tasks::TaskSupervisor,
    CloneableCtx,
};
use bot_db::{audit::AuditLog, snapshot::SnapshotStore, StewardDb};
use chrono::Utc;
use color_eyre::eyre::{Error, Result, WrapErr};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};

/// The global state of the bot
/// Arc because I can't be arsed.
pub type State = Arc<RawAppState>;

pub struct RawAppState {
    pub config: Arc<RwLock<Config>>,
    /// Config file watcher that refreshes the config if it changes
    ///
    /// Attached to the AppState to keep the watcher alive
    _watcher: notify::RecommendedWatcher,
    /// The path to the config file.
    /// This is to allow for saving / reloading the config.
    pub config_path: Box<Path>,
    pub db: StewardDb,
    pub audit: Arc<AuditLog>,
    pub dispatcher: Dispatcher,
    pub supervisor: Supervisor<DiscordPlatform>,
    pub spam: Arc<DuplicateTracker>,
    pub words: Arc<WordFilter>,
    /// Recent member messages, for auditing deletions.
    pub messages: MessageMemory,
    pub tasks: TaskSupervisor,
}

/// The parts that follow config changes.
struct Reloadable {
    config: Arc<RwLock<Config>>,
    dispatcher: Dispatcher,
    ledger: Confined<Ledger>,
    registry: Confined<Registry>,
    spam: Arc<DuplicateTracker>,
    words: Arc<WordFilter>,
}

impl Reloadable {
    async fn apply(&self, config_path: &Path) -> Result<(), StateClosed> {
        let config = {
            let mut current = self.config.write().await;
            if !current.reload(config_path) {
                return Ok(());
            }
            current.clone()
        };

        self.dispatcher.set_retry_config(config.retry);
        self.spam.set_config(config.spam);
        self.words.set_config(config.automod);
        self.ledger.set_config(config.rate_limit).await?;
        self.registry
            .call(move |r| r.set_config(config.ephemeral))
            .await?;

        tracing::info!("Config reloaded (scan interval changes apply after a restart)");

        Ok(())
    }
}

impl RawAppState {
    pub fn new(
        ctx: CloneableCtx,
        config: Config,
        config_path: String,
        tasks: TaskSupervisor,
    ) -> Result<RawAppState> {
        let db = StewardDb::new(&config.paths.db)?;
        let audit = Arc::new(AuditLog::new(&db)?);

        let ledger = Confined::spawn("rate limit ledger", Ledger::new(config.rate_limit.clone()), &tasks);
        let dispatcher =
            Dispatcher::new(config.retry, tasks.token()).with_ledger(ledger.clone());

        let registry = Registry::with_store(
            config.ephemeral,
            SnapshotStore::new(config.paths.state.clone()),
        )
        .wrap_err("Could not load the registry snapshot")?;
        let registry = Confined::spawn("ephemeral registry", registry, &tasks);
        let supervisor = Supervisor::new(
            registry.clone(),
            Arc::new(DiscordPlatform::new(ctx, dispatcher.clone())),
            audit.clone(),
        );

        let spam = Arc::new(DuplicateTracker::new(config.spam));
        let words = Arc::new(WordFilter::new(config.automod.clone()));

        {
            let db = db.clone();
            let token = tasks.token();
            tasks.spawn("database flush", async move {
                token.cancelled().await;
                db.flush().await
            });
        }

        {
            let supervisor = supervisor.clone();
            tasks.spawn_periodic("ephemeral scan", config.ephemeral.scan_interval, move || {
                let supervisor = supervisor.clone();
                async move {
                    supervisor.scan(Utc::now()).await?;
                    Ok(())
                }
            });
        }

        {
            let spam = spam.clone();
            tasks.spawn_periodic("spam history purge", Duration::from_secs(60), move || {
                spam.purge();
                async { Ok(()) }
            });
        }

        let config = Arc::new(RwLock::new(config));
        let config_path: Box<Path> = Path::new(&config_path).into();

        let reloadable = Reloadable {
            config: Arc::clone(&config),
            dispatcher: dispatcher.clone(),
            ledger,
            registry,
            spam: spam.clone(),
            words: words.clone(),
        };
        let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();

        {
            let config_path = config_path.clone();
            tasks.spawn_cancellable("config reload", async move {
                while reload_rx.recv().await.is_some() {
                    reloadable.apply(&config_path).await?;
                }
                Ok(())
            });
        }

        use notify::{
            Event, EventKind, RecursiveMode, Watcher,
            event::{AccessKind, AccessMode},
        };

        let mut watcher = notify::recommended_watcher(move |res| match res {
            Ok(Event {
                kind: EventKind::Access(AccessKind::Close(AccessMode::Write)),
                ..
            }) => {
                tracing::info!("config changed, reloading...");

                reload_tx.send(()).ok();
            }
            Err(e) => tracing::error!("watch error: {:?}", e),
            _ => {}
        })
        .wrap_err("Failed to create file watcher")?;

        watcher
            .watch(&config_path, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch config file")?;

        Ok(RawAppState {
            config,
            _watcher: watcher,
            config_path,
            db,
            audit,
            dispatcher,
            supervisor,
            spam,
            words,
            messages: MessageMemory::new(1000),
            tasks,
        })
    }

    /// Whether `user` may use moderator-only actions without a guild permission.
    pub async fn is_privileged(&self, user: poise::serenity_prelude::UserId) -> bool {
        self.config.read().await.is_privileged(user)
    }
}

// User data, which is stored and accessible in all command invocations
pub type PoiseContext<'a> = poise::Context<'a, State, Error>;
