use crate::{
    config::Config,
    fireboard::Fireboard,
    gateway::DiscordGateway,
};
use bot_db::{FireboardDb, FireboardStore};
use color_eyre::eyre::{Error, Result, WrapErr};
use std::{path::Path, sync::Arc};
use tokio::sync::RwLock;

/// The global state of the bot
/// Arc because I can't be arsed.
pub type State = Arc<RawAppState>;

#[derive(Debug)]
pub struct RawAppState {
    pub config: Arc<RwLock<Config>>,
    /// Config file watcher that refreshes the config if it changes
    ///
    /// Attached to the AppState to keep the watcher alive
    _watcher: notify::RecommendedWatcher,
    /// The path to the config file.
    /// This is to allow for saving / reloading the config.
    pub config_path: Box<Path>,
    pub db: Arc<FireboardDb>,
    pub fireboard: Fireboard<DiscordGateway, Arc<FireboardDb>>,
}

impl RawAppState {
    pub fn new(
        ctx: &poise::serenity_prelude::Context,
        config: Config,
        config_path: String,
    ) -> Result<RawAppState> {
        let db = Arc::new(FireboardDb::open(&config.db_path)?);
        seed_store(&*db, &config)?;

        let fireboard = Fireboard::new(
            DiscordGateway::from(ctx),
            Arc::clone(&db),
            ctx.cache.current_user().id,
        );

        let config = Arc::new(RwLock::new(config));

        use notify::{
            Event, EventKind, RecursiveMode, Watcher,
            event::{AccessKind, AccessMode},
        };

        let config_clone = Arc::clone(&config);
        let db_clone = Arc::clone(&db);
        let reload_config_path = config_path.clone();
        let config_path: Box<Path> = Path::new(&config_path).into();

        let mut watcher = notify::recommended_watcher(move |res| match res {
            Ok(Event {
                kind: EventKind::Access(AccessKind::Close(AccessMode::Write)),
                ..
            }) => {
                tracing::info!("config changed, reloading...");

                let mut config = config_clone.blocking_write();
                config.reload(&*reload_config_path);

                if let Err(error) = seed_store(&*db_clone, &config) {
                    tracing::error!("failed to apply reloaded config: {error:?}");
                }
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
            fireboard,
        })
    }
}

/// Pushes the configured boards and ignore lists into the store. Boards that
/// were removed from the file stay in the store until their channel goes
/// away; only the file owns additions and edits.
pub fn seed_store(store: &impl FireboardStore, config: &Config) -> Result<()> {
    for board in &config.boards {
        let mut board = board.clone();

        if board.threshold == 0 {
            tracing::warn!(
                guild = board.guild_id,
                reaction = %board.reaction,
                "a threshold of 0 would mirror everything, clamping to 1"
            );
            board.threshold = 1;
        }

        store.upsert_board(&board)?;
    }

    for ignore in &config.ignore_lists {
        store.set_ignore_list(ignore.guild_id, &ignore.list)?;
    }

    Ok(())
}

// User data, which is stored and accessible in all command invocations
pub type PoiseContext<'a> = poise::Context<'a, State, Error>;
