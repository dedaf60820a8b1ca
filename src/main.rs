mod assets;
mod cache;
mod config;
mod download;
mod error;
mod library;
mod player;
mod proxy;
mod selector;
mod settings;
mod source;
mod store;
#[cfg(test)]
mod testing;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use crate::assets::Category;
use crate::cache::VideoCache;
use crate::config::AppConfig;
use crate::library::{VideoLibrary, DEFAULT_PAGE_SIZE};
use crate::player::{PlaybackTarget, PlayerController, PlayerState};
use crate::proxy::{run_proxy_server, ProxyState};
use crate::selector::NextVideoSelector;
use crate::settings::{LoopMode, OrderMode, PlaybackSettings, PlaybackSpeed, SettingsStore};
use crate::source::{RestVideoSource, Session, VideoSource};
use crate::store::KvStore;

const SESSION_KEY: &str = "session";

#[derive(Parser, Debug)]
#[command(name = "clipmark", about = "Saved-video client: next-video selection and local video cache")]
struct Cli {
    /// Configuration file (defaults to ./clipmark.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in and keep the session
    Login {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Remember the credentials for next time
        #[arg(long)]
        remember: bool,
    },
    /// Forget the session and every persisted preference
    Logout,
    /// List saved videos, newest first
    List {
        #[arg(long, default_value = "liked")]
        category: Category,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
        #[arg(long)]
        keyword: Option<String>,
    },
    /// Show the video that plays after another
    Next {
        #[arg(long)]
        current: i64,
        #[arg(long, default_value = "liked")]
        category: Category,
        /// order or random (defaults to the saved play order)
        #[arg(long)]
        order: Option<OrderMode>,
    },
    /// Print the URL a video would play from
    Resolve {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        url: String,
    },
    /// Download a video into the local cache, replacing any cached copy
    Download {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        url: String,
    },
    /// Print the cache size in MB
    CacheSize,
    /// Delete every cached video
    ClearCache,
    /// Show or change playback preferences
    Settings {
        /// 0.5x, 1x, 1.5x or 2x
        #[arg(long)]
        speed: Option<PlaybackSpeed>,
        /// single or auto
        #[arg(long = "loop")]
        loop_mode: Option<LoopMode>,
        /// order or random
        #[arg(long)]
        order: Option<OrderMode>,
    },
    /// Hide a video from lists and playback
    Hide {
        #[arg(long)]
        id: i64,
    },
    /// Drive the player from a video, one command per line on stdin
    Play {
        #[arg(long)]
        start: i64,
        #[arg(long, default_value = "liked")]
        category: Category,
    },
    /// Run the media download proxy
    Serve,
}

struct App {
    config: AppConfig,
    store: Arc<KvStore>,
}

impl App {
    fn source(&self) -> Result<RestVideoSource> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.backend.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(RestVideoSource::new(
            client,
            &self.config.backend.url,
            &self.config.backend.anon_key,
            &self.config.backend.table,
        ))
    }

    fn session(&self) -> Result<Session> {
        let Some(json) = self.store.get(SESSION_KEY) else {
            bail!("Not logged in, run `clipmark login` first");
        };
        serde_json::from_str(&json).context("Stored session is unreadable, log in again")
    }

    fn authed_source(&self) -> Result<(Session, Arc<RestVideoSource>)> {
        let session = self.session()?;
        let source = self.source()?.with_session(&session);
        Ok((session, Arc::new(source)))
    }

    fn cache(&self) -> Result<VideoCache> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.config.backend.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        VideoCache::new(
            self.config.video_dir(),
            self.store.clone(),
            client,
            self.config.proxy.endpoints(),
            self.config.cache.min_free_mb,
        )
        .context("Failed to open video cache")
    }

    fn settings(&self) -> SettingsStore {
        SettingsStore::new(self.store.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "clipmark=debug" } else { "clipmark=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = AppConfig::load(cli.config.as_deref())?;
    let store = Arc::new(KvStore::open(config.store_path()).context("Failed to open store")?);
    tracing::debug!("Using data directory {:?}", config.data_dir());

    let ctx = App { config, store };
    run(&ctx, cli.command).await
}

async fn run(ctx: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Login {
            email,
            password,
            remember,
        } => login(ctx, email, password, remember).await,
        Commands::Logout => {
            ctx.settings().clear_all()?;
            println!("Logged out");
            Ok(())
        }
        Commands::List {
            category,
            page,
            page_size,
            keyword,
        } => {
            let (session, source) = ctx.authed_source()?;
            let endpoints = ctx.config.proxy.endpoints();
            let page = VideoLibrary::new(source)
                .page(&session.user_id, category, page, page_size, keyword.as_deref())
                .await?;
            for item in &page.items {
                let thumb = item
                    .thumbnail_url
                    .as_deref()
                    .map(|t| endpoints.thumbnail_url(t))
                    .unwrap_or_default();
                println!("{:>8}  {}  {}", item.id, item.title, thumb);
            }
            println!(
                "page {}/{} ({} videos){}",
                page.page,
                page.pages,
                page.total,
                if page.has_more { ", more available" } else { "" }
            );
            Ok(())
        }
        Commands::Next {
            current,
            category,
            order,
        } => {
            let (session, source) = ctx.authed_source()?;
            let randomize = order.unwrap_or(ctx.settings().load().order).is_random();
            let next = NextVideoSelector::new(source)
                .next(&session.user_id, current, category, randomize)
                .await?;
            let cache = ctx.cache()?;
            let url = cache
                .resolve(next.id, next.media().unwrap_or_default())
                .await;
            println!("{}  {}  {}", next.id, next.title, url);
            Ok(())
        }
        Commands::Resolve { id, url } => {
            println!("{}", ctx.cache()?.resolve(id, &url).await);
            Ok(())
        }
        Commands::Download { id, url } => {
            let cache = ctx.cache()?;
            let check = cache.check_storage_access().await;
            if !check.ok() {
                eprintln!("Warning: low storage or cache directory not writable");
            }
            let resolved = cache
                .recover_from_playback_failure(id, &url, |p| eprint!("\rDownloading {}: {:5.1}%", id, p))
                .await;
            eprintln!();
            if resolved == url {
                bail!("Download failed, video stays remote");
            }
            println!("{}", resolved);
            Ok(())
        }
        Commands::CacheSize => {
            let cache = ctx.cache()?;
            println!("{} MB  {}", cache.cache_size().await, cache.cache_dir().display());
            Ok(())
        }
        Commands::ClearCache => {
            if !ctx.cache()?.clear_cache().await {
                bail!("Failed to clear cache");
            }
            println!("Cache cleared");
            Ok(())
        }
        Commands::Settings {
            speed,
            loop_mode,
            order,
        } => {
            let store = ctx.settings();
            let mut settings = store.load();
            if let Some(speed) = speed {
                settings.speed = speed;
            }
            if let Some(mode) = loop_mode {
                settings.loop_mode = mode;
            }
            if let Some(order) = order {
                settings.order = order;
            }
            store.save(&settings)?;
            show_settings(&settings);
            if !store.tip_shown() {
                println!("Tip: swipe up for the next video, or let it auto-advance with --loop auto");
                store.mark_tip_shown()?;
            }
            Ok(())
        }
        Commands::Hide { id } => {
            let (session, source) = ctx.authed_source()?;
            VideoLibrary::new(source).hide(&session.user_id, id).await?;
            println!("Hidden {}", id);
            Ok(())
        }
        Commands::Play { start, category } => play(ctx, start, category).await,
        Commands::Serve => serve(ctx).await,
    }
}

async fn login(
    ctx: &App,
    email: Option<String>,
    password: Option<String>,
    remember: bool,
) -> Result<()> {
    let settings = ctx.settings();
    let remembered = settings.remembered_login();

    let (email, password, explicit) = match (email, password, remembered) {
        (Some(email), Some(password), _) => (email, password, true),
        (_, _, Some(login)) => (login.email, login.password, false),
        _ => bail!("--email and --password are required (no remembered login)"),
    };

    let session = ctx.source()?.sign_in(&email, &password).await?;
    ctx.store
        .set(SESSION_KEY, &serde_json::to_string(&session)?)?;

    if remember {
        settings.remember_login(&email, &password)?;
    } else if explicit {
        settings.forget_login()?;
    }
    tracing::info!("Signed in as {}", session.user_id);
    println!("Logged in as {}", session.email.as_deref().unwrap_or(&email));
    Ok(())
}

const PLAY_HELP: &str = "n: next  e: playback ended  p: pause/resume  f: playback failed  \
h: hide  s <speed>  o <order|random>  l <single|auto>  q: quit";

fn show_settings(settings: &PlaybackSettings) {
    println!(
        "speed {}  loop {}  order {}",
        settings.speed.as_str(),
        settings.loop_mode.as_str(),
        settings.order.as_str()
    );
}

fn show_target(target: &PlaybackTarget) {
    println!(
        "{:>8}  {}  {}  ({}x)",
        target.item.id, target.item.title, target.url, target.rate
    );
}

async fn play(ctx: &App, start: i64, category: Category) -> Result<()> {
    let (session, source) = ctx.authed_source()?;
    let Some(first) = source.get(&session.user_id, start).await? else {
        bail!("Video {} not found", start);
    };

    let mut player = PlayerController::new(
        &session.user_id,
        category,
        NextVideoSelector::new(source),
        Arc::new(ctx.cache()?),
        ctx.settings(),
    );
    show_settings(&player.settings());
    println!("{}", PLAY_HELP);

    let mut target = Some(player.open(first).await);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if let Some(target) = target.take() {
            show_target(&target);
            if let Some(next) = player.prefetch_next().await {
                tracing::debug!("Prefetched {}", next.id);
            }
        }

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut words = line.split_whitespace();
        target = match (words.next(), words.next()) {
            (None, _) => None,
            (Some("q"), _) => break,
            (Some("n"), _) => player.on_swipe_next().await,
            (Some("e"), _) => player.on_playback_finished().await,
            (Some("h"), _) => player.hide_current().await,
            (Some("p"), _) => {
                if player.state() == PlayerState::Paused {
                    player.resume();
                } else {
                    player.pause();
                }
                if let Some(item) = player.current() {
                    println!("{:?}  {}", player.state(), item.title);
                }
                None
            }
            (Some("f"), _) => {
                recover(&mut player).await;
                None
            }
            (Some("s"), Some(value)) => {
                match value.parse() {
                    Ok(speed) => println!("rate {}", player.set_speed(speed)),
                    Err(e) => eprintln!("{}", e),
                }
                None
            }
            (Some("o"), Some(value)) => {
                match value.parse() {
                    Ok(order) => player.set_order_mode(order),
                    Err(e) => eprintln!("{}", e),
                }
                None
            }
            (Some("l"), Some(value)) => {
                match value.parse() {
                    Ok(mode) => player.set_loop_mode(mode),
                    Err(e) => eprintln!("{}", e),
                }
                None
            }
            _ => {
                println!("{}", PLAY_HELP);
                None
            }
        };
    }
    Ok(())
}

/// Download the current video after a playback failure. Ctrl-C cancels.
async fn recover(player: &mut PlayerController<RestVideoSource>) {
    let Some(recovery) = player.begin_recovery() else {
        eprintln!("Nothing to download");
        return;
    };

    let mut task = tokio::spawn(recovery.run(|p| eprint!("\rDownloading: {:5.1}%", p)));
    let finished = tokio::select! {
        result = &mut task => result,
        _ = tokio::signal::ctrl_c() => {
            player.cancel_download();
            task.await
        }
    };
    eprintln!();

    match finished {
        Ok((id, url)) => {
            if player.apply_recovered(id, &url) {
                println!("retry from {}", player.source_url().unwrap_or(&url));
            }
        }
        Err(e) => tracing::error!("Download task failed: {}", e),
    }
}

async fn serve(ctx: &App) -> Result<()> {
    let addr = ctx.config.server.addr()?;
    let state = ProxyState::new(
        reqwest::Client::new(),
        &ctx.config.proxy.user_agent,
        &ctx.config.proxy.referer,
    );

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.notify_waiters();
        }
    });

    run_proxy_server(addr, state, shutdown)
        .await
        .context("Media proxy failed")?;
    tracing::info!("Shutdown complete");
    Ok(())
}
