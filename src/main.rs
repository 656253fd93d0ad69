use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use music_scrobbler::config::Config;
use music_scrobbler::dispatcher::ScrobbleDispatcher;
use music_scrobbler::engine::{Engine, StatusListener};
use music_scrobbler::metadata::TrackMetadata;
use music_scrobbler::playback::PlaybackState;
use music_scrobbler::probe::{OsascriptProbe, PermissionStatus};
use music_scrobbler::scrobbler::LastFmClient;
use music_scrobbler::store::ScrobbleStore;
use music_scrobbler::ScrobblerError;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Scrobbles Music.app playback to Last.fm
#[derive(Parser)]
#[command(name = "music-scrobbler", version, about, long_about = None)]
struct Cli {
    /// Use this config file instead of the default one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the player and scrobble until interrupted
    Run,
    /// Connect a Last.fm account
    Login,
    /// Forget the Last.fm account, queued scrobbles are kept
    Logout,
    /// Send queued scrobbles now, even when sending is off
    ScrobbleNow,
    /// Show queued scrobbles
    List {
        /// Show at most this many
        #[arg(long)]
        limit: Option<usize>,

        /// Newest first instead of oldest first
        #[arg(long)]
        newest_first: bool,
    },
    /// Show account, queue and settings
    Status,
    /// Switch automatic sending on or off
    SendScrobbles {
        #[arg(value_enum)]
        value: Toggle,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum Toggle {
    On,
    Off,
}

/// Reports engine activity through the log
struct LoggingListener;

impl StatusListener for LoggingListener {
    fn on_state_changed(
        &mut self,
        state: PlaybackState,
        track: Option<&TrackMetadata>,
        scrobbled: bool,
    ) {
        match track {
            Some(track) => log::info!(
                "{:?}: {}{}",
                state,
                track,
                if scrobbled { " (scrobbled)" } else { "" }
            ),
            None => log::info!("{:?}", state),
        }
    }

    fn on_song_changed(&mut self, track: &TrackMetadata) {
        log::info!("Now playing: {}", track);
    }

    fn on_scrobble_cache_count_changed(&mut self, count: usize) {
        log::info!("{} scrobbles queued", count);
    }

    fn on_permission_problem(&mut self, status: PermissionStatus) {
        match status {
            PermissionStatus::Denied => log::error!(
                "Automation access was denied. Allow it in System Settings > \
                 Privacy & Security > Automation"
            ),
            PermissionStatus::UserActionRequired => {
                log::warn!("Automation access has to be confirmed in the system prompt")
            }
            status => log::debug!("Permission check: {:?}", status),
        }
    }

    fn on_login_started(&mut self, url: &str) {
        log::info!("Approve access at {}", url);
    }

    fn on_logged_in(&mut self, username: &str) {
        log::info!("Logged in as {}", username);
    }

    fn on_logged_out(&mut self) {
        log::info!("Logged out");
    }

    fn on_login_failed(&mut self, error: &ScrobblerError) {
        log::error!("Login failed: {}", error);
    }

    fn on_error(&mut self, error: &ScrobblerError) {
        log::error!("{}", error);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let style = if atty::is(atty::Stream::Stderr) {
        env_logger::WriteStyle::Auto
    } else {
        env_logger::WriteStyle::Never
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .write_style(style)
        .init();
}

fn open_store(config: &Config) -> Result<ScrobbleStore> {
    let path = config.database_path()?;
    ScrobbleStore::open(&path)
        .with_context(|| format!("Failed to open scrobble database {:?}", path))
}

fn build_client(config: &Config) -> LastFmClient {
    LastFmClient::new(&config.lastfm.api_key, &config.lastfm.api_secret)
        .with_api_url(&config.lastfm.api_url)
        .with_timeout(config.request_timeout())
}

fn require_credentials(config: &Config) -> Result<()> {
    if !config.has_credentials() {
        anyhow::bail!("Set lastfm.api_key and lastfm.api_secret in the config file first");
    }
    Ok(())
}

fn run(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let client = Arc::new(build_client(config));
    let probe = OsascriptProbe::new(&config.player);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
    runtime.block_on(async {
        let (engine, handle) = Engine::new(
            probe,
            store,
            client,
            Box::new(LoggingListener),
            config.engine_options(),
        );
        let mut task = tokio::spawn(engine.run());

        let finished = tokio::select! {
            finished = &mut task => finished,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                handle.shutdown();
                task.await
            }
        };

        let store = finished.context("Engine task panicked")??;
        log::info!("Stopped with {} scrobbles queued", store.count()?);
        Ok::<(), anyhow::Error>(())
    })
}

fn login(config: &Config) -> Result<()> {
    require_credentials(config)?;
    let store = open_store(config)?;
    let client = build_client(config);

    let url = client.begin_authentication()?;
    println!("Approve access in your browser: {}", url);
    print!("Press Enter once access is approved... ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    let session = client.complete_authentication()?;
    store.add_account(&session.name, &session.key)?;
    println!("Logged in as {}", session.name);
    Ok(())
}

fn scrobble_now(config: &Config) -> Result<()> {
    require_credentials(config)?;
    let mut store = open_store(config)?;
    let account = store
        .account()?
        .context("Not logged in, run `music-scrobbler login` first")?;
    let client = build_client(config);
    client.set_session_key(Some(account.session_key));

    let report = ScrobbleDispatcher::new().flush_blocking(&mut store, &client, true)?;
    println!(
        "Sent {} scrobbles in {} batches, {} accepted, {} still queued",
        report.submitted,
        report.batches,
        report.accepted,
        store.count()?
    );
    Ok(())
}

fn list(config: &Config, limit: Option<usize>, newest_first: bool) -> Result<()> {
    let store = open_store(config)?;
    for scrobble in store.get_scrobbles(limit, !newest_first)? {
        println!(
            "{}  {} - {}{}",
            scrobble.played_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            scrobble.artist,
            scrobble.track,
            scrobble
                .album
                .as_deref()
                .map(|album| format!(" [{}]", album))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    match store.account()? {
        Some(account) => println!("Account:        {}", account.username),
        None => println!("Account:        not logged in"),
    }
    println!("Queued:         {}", store.count()?);
    println!("Send scrobbles: {}", if store.send_scrobbles()? { "on" } else { "off" });

    let marker = store.last_scrobble_marker()?;
    if marker.played_at.timestamp() > 0 {
        println!(
            "Last scrobble:  {}",
            marker.played_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("Player:         {}", config.player);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Run => run(&config),
        Commands::Login => login(&config),
        Commands::Logout => {
            open_store(&config)?.delete_account()?;
            println!("Logged out, queued scrobbles are kept");
            Ok(())
        }
        Commands::ScrobbleNow => scrobble_now(&config),
        Commands::List { limit, newest_first } => list(&config, limit, newest_first),
        Commands::Status => status(&config),
        Commands::SendScrobbles { value } => {
            let send = matches!(value, Toggle::On);
            open_store(&config)?.set_send_scrobbles(send)?;
            println!("Sending scrobbles {}", if send { "enabled" } else { "disabled" });
            Ok(())
        }
    }
}
