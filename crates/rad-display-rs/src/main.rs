mod display;
mod hub_client;
mod navigation;
mod scheduler;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use display::{Display, DisplayOptions, SettingChange, DEFAULT_CARD_EVENT, DEFAULT_SETTINGS_EVENT};
use hub_client::{ConnectionState, Credentials, EventHandler, HubConfig, HubSlot};
use navigation::{CommandSink, LogSink, NavigationSink};
use scheduler::SchedulerState;
use rad_core::settings::{DEFAULT_OPTIONS_SECTION, PERSIST_SECTION};
use rad_core::{truncate_for_display, DefaultOptions, DisplaySession, SettingName};
use rad_storage::{SettingsFile, SettingsStore};
use std::{
    env,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

const URL_KEY: &str = "url";
const TOKEN_KEY: &str = "access_token";

#[derive(Parser, Debug)]
#[command(name = "rad-display-rs")]
#[command(about = "Mirrors voice assistant cards onto a remote display", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
    #[arg(long, default_value = "")]
    config: String,
    #[arg(long, default_value = "")]
    display_id: String,
    #[arg(long, default_value = "")]
    hub_url: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = DEFAULT_CARD_EVENT)]
    event_type: String,
    #[arg(long, default_value = DEFAULT_SETTINGS_EVENT)]
    settings_event_type: String,
    #[arg(long, default_value_t = 30)]
    revert_secs: u64,
    #[arg(long, default_value_t = 30)]
    heartbeat_interval: u64,
    #[arg(long, default_value = "")]
    navigate_cmd: String,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Connect to the hub and mirror cards until interrupted
    Run,
    /// Print the effective value of a setting
    Get { name: String },
    /// Persist a setting
    Set { name: String, value: String },
}

#[derive(Clone, Debug)]
struct RuntimeConfig {
    config_path: PathBuf,
    display_id: String,
    hub_url: String,
    credentials: Credentials,
    card_event_type: String,
    settings_event_type: String,
    revert_delay: Duration,
    heartbeat_interval: Duration,
    navigate_cmd: String,
    log_dir: Option<PathBuf>,
    log_stdout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.clone().unwrap_or(Commands::Run);
    let config_path = resolve_config_path(&args.config);
    let store = Arc::new(
        SettingsFile::open(&config_path)
            .with_context(|| format!("failed to load settings from {}", config_path.display()))?,
    );
    let mut config = load_config(&args, config_path, store.as_ref());
    if command != Commands::Run {
        config.log_stdout = false;
    }
    init_logging(&config);

    match command {
        Commands::Run => run(config, store).await,
        Commands::Get { name } => print_setting(&config, store, &name),
        Commands::Set { name, value } => store_setting(&config, store, &name, &value).await,
    }
}

fn load_config(args: &Args, config_path: PathBuf, store: &dyn SettingsStore) -> RuntimeConfig {
    RuntimeConfig {
        display_id: resolve_display_id(&args.display_id),
        hub_url: resolve_hub_url(&args.hub_url, store),
        credentials: Credentials::new(resolve_token(&args.token, store)),
        card_event_type: args.event_type.clone(),
        settings_event_type: args.settings_event_type.clone(),
        revert_delay: Duration::from_secs(args.revert_secs),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval.max(1)),
        navigate_cmd: args.navigate_cmd.clone(),
        log_dir: resolve_log_dir(&args.log_dir),
        log_stdout: resolve_log_stdout(),
        config_path,
    }
}

async fn run(config: RuntimeConfig, store: Arc<SettingsFile>) -> Result<()> {
    if config.hub_url.trim().is_empty() {
        return Err(anyhow!(
            "no hub url configured; pass --hub-url, set RAD_HUB_URL or store {PERSIST_SECTION}.{URL_KEY} in {}",
            config.config_path.display()
        ));
    }
    if config.credentials.is_empty() {
        warn!(event = "hub_token_missing", config = %config.config_path.display());
    }

    let display = build_display(&config, store);
    let session = display.session();
    let configured = display.is_configured();
    info!(
        event = "display_start",
        display_id = %session.display_id,
        watched_entity = %session.watched_entity_id,
        default_dashboard = %session.default_dashboard_path,
        configured
    );
    display.show_default();
    let settings_worker = display.spawn_settings_worker();

    let mut hub_config = HubConfig::new(config.hub_url.clone(), config.credentials.clone());
    hub_config.heartbeat_interval = config.heartbeat_interval;
    let slot = HubSlot::new(hub_config);
    let client = slot.get_or_connect()?;
    let handler: Arc<dyn EventHandler> = Arc::new(display.clone());
    client.subscribe(&config.card_event_type, handler.clone())?;
    if config.settings_event_type != config.card_event_type {
        client.subscribe(&config.settings_event_type, handler)?;
    }

    let state_task = tokio::spawn(log_state_changes(client.watch_state()));
    let changes_task = tokio::spawn(log_setting_changes(display.subscribe_changes()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(event = "shutdown_requested");

    slot.teardown().await;
    if let SchedulerState::Armed { target, .. } = display.scheduler_state() {
        debug!(event = "revert_cancelled_on_shutdown", url = %target.url);
    }
    display.cancel_revert();
    state_task.abort();
    changes_task.abort();
    if let Some(worker) = settings_worker {
        worker.abort();
    }
    info!(
        event = "display_stop",
        display_id = %session.display_id,
        hub_state = client.state().as_str()
    );
    Ok(())
}

fn print_setting(config: &RuntimeConfig, store: Arc<SettingsFile>, name: &str) -> Result<()> {
    let name: SettingName = name.parse().map_err(|err: String| anyhow!(err))?;
    let display = build_display(config, store);
    let resolved = display.resolve(name);
    println!("{}\t{}\t{}", name, resolved.display_value(), resolved.source.as_str());
    Ok(())
}

async fn store_setting(
    config: &RuntimeConfig,
    store: Arc<SettingsFile>,
    name: &str,
    value: &str,
) -> Result<()> {
    let name: SettingName = name.parse().map_err(|err: String| anyhow!(err))?;
    let display = build_display(config, store);
    display.set_value(name, value).await?;
    println!("{}\t{}", name, display.native_value(name));
    Ok(())
}

fn build_display(config: &RuntimeConfig, store: Arc<SettingsFile>) -> Display {
    let session = seed_session(config, store.as_ref());
    let sink: Arc<dyn NavigationSink> = match CommandSink::parse(&config.navigate_cmd) {
        Some(sink) => {
            info!(event = "navigation_sink", kind = "command", program = %sink.program());
            Arc::new(sink)
        }
        None => {
            debug!(event = "navigation_sink", kind = "log");
            Arc::new(LogSink)
        }
    };
    let options = DisplayOptions {
        revert_delay: config.revert_delay,
        card_event_type: config.card_event_type.clone(),
        settings_event_type: config.settings_event_type.clone(),
    };
    Display::new(session, store, sink, options)
}

/// The session starts from the persisted value of each setting, then the
/// default-options table. Built-in fallbacks are only shown to users; a
/// display nobody configured stays unconfigured.
fn seed_session(config: &RuntimeConfig, store: &dyn SettingsStore) -> DisplaySession {
    let defaults: DefaultOptions = store.entries(DEFAULT_OPTIONS_SECTION).into_iter().collect();
    let effective = |name: SettingName| {
        store
            .get(PERSIST_SECTION, name.persisted_key())
            .or_else(|| defaults.get(name.default_option_key()).map(str::to_string))
            .unwrap_or_default()
    };
    DisplaySession {
        display_id: config.display_id.clone(),
        watched_entity_id: effective(SettingName::AssistEntity),
        hub_base_url: config.hub_url.clone(),
        default_dashboard_path: effective(SettingName::DefaultDashboard),
    }
}

async fn log_state_changes(mut state: watch::Receiver<ConnectionState>) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        info!(event = "hub_state", state = current.as_str());
    }
}

async fn log_setting_changes(mut changes: broadcast::Receiver<SettingChange>) {
    loop {
        match changes.recv().await {
            Ok(change) => debug!(
                event = "display_state_refresh",
                setting = %change.name,
                value = %truncate_for_display(&change.value)
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(event = "setting_changes_lagged", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_logging(config: &RuntimeConfig) {
    let level = env_value("RAD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let log_path = config
        .log_dir
        .as_deref()
        .map(|dir| log_file_path(dir, &config.display_id));
    let opened = log_path.as_deref().map(open_log_file);
    let file = match &opened {
        Some(Ok(file)) => Some(Arc::clone(file)),
        _ => None,
    };
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.log_stdout && file.is_none())
        .with_writer(log_writer(config.log_stdout, file))
        .try_init()
        .is_ok();
    if !installed {
        return;
    }
    match (log_path, opened) {
        (Some(path), Some(Ok(_))) => debug!(event = "log_file_opened", path = %path.display()),
        (Some(path), Some(Err(err))) => {
            warn!(event = "log_file_unavailable", path = %path.display(), error = %err)
        }
        _ => {}
    }
}

/// Every writer the subscriber hands out shares one append handle; `&File`
/// writes need no lock.
fn log_writer(stdout: bool, file: Option<Arc<File>>) -> BoxMakeWriter {
    match (stdout, file) {
        (true, Some(file)) => BoxMakeWriter::new(io::stdout.and(file)),
        (true, None) => BoxMakeWriter::new(io::stdout),
        (false, Some(file)) => BoxMakeWriter::new(file),
        (false, None) => BoxMakeWriter::new(io::sink),
    }
}

/// One file per display, so several displays on one host never share a log.
fn log_file_path(dir: &Path, display_id: &str) -> PathBuf {
    let stem: String = display_id
        .trim()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    let stem = if stem.is_empty() { "display".to_string() } else { stem };
    dir.join(stem).with_extension("log")
}

fn open_log_file(path: &Path) -> io::Result<Arc<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn resolve_config_path(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Some(value) = env_value("RAD_CONFIG_PATH") {
        return PathBuf::from(value);
    }
    config_dir().join("remote-assist-display/config.toml")
}

fn resolve_display_id(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Some(value) = env_value("RAD_DISPLAY_ID") {
        return value;
    }
    if let Some(value) = env_value("HOSTNAME") {
        return value;
    }
    format!("display-{}", std::process::id())
}

fn resolve_hub_url(flag: &str, store: &dyn SettingsStore) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Some(value) = env_value("RAD_HUB_URL") {
        return value;
    }
    store
        .get(PERSIST_SECTION, URL_KEY)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_default()
}

fn resolve_token(flag: &str, store: &dyn SettingsStore) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Some(value) = env_value("RAD_HUB_TOKEN") {
        return value;
    }
    store.get(PERSIST_SECTION, TOKEN_KEY).unwrap_or_default()
}

/// `off` (or any false spelling) disables the log file.
fn resolve_log_dir(flag: &str) -> Option<PathBuf> {
    let chosen = if !flag.trim().is_empty() {
        Some(flag.trim().to_string())
    } else {
        env_value("RAD_LOG_DIR")
    };
    match chosen {
        Some(value) if parse_bool(&value) == Some(false) => None,
        Some(value) => Some(PathBuf::from(value)),
        None => Some(state_dir().join("remote-assist-display/logs")),
    }
}

fn resolve_log_stdout() -> bool {
    env_value("RAD_LOG_STDOUT")
        .and_then(|value| parse_bool(&value))
        .unwrap_or(true)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" => Some(false),
        _ => None,
    }
}

fn state_dir() -> PathBuf {
    if let Some(path) = env_value("XDG_STATE_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".local/state")
}

fn config_dir() -> PathBuf {
    if let Some(path) = env_value("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".config")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
