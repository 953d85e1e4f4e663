//! queuedesk - command-line front end for the portal session lifecycle.
//!
//! Installs tokens, restores a session from the persisted window anchor,
//! and follows the refresh / warning / logout cycle from a terminal.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use queuedesk_core::auth::storage::{ID_TOKEN_KEY, PORTAL_COOKIES_KEY, SESSION_START_KEY};
use queuedesk_core::utils::{format_countdown, format_timestamp};
use queuedesk_core::{
    Clock, Config, FileStorage, KeyringStorage, LoginOptions, LogoutReason, MemoryStorage,
    PortalClient, SessionConfig, SessionSnapshot, SessionStorage, SessionStore, StorageKind,
    SystemClock, TokenResponse,
};

// ============================================================================
// Constants
// ============================================================================

/// Directory for the optional log file
const LOG_DIR_ENV: &str = "QUEUEDESK_LOG_DIR";

/// Log file name prefix inside `QUEUEDESK_LOG_DIR`
const LOG_FILE_PREFIX: &str = "queuedesk.log";

/// How often `watch` redraws the countdown while the warning is shown
const COUNTDOWN_TICK_SECS: u64 = 1;

/// Time the logout notification gets before the process exits
const LOGOUT_GRACE_MS: u64 = 500;

const USAGE: &str = "\
Usage: queuedesk <command>

Commands:
  status              Show the persisted session window
  login <token.json>  Start a new session from a token response, then watch it.
                      An optional \"refresh_cookie\" field (e.g. \"refresh_token=...\")
                      is kept so later commands can refresh silently.
  refresh             Restore the session with a silent refresh
  logout              End the session and notify the portal
  watch               Restore the session and follow it until it ends";

type Store = SessionStore<PortalClient>;

/// A token response plus the cookie the portal set alongside it.
#[derive(Debug, Deserialize)]
struct LoginFile {
    #[serde(flatten)]
    tokens: TokenResponse,
    #[serde(default)]
    refresh_cookie: Option<String>,
}

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = Config::load()?;
    let storage = open_storage(&config)?;
    info!(command = %command, portal = %config.portal_url, "queuedesk starting");

    match command.as_str() {
        "status" => status(storage.as_ref()),
        "login" => {
            let path = args
                .get(1)
                .context("login needs the path of a token response file")?;
            let client = build_client(&config, &storage)?;
            login(client, storage, Path::new(path)).await
        }
        "refresh" => {
            let store = build_store(&config, storage)?;
            refresh(&store).await
        }
        "logout" => {
            let store = build_store(&config, storage)?;
            store.logout(LogoutReason::User);
            tokio::time::sleep(Duration::from_millis(LOGOUT_GRACE_MS)).await;
            println!("Logged out.");
            Ok(())
        }
        "watch" => {
            let store = build_store(&config, storage)?;
            if !store.bootstrap().await {
                println!("No session to restore.");
                return Ok(());
            }
            watch_session(&store).await
        }
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn open_storage(config: &Config) -> Result<Arc<dyn SessionStorage>> {
    let storage: Arc<dyn SessionStorage> = match config.storage {
        StorageKind::File => Arc::new(FileStorage::new(config.storage_dir()?)),
        StorageKind::Keyring => Arc::new(KeyringStorage::new()),
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
    };
    Ok(storage)
}

/// Portal client whose cookie jar lives next to the session anchor.
fn build_client(config: &Config, storage: &Arc<dyn SessionStorage>) -> Result<PortalClient> {
    let client = PortalClient::from_config(config)
        .with_context(|| format!("Invalid portal URL: {}", config.portal_url))?;
    Ok(client.with_cookie_storage(Arc::clone(storage)))
}

fn build_store(config: &Config, storage: Arc<dyn SessionStorage>) -> Result<Arc<Store>> {
    let client = build_client(config, &storage)?;
    Ok(SessionStore::with_defaults(client, storage))
}

// ============================================================================
// Commands
// ============================================================================

/// Report the persisted window without touching the network.
fn status(storage: &dyn SessionStorage) -> Result<()> {
    let window = SessionConfig::default().window_ms();
    let now = SystemClock.now_ms();

    let Some(raw) = storage.get(SESSION_START_KEY)? else {
        println!("No session window on record.");
        return Ok(());
    };
    let started: i64 = raw
        .trim()
        .parse()
        .with_context(|| format!("Unreadable session anchor: {:?}", raw))?;
    let ends = started.saturating_add(window);

    println!("Window started: {}", format_timestamp(started));
    println!("Window ends:    {}", format_timestamp(ends));
    if now >= ends {
        println!("Status:         expired (cleared on next start)");
    } else {
        let remaining = Duration::from_millis((ends - now) as u64);
        println!("Status:         open, {} left", format_countdown(remaining));
    }

    let has_id_token = storage.get(ID_TOKEN_KEY)?.is_some();
    println!("Identity token: {}", if has_id_token { "stored" } else { "none" });
    let has_cookies = storage.get(PORTAL_COOKIES_KEY)?.is_some();
    println!("Portal cookie:  {}", if has_cookies { "stored" } else { "none" });
    Ok(())
}

async fn login(client: PortalClient, storage: Arc<dyn SessionStorage>, path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let login: LoginFile =
        serde_json::from_str(&contents).context("Failed to parse token response")?;

    match login.refresh_cookie.as_deref() {
        Some(cookie) => client.import_cookies(cookie),
        None => println!("No refresh_cookie given; the session ends when its token expires."),
    }

    let store = SessionStore::with_defaults(client, storage);
    if store
        .login_from_tokens(&login.tokens, LoginOptions::interactive())
        .is_none()
    {
        bail!("Portal tokens were refused");
    }
    watch_session(&store).await
}

async fn refresh(store: &Arc<Store>) -> Result<()> {
    if !store.bootstrap().await {
        println!("No session to restore.");
        return Ok(());
    }
    print_snapshot(&store.snapshot(), store);
    Ok(())
}

/// Print lifecycle changes until the session ends or Ctrl+C.
async fn watch_session(store: &Arc<Store>) -> Result<()> {
    let mut changes: watch::Receiver<SessionSnapshot> = store.subscribe();
    let mut tick = tokio::time::interval(Duration::from_secs(COUNTDOWN_TICK_SECS));

    let initial = changes.borrow_and_update().clone();
    print_snapshot(&initial, store);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = changes.borrow_and_update().clone();
                print_snapshot(&snapshot, store);
                if !snapshot.is_authenticated() {
                    break;
                }
            }
            _ = tick.tick() => {
                if store.show_expiry_warning() {
                    if let Some(remaining) = store.time_until_logout() {
                        println!("  logging out in {}", format_countdown(remaining));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopped watching; the session window stays on record.");
                break;
            }
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &SessionSnapshot, store: &Store) {
    let Some(session) = snapshot.session.as_ref() else {
        println!("[logged out]");
        return;
    };

    let mut line = format!(
        "[signed in] token until {}, session ends {}",
        format_timestamp(session.access_expires_at),
        format_timestamp(session.session_ends_at),
    );
    if snapshot.is_refreshing {
        line.push_str(" (refreshing)");
    }
    if snapshot.show_expiry_warning {
        let remaining = store.time_until_logout().unwrap_or_default();
        line.push_str(&format!(" - WARNING: logging out in {}", format_countdown(remaining)));
    }
    println!("{}", line);
}
