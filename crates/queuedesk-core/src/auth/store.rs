//! The session store: owner of the authenticated session.
//!
//! # Lifecycle
//!
//! ```text
//! bootstrap() ─┐
//!              ├─→ login_from_tokens() ──→ [session] ──→ timers armed
//! login UI ────┘          ↑                    │
//!                         │                    ├─ refresh timer ──→ refresh() ──┘ (or hard logout)
//!                         │                    ├─ warning timer ──→ show_expiry_warning = true
//!                         │                    └─ logout timer ───→ logout()
//! ```
//!
//! The 10-hour window is anchored by a timestamp in [`SessionStorage`].
//! Refreshes never move it; only an interactive login (or expiry) does.
//!
//! No public operation returns an error. Network and storage failures are
//! logged and turned into "no session" outcomes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::AuthBackend;
use crate::clock::{Clock, EpochMillis, SystemClock};
use crate::config::SessionConfig;

use super::storage::{ID_TOKEN_KEY, SESSION_START_KEY};
use super::timers::{AuthTimers, TimerTarget};
use super::{LoginOptions, LogoutReason, Session, SessionSnapshot, SessionStorage, TokenResponse};

type RefreshAttempt = Shared<BoxFuture<'static, bool>>;

/// A refresh request in flight, tagged with the logout epoch it belongs to.
struct InFlight {
    id: u64,
    epoch: u64,
    attempt: RefreshAttempt,
}

pub struct SessionStore<B: AuthBackend> {
    backend: Arc<B>,
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    timers: AuthTimers,
    state: watch::Sender<SessionSnapshot>,
    /// The refresh currently talking to the portal, shared by every caller.
    in_flight: Mutex<Option<InFlight>>,
    next_attempt_id: AtomicU64,
    /// Bumped on every logout so late network results can tell they are stale.
    logout_epoch: AtomicU64,
}

impl<B: AuthBackend> SessionStore<B> {
    pub fn new(
        backend: B,
        storage: Arc<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Arc::new(Self {
            backend: Arc::new(backend),
            storage,
            timers: AuthTimers::new(Arc::clone(&clock), config.clone()),
            clock,
            config,
            state,
            in_flight: Mutex::new(None),
            next_attempt_id: AtomicU64::new(0),
            logout_epoch: AtomicU64::new(0),
        })
    }

    /// Store on the system clock with the production timing rules.
    pub fn with_defaults(backend: B, storage: Arc<dyn SessionStorage>) -> Arc<Self> {
        Self::new(backend, storage, Arc::new(SystemClock), SessionConfig::default())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Install a session from freshly issued tokens and re-arm the timers.
    ///
    /// Returns `None` without installing anything when the persisted window
    /// is already over; in that case the store has logged out.
    pub fn login_from_tokens(
        self: &Arc<Self>,
        tokens: &TokenResponse,
        options: LoginOptions,
    ) -> Option<Session> {
        let now = self.clock.now_ms();

        let anchor = match self.read_anchor() {
            Some(anchor) if !options.reset_session_window => anchor,
            _ => {
                self.write_anchor(now);
                now
            }
        };
        let session_ends_at = anchor.saturating_add(self.config.window_ms());

        if now > session_ends_at {
            info!(anchor, "Session window already over, refusing tokens");
            self.logout(LogoutReason::Expired);
            return None;
        }

        let id_token = match tokens.id_token {
            Some(ref id_token) => {
                self.write_key(ID_TOKEN_KEY, id_token);
                Some(id_token.clone())
            }
            None => self.known_id_token(),
        };

        let session = Session::from_tokens(tokens, now, session_ends_at, id_token);
        self.state.send_modify(|state| {
            state.session = Some(session.clone());
            state.show_expiry_warning = false;
        });
        self.timers.schedule(self);

        info!(
            new_window = options.reset_session_window,
            access_expires_at = session.access_expires_at,
            session_ends_at = session.session_ends_at,
            "Session established"
        );
        Some(session)
    }

    /// Renew the access token using the server-held refresh credential.
    ///
    /// Callers that arrive while a refresh is already running wait for that
    /// attempt and get its real outcome; no second request is sent.
    /// Returns `false` without touching the network when there is no
    /// session or its window is over.
    pub async fn refresh(self: &Arc<Self>) -> bool {
        match self.start_or_join_refresh(true) {
            Some(attempt) => attempt.await,
            None => false,
        }
    }

    /// Tear the session down. Always safe to call, even when logged out.
    pub fn logout(&self, reason: LogoutReason) {
        {
            // An attempt started before this point must never be joined by
            // the next session.
            let mut in_flight = self.lock_in_flight();
            self.logout_epoch.fetch_add(1, Ordering::SeqCst);
            in_flight.take();
        }
        self.timers.clear();

        let mut previous = None;
        self.state.send_modify(|state| {
            previous = state.session.take();
            state.show_expiry_warning = false;
            state.is_refreshing = false;
        });

        let id_token_hint = previous
            .as_ref()
            .and_then(|session| session.id_token.clone())
            .or_else(|| self.read_key(ID_TOKEN_KEY));
        self.clear_persisted();

        info!(reason = %reason, had_session = previous.is_some(), "Logged out");
        self.notify_server_logout(id_token_hint);
    }

    /// Try to pick up an existing session after a restart.
    ///
    /// Returns `true` when a session was restored. A failed silent refresh
    /// is the normal logged-out outcome, not an error. The silent refresh
    /// is the same shared attempt `refresh` uses, so the two never race.
    pub async fn bootstrap(self: &Arc<Self>) -> bool {
        let now = self.clock.now_ms();
        if let Some(anchor) = self.read_anchor() {
            if now >= anchor.saturating_add(self.config.window_ms()) {
                info!(anchor, "Persisted session window is over, clearing it");
                self.clear_persisted();
                return false;
            }
        }

        match self.start_or_join_refresh(false) {
            Some(attempt) => attempt.await,
            None => false,
        }
    }

    pub fn set_show_expiry_warning(&self, show: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.show_expiry_warning != show;
            state.show_expiry_warning = show;
            changed
        });
    }

    /// Hide the warning without extending the session.
    pub fn dismiss_expiry_warning(&self) {
        self.set_show_expiry_warning(false);
    }

    // =========================================================================
    // Observers
    // =========================================================================

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver that sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.state.borrow().session.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().session.is_some()
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.borrow().is_refreshing
    }

    pub fn show_expiry_warning(&self) -> bool {
        self.state.borrow().show_expiry_warning
    }

    /// Bearer token for API calls, if the session holds an unexpired one.
    pub fn access_token(&self) -> Option<String> {
        let now = self.clock.now_ms();
        let state = self.state.borrow();
        state
            .session
            .as_ref()
            .filter(|session| !session.is_access_expired(now))
            .map(|session| session.access_token.clone())
    }

    /// Countdown to the forced logout, for the expiry warning.
    pub fn time_until_logout(&self) -> Option<Duration> {
        let now = self.clock.now_ms();
        let state = self.state.borrow();
        state
            .session
            .as_ref()
            .map(|session| Duration::from_millis(session.ms_until_end(now) as u64))
    }

    /// Timers still waiting to fire.
    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    // =========================================================================
    // Refresh internals
    // =========================================================================

    /// Join the attempt in flight, or start one. With `require_session`
    /// a new attempt is only started for a session whose window is open.
    fn start_or_join_refresh(self: &Arc<Self>, require_session: bool) -> Option<RefreshAttempt> {
        let mut in_flight = self.lock_in_flight();
        let epoch = self.logout_epoch.load(Ordering::SeqCst);
        if let Some(current) = in_flight.as_ref() {
            if current.epoch == epoch {
                debug!("Joining refresh already in flight");
                return Some(current.attempt.clone());
            }
            debug!("Dropping refresh started before the last logout");
            *in_flight = None;
        }

        if require_session {
            let now = self.clock.now_ms();
            let refreshable = self
                .state
                .borrow()
                .session
                .as_ref()
                .is_some_and(|session| !session.is_window_over(now));
            if !refreshable {
                debug!("No refreshable session");
                return None;
            }
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime available, cannot refresh");
            return None;
        };

        let id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst);
        self.state.send_modify(|state| state.is_refreshing = true);

        // The request runs in its own task so it finishes even if the
        // caller that started it is cancelled.
        let store = Arc::clone(self);
        let task = runtime.spawn(async move {
            let _guard = RefreshGuard { store: &store, id };
            store.run_refresh(epoch).await
        });
        let attempt = async move { task.await.unwrap_or(false) }.boxed().shared();

        *in_flight = Some(InFlight {
            id,
            epoch,
            attempt: attempt.clone(),
        });
        Some(attempt)
    }

    async fn run_refresh(self: &Arc<Self>, epoch: u64) -> bool {
        let result = self.backend.refresh_tokens().await;
        if self.logout_epoch.load(Ordering::SeqCst) != epoch {
            debug!("Logged out while refreshing, discarding refresh result");
            return false;
        }

        match result {
            Ok(Some(tokens)) => {
                let refreshed = self
                    .login_from_tokens(&tokens, LoginOptions::background())
                    .is_some();
                debug!(refreshed, "Access token refresh finished");
                refreshed
            }
            Ok(None) => {
                info!("Portal returned no tokens, refresh credential gone");
                false
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                false
            }
        }
    }

    /// Release the slot, unless a logout already handed it to a newer attempt.
    fn finish_refresh(&self, id: u64) {
        let mut in_flight = self.lock_in_flight();
        if in_flight.as_ref().is_some_and(|current| current.id == id) {
            *in_flight = None;
            self.state.send_modify(|state| state.is_refreshing = false);
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn read_anchor(&self) -> Option<EpochMillis> {
        let raw = self.read_key(SESSION_START_KEY)?;
        match raw.trim().parse::<EpochMillis>() {
            Ok(anchor) => Some(anchor),
            Err(_) => {
                warn!(value = %raw, "Discarding unreadable session anchor");
                self.remove_key(SESSION_START_KEY);
                None
            }
        }
    }

    fn write_anchor(&self, at: EpochMillis) {
        self.write_key(SESSION_START_KEY, &at.to_string());
    }

    fn known_id_token(&self) -> Option<String> {
        let current = self
            .state
            .borrow()
            .session
            .as_ref()
            .and_then(|session| session.id_token.clone());
        current.or_else(|| self.read_key(ID_TOKEN_KEY))
    }

    fn clear_persisted(&self) {
        self.remove_key(SESSION_START_KEY);
        self.remove_key(ID_TOKEN_KEY);
    }

    fn read_key(&self, key: &str) -> Option<String> {
        match self.storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read session storage");
                None
            }
        }
    }

    fn write_key(&self, key: &str, value: &str) {
        if let Err(e) = self.storage.set(key, value) {
            warn!(key, error = %e, "Failed to write session storage");
        }
    }

    fn remove_key(&self, key: &str) {
        if let Err(e) = self.storage.remove(key) {
            warn!(key, error = %e, "Failed to clear session storage");
        }
    }

    fn notify_server_logout(&self, id_token_hint: Option<String>) {
        let Ok(runtime) = Handle::try_current() else {
            debug!("No async runtime available, skipping server logout notification");
            return;
        };
        let backend = Arc::clone(&self.backend);
        runtime.spawn(async move {
            if let Err(e) = backend.notify_logout(id_token_hint).await {
                debug!(error = %e, "Server logout notification failed");
            }
        });
    }
}

/// Clears the in-flight marker however the refresh task ends.
struct RefreshGuard<'a, B: AuthBackend> {
    store: &'a SessionStore<B>,
    id: u64,
}

impl<B: AuthBackend> Drop for RefreshGuard<'_, B> {
    fn drop(&mut self) {
        self.store.finish_refresh(self.id);
    }
}

impl<B: AuthBackend> TimerTarget for SessionStore<B> {
    fn current_session(&self) -> Option<Session> {
        self.session()
    }

    async fn on_refresh(self: Arc<Self>) -> bool {
        self.refresh().await
    }

    fn on_show_warning(&self) {
        info!("Session ends soon, showing expiry warning");
        self.set_show_expiry_warning(true);
    }

    async fn on_hard_logout(self: Arc<Self>, reason: LogoutReason) {
        self.logout(reason);
    }
}
