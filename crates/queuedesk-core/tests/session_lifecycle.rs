//! Integration tests for the session store and its timers.
//!
//! Wall-clock time comes from a `ManualClock`; timer sleeps run on tokio's
//! paused clock. Helpers advance both together so deadlines computed from
//! the session line up with the virtual timers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use queuedesk_core::auth::storage::{ID_TOKEN_KEY, SESSION_START_KEY};
use queuedesk_core::{
    ApiError, AuthBackend, Clock, FileStorage, LoginOptions, LogoutReason, ManualClock,
    MemoryStorage, SessionConfig, SessionStorage, SessionStore, TokenResponse,
};

const T0: i64 = 1_000_000_000_000;
const TEN_HOURS_MS: i64 = 36_000_000;

// =========================================================================
// Helpers
// =========================================================================

#[derive(Default)]
struct MockBackend {
    responses: Mutex<VecDeque<Result<Option<TokenResponse>, ApiError>>>,
    delay: Mutex<Option<Duration>>,
    refresh_calls: AtomicUsize,
    logout_hints: Mutex<Vec<Option<String>>>,
}

impl MockBackend {
    fn push(&self, response: Result<Option<TokenResponse>, ApiError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn logout_hints(&self) -> Vec<Option<String>> {
        self.logout_hints.lock().unwrap().clone()
    }
}

impl AuthBackend for MockBackend {
    async fn refresh_tokens(&self) -> Result<Option<TokenResponse>, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or(Ok(None))
    }

    async fn notify_logout(&self, id_token_hint: Option<String>) -> Result<(), ApiError> {
        self.logout_hints.lock().unwrap().push(id_token_hint);
        Err(ApiError::ServerError("logout endpoint down".to_string()))
    }
}

struct Harness {
    store: Arc<SessionStore<Arc<MockBackend>>>,
    backend: Arc<MockBackend>,
    storage: Arc<MemoryStorage>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    fn with_config(config: SessionConfig) -> Self {
        Self::with_storage(Arc::new(MemoryStorage::new()), config)
    }

    fn with_storage(storage: Arc<MemoryStorage>, config: SessionConfig) -> Self {
        let backend = Arc::new(MockBackend::default());
        let clock = Arc::new(ManualClock::new(T0));
        let store = SessionStore::new(Arc::clone(&backend), storage.clone(), clock.clone(), config);
        Self {
            store,
            backend,
            storage,
            clock,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    fn anchor(&self) -> Option<String> {
        self.storage.get(SESSION_START_KEY).unwrap()
    }

    fn id_mirror(&self) -> Option<String> {
        self.storage.get(ID_TOKEN_KEY).unwrap()
    }

    /// Move both the wall clock and tokio's paused clock, then let tasks run.
    async fn advance_ms(&self, ms: u64) {
        self.clock.advance_ms(ms as i64);
        tokio::time::advance(Duration::from_millis(ms)).await;
        settle().await;
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn tokens(access: &str, expires_in: u64, id_token: Option<&str>) -> TokenResponse {
    TokenResponse {
        access_token: access.to_string(),
        expires_in,
        refresh_expires_in: expires_in * 2,
        id_token: id_token.map(str::to_string),
    }
}

// =========================================================================
// login_from_tokens()
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_login_new_window_scenario_a() {
    let h = Harness::new();
    let response = TokenResponse {
        access_token: "a".to_string(),
        expires_in: 3600,
        refresh_expires_in: 7200,
        id_token: Some("i".to_string()),
    };

    let session = h
        .store
        .login_from_tokens(&response, LoginOptions::interactive())
        .expect("session should be installed");

    assert_eq!(session.access_token, "a");
    assert_eq!(session.access_expires_at, 1_000_003_600_000);
    assert_eq!(session.refresh_expires_at, 1_000_007_200_000);
    assert_eq!(session.session_ends_at, 1_000_036_000_000);
    assert_eq!(session.id_token.as_deref(), Some("i"));
    assert_eq!(h.store.session(), Some(session));
    assert!(!h.store.show_expiry_warning());
    assert_eq!(h.anchor().as_deref(), Some("1000000000000"));
    assert_eq!(h.id_mirror().as_deref(), Some("i"));
    assert_eq!(h.store.pending_timers(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_login_interactive_resets_window() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 300, None), LoginOptions::interactive());

    h.clock.advance_ms(60_000);
    let session = h
        .store
        .login_from_tokens(&tokens("b", 300, None), LoginOptions::interactive())
        .unwrap();

    assert_eq!(session.session_ends_at, T0 + 60_000 + TEN_HOURS_MS);
    assert_eq!(h.anchor(), Some((T0 + 60_000).to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_login_background_reuses_window() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 300, None), LoginOptions::interactive());

    h.clock.advance_ms(120_000);
    let session = h
        .store
        .login_from_tokens(&tokens("b", 300, None), LoginOptions::background())
        .unwrap();

    assert_eq!(session.session_ends_at, T0 + TEN_HOURS_MS);
    assert_eq!(session.access_expires_at, T0 + 120_000 + 300_000);
    assert_eq!(h.anchor(), Some(T0.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_login_background_without_anchor_starts_window() {
    let h = Harness::new();
    let session = h
        .store
        .login_from_tokens(&tokens("a", 300, None), LoginOptions::background())
        .unwrap();
    assert_eq!(session.session_ends_at, T0 + TEN_HOURS_MS);
    assert_eq!(h.anchor(), Some(T0.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_login_with_stale_anchor_logs_out_expired() {
    let h = Harness::new();
    h.storage
        .set(SESSION_START_KEY, &(T0 - TEN_HOURS_MS - 1).to_string())
        .unwrap();
    h.storage.set(ID_TOKEN_KEY, "old-id").unwrap();

    let result = h
        .store.login_from_tokens(&tokens("a", 300, None), LoginOptions::background());
    settle().await;

    assert!(result.is_none());
    assert!(!h.store.is_authenticated());
    assert!(h.storage.is_empty());
    assert_eq!(h.store.pending_timers(), 0);
    assert_eq!(h.backend.logout_hints(), vec![Some("old-id".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_login_clears_expiry_warning() {
    let h = Harness::new();
    h.store.set_show_expiry_warning(true);
    h.store.login_from_tokens(&tokens("a", 300, None), LoginOptions::interactive());
    assert!(!h.store.show_expiry_warning());
}

// =========================================================================
// refresh()
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_refresh_without_session_makes_no_call() {
    let h = Harness::new();
    assert!(!h.store.refresh().await);
    assert_eq!(h.backend.refresh_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_after_window_scenario_b() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 300, None), LoginOptions::interactive());
    h.clock.advance_ms(TEN_HOURS_MS + 1);

    let session = h.store.session().unwrap();
    assert_eq!(session.session_ends_at, h.now() - 1);

    assert!(!h.store.refresh().await);
    assert_eq!(h.backend.refresh_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_keeps_session_end_fixed() {
    let h = Harness::new();
    let first = h
        .store
        .login_from_tokens(&tokens("a", 300, Some("id")), LoginOptions::interactive())
        .unwrap();

    for (i, access) in ["b", "c", "d"].into_iter().enumerate() {
        h.clock.advance_ms(3_600_000);
        h.backend.push(Ok(Some(tokens(access, 300, None))));
        assert!(h.store.refresh().await, "refresh {i} should succeed");

        let session = h.store.session().unwrap();
        assert_eq!(session.access_token, access);
        assert_eq!(session.session_ends_at, first.session_ends_at);
        assert_eq!(session.access_expires_at, h.now() + 300_000);
        assert_eq!(session.id_token.as_deref(), Some("id"), "id token carried over");
    }
    assert_eq!(h.backend.refresh_calls(), 3);
    assert!(!h.store.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_returns_false_and_keeps_session() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 300, None), LoginOptions::interactive());

    h.backend.push(Ok(None));
    assert!(!h.store.refresh().await);

    h.backend.push(Err(ApiError::ServerError("boom".to_string())));
    assert!(!h.store.refresh().await);

    assert_eq!(h.backend.refresh_calls(), 2);
    assert!(!h.store.is_refreshing());
    assert_eq!(h.store.session().unwrap().access_token, "a");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refresh_shares_one_request() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 300, None), LoginOptions::interactive());
    h.backend.set_delay(Duration::from_secs(2));
    h.backend.push(Ok(Some(tokens("b", 300, None))));

    let (first, second) = tokio::join!(h.store.refresh(), h.store.refresh());

    assert!(first);
    assert!(second);
    assert_eq!(h.backend.refresh_calls(), 1);
    assert_eq!(h.store.session().unwrap().access_token, "b");
    assert!(!h.store.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refresh_failure_reaches_every_caller() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 300, None), LoginOptions::interactive());
    h.backend.set_delay(Duration::from_secs(2));
    h.backend.push(Ok(None));

    let (first, second) = tokio::join!(h.store.refresh(), h.store.refresh());

    assert!(!first);
    assert!(!second);
    assert_eq!(h.backend.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_is_refreshing_visible_while_in_flight() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 300, None), LoginOptions::interactive());
    h.backend.set_delay(Duration::from_secs(5));
    h.backend.push(Ok(Some(tokens("b", 300, None))));

    let store = Arc::clone(&h.store);
    let pending = tokio::spawn(async move { store.refresh().await });
    settle().await;
    assert!(h.store.is_refreshing());

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(pending.await.unwrap());
    assert!(!h.store.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_result_discarded_after_logout() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 300, None), LoginOptions::interactive());
    h.backend.set_delay(Duration::from_secs(5));
    h.backend.push(Ok(Some(tokens("b", 300, None))));

    let store = Arc::clone(&h.store);
    let pending = tokio::spawn(async move { store.refresh().await });
    settle().await;

    h.store.logout(LogoutReason::User);
    tokio::time::advance(Duration::from_secs(5)).await;

    assert!(!pending.await.unwrap());
    assert!(!h.store.is_authenticated());
    assert!(h.anchor().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_after_relogin_starts_new_request() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("old", 3600, None), LoginOptions::interactive());
    h.backend.set_delay(Duration::from_secs(10));
    h.backend.push(Ok(Some(tokens("stale", 3600, None))));

    let store = Arc::clone(&h.store);
    let earlier = tokio::spawn(async move { store.refresh().await });
    settle().await;
    assert_eq!(h.backend.refresh_calls(), 1);

    h.store.logout(LogoutReason::User);
    assert!(!h.store.is_refreshing());
    h.store.login_from_tokens(&tokens("new", 3600, None), LoginOptions::interactive());

    // The new request answers after the earlier one
    tokio::time::advance(Duration::from_secs(5)).await;
    h.backend.push(Ok(Some(tokens("renewed", 3600, None))));
    assert!(h.store.refresh().await);

    assert!(!earlier.await.unwrap());
    assert_eq!(h.backend.refresh_calls(), 2);
    assert_eq!(h.store.session().unwrap().access_token, "renewed");
    assert!(!h.store.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_timer_after_relogin_keeps_new_session() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("old", 3600, None), LoginOptions::interactive());
    h.backend.set_delay(Duration::from_secs(30));
    h.backend.push(Ok(Some(tokens("stale", 3600, None))));

    let store = Arc::clone(&h.store);
    let earlier = tokio::spawn(async move { store.refresh().await });
    settle().await;

    h.store.logout(LogoutReason::User);
    h.store.login_from_tokens(&tokens("new", 60, None), LoginOptions::interactive());
    h.backend.push(Ok(Some(tokens("renewed", 3600, None))));

    // Refresh timer fires at 15s while the earlier request is still out
    h.advance_ms(15_000).await;
    assert_eq!(h.backend.refresh_calls(), 2);
    assert!(h.store.is_authenticated());
    assert!(h.store.is_refreshing());

    // Earlier request answers at 30s, the new one at 45s
    h.advance_ms(15_000).await;
    assert!(h.store.is_authenticated());
    h.advance_ms(15_000).await;
    assert!(!earlier.await.unwrap());
    assert!(h.store.is_authenticated());
    assert_eq!(h.store.session().unwrap().access_token, "renewed");
    assert!(!h.store.is_refreshing());
}

// =========================================================================
// logout()
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_logout_clears_everything() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 300, Some("id")), LoginOptions::interactive());
    h.store.set_show_expiry_warning(true);

    h.store.logout(LogoutReason::User);
    settle().await;

    assert!(!h.store.is_authenticated());
    assert!(!h.store.show_expiry_warning());
    assert!(h.anchor().is_none());
    assert!(h.id_mirror().is_none());
    assert_eq!(h.store.pending_timers(), 0);
    // Notification failure is swallowed
    assert_eq!(h.backend.logout_hints(), vec![Some("id".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_logout_without_session_still_cleans_up() {
    let h = Harness::new();
    h.storage.set(SESSION_START_KEY, &T0.to_string()).unwrap();
    h.storage.set(ID_TOKEN_KEY, "stale").unwrap();

    h.store.logout(LogoutReason::User);
    h.store.logout(LogoutReason::User);
    settle().await;

    assert!(h.storage.is_empty());
    assert_eq!(h.store.pending_timers(), 0);
    assert_eq!(h.backend.logout_hints().len(), 2);
}

// =========================================================================
// bootstrap()
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_bootstrap_stale_anchor_scenario_e() {
    let h = Harness::new();
    h.storage
        .set(SESSION_START_KEY, &(T0 - 39_600_000).to_string())
        .unwrap();
    h.storage.set(ID_TOKEN_KEY, "old").unwrap();

    assert!(!h.store.bootstrap().await);

    assert!(h.anchor().is_none());
    assert!(h.id_mirror().is_none());
    assert_eq!(h.backend.refresh_calls(), 0);
    assert!(!h.store.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_honours_existing_window() {
    let h = Harness::new();
    let started = T0 - 3_600_000;
    h.storage.set(SESSION_START_KEY, &started.to_string()).unwrap();
    h.backend.push(Ok(Some(tokens("a", 300, None))));

    assert!(h.store.bootstrap().await);

    let session = h.store.session().unwrap();
    assert_eq!(session.session_ends_at, started + TEN_HOURS_MS);
    assert_eq!(h.anchor(), Some(started.to_string()));
    assert_eq!(h.backend.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_without_anchor_starts_window() {
    let h = Harness::new();
    h.backend.push(Ok(Some(tokens("a", 300, None))));

    assert!(h.store.bootstrap().await);
    assert_eq!(h.store.session().unwrap().session_ends_at, T0 + TEN_HOURS_MS);
    assert_eq!(h.anchor(), Some(T0.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_failure_is_quiet() {
    let h = Harness::new();
    h.backend.push(Err(ApiError::ServerError("down".to_string())));
    assert!(!h.store.bootstrap().await);

    assert!(!h.store.bootstrap().await); // queue empty: Ok(None)

    assert!(!h.store.is_authenticated());
    assert_eq!(h.backend.refresh_calls(), 2);
    assert_eq!(h.store.pending_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_restores_id_token_from_mirror() {
    let storage = Arc::new(MemoryStorage::new());
    let first = Harness::with_storage(Arc::clone(&storage), SessionConfig::default());
    first
        .store.login_from_tokens(&tokens("a", 300, Some("id-1")), LoginOptions::interactive());
    drop(first);

    // Restart: a new store over the same storage
    let second = Harness::with_storage(storage, SessionConfig::default());
    second.backend.push(Ok(Some(tokens("b", 300, None))));
    assert!(second.store.bootstrap().await);

    assert_eq!(second.store.session().unwrap().id_token.as_deref(), Some("id-1"));
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_and_refresh_share_one_request() {
    let h = Harness::new();
    h.backend.set_delay(Duration::from_secs(2));
    h.backend.push(Ok(Some(tokens("a", 300, None))));

    let (restored, refreshed) = tokio::join!(h.store.bootstrap(), h.store.refresh());

    assert!(restored);
    assert!(refreshed);
    assert_eq!(h.backend.refresh_calls(), 1);
    assert!(!h.store.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_session_file_recovers_on_login() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()));
    std::fs::write(storage.path(), "{not json").unwrap();

    let store = SessionStore::new(
        Arc::new(MockBackend::default()),
        storage.clone(),
        Arc::new(ManualClock::new(T0)),
        SessionConfig::default(),
    );

    store.login_from_tokens(&tokens("a", 300, Some("id")), LoginOptions::interactive());
    assert_eq!(storage.get(SESSION_START_KEY).unwrap(), Some(T0.to_string()));

    store.logout(LogoutReason::User);
    assert_eq!(storage.get(SESSION_START_KEY).unwrap(), None);
    assert!(!storage.path().exists());
}

// =========================================================================
// Timers driving the store
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_refresh_timer_renews_token_scenario_c() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 60, None), LoginOptions::interactive());
    h.backend.push(Ok(Some(tokens("b", 60, None))));

    h.advance_ms(14_999).await;
    assert_eq!(h.backend.refresh_calls(), 0);

    h.advance_ms(1).await;
    assert_eq!(h.backend.refresh_calls(), 1);

    let session = h.store.session().unwrap();
    assert_eq!(session.access_token, "b");
    assert_eq!(session.access_expires_at, T0 + 15_000 + 60_000);
    assert_eq!(session.session_ends_at, T0 + TEN_HOURS_MS);
    assert_eq!(h.store.pending_timers(), 3, "timers re-armed for the new token");
}

#[tokio::test(start_paused = true)]
async fn test_refresh_timer_failure_hard_logs_out() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 60, Some("id")), LoginOptions::interactive());
    // No queued response: the portal reports no refresh credential

    h.advance_ms(15_000).await;

    assert_eq!(h.backend.refresh_calls(), 1);
    assert!(!h.store.is_authenticated());
    assert!(h.storage.is_empty());
    assert_eq!(h.store.pending_timers(), 0);
    assert_eq!(h.backend.logout_hints(), vec![Some("id".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_warning_then_ceiling_logout_scenario_d() {
    let config = SessionConfig {
        window: Duration::from_secs(200),
        ..SessionConfig::default()
    };
    let h = Harness::with_config(config);
    let mut changes = h.store.subscribe();
    h.store.login_from_tokens(&tokens("a", 3600, None), LoginOptions::interactive());

    h.advance_ms(77_999).await;
    assert!(!h.store.show_expiry_warning());

    h.advance_ms(1).await;
    assert!(h.store.show_expiry_warning());
    assert!(h.store.is_authenticated());
    assert_eq!(h.store.time_until_logout(), Some(Duration::from_secs(122)));
    assert!(changes.has_changed().unwrap());
    assert!(changes.borrow_and_update().show_expiry_warning);

    h.advance_ms(122_000).await;
    assert!(!h.store.is_authenticated());
    assert!(!h.store.show_expiry_warning());
    assert!(h.anchor().is_none());
    assert_eq!(h.backend.refresh_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dismissed_warning_stays_hidden() {
    let config = SessionConfig {
        window: Duration::from_secs(200),
        ..SessionConfig::default()
    };
    let h = Harness::with_config(config);
    h.store.login_from_tokens(&tokens("a", 3600, None), LoginOptions::interactive());

    h.advance_ms(78_000).await;
    h.store.dismiss_expiry_warning();
    h.advance_ms(60_000).await;

    assert!(!h.store.show_expiry_warning());
    assert!(h.store.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_access_token_hidden_once_expired() {
    let h = Harness::new();
    h.store.login_from_tokens(&tokens("a", 60, None), LoginOptions::interactive());
    assert_eq!(h.store.access_token().as_deref(), Some("a"));

    // Move only the wall clock so no timer fires
    h.clock.advance_ms(60_000);
    assert_eq!(h.store.access_token(), None);
    assert!(h.store.is_authenticated());
}
