//! Deadline timers for the session lifecycle.
//!
//! Three timers are armed per session:
//!
//! ```text
//!  now ── refresh (access expiry - 45s) ── warning (ceiling - 122s) ── logout (ceiling)
//! ```
//!
//! Each is a spawned tokio task sleeping until its deadline. Re-arming
//! always aborts the previous generation first, so at most one timer of
//! each kind is ever live. Deadlines come from the session snapshot at
//! arm time and are never accumulated across re-arms.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::clock::{Clock, EpochMillis};
use crate::config::SessionConfig;

use super::{LogoutReason, Session};

/// What the timers call back into.
///
/// Timer tasks hold only a weak reference to the target, so armed timers
/// never keep it alive.
pub trait TimerTarget: Send + Sync + 'static {
    fn current_session(&self) -> Option<Session>;

    /// Renew the access token. `false` escalates to a hard logout.
    fn on_refresh(self: Arc<Self>) -> impl Future<Output = bool> + Send;

    fn on_show_warning(&self);

    fn on_hard_logout(self: Arc<Self>, reason: LogoutReason) -> impl Future<Output = ()> + Send;
}

/// Delays computed for one session snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPlan {
    pub refresh_in: Duration,
    pub warn_in: Duration,
    pub logout_in: Duration,
}

impl TimerPlan {
    /// Every delay is clamped to `config.min_timer_delay` so a deadline
    /// already in the past still fires, just not with a zero delay.
    pub fn compute(session: &Session, now: EpochMillis, config: &SessionConfig) -> Self {
        let min = config.min_timer_delay_ms().max(0);
        let clamp = |ms: i64| Duration::from_millis(ms.max(min) as u64);

        let to_access_expiry = session.access_expires_at.saturating_sub(now);
        let to_ceiling = session.session_ends_at.saturating_sub(now);

        Self {
            refresh_in: clamp(to_access_expiry.saturating_sub(config.refresh_lead_ms())),
            warn_in: clamp(to_ceiling.saturating_sub(config.warning_lead_ms())),
            logout_in: clamp(to_ceiling),
        }
    }
}

#[derive(Default)]
struct TimerHandles {
    refresh: Option<JoinHandle<()>>,
    warning: Option<JoinHandle<()>>,
    logout: Option<JoinHandle<()>>,
}

impl TimerHandles {
    /// Abort every handle; returns how many were still pending.
    fn abort_all(&mut self) -> usize {
        [self.refresh.take(), self.warning.take(), self.logout.take()]
            .into_iter()
            .flatten()
            .filter(|handle| {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            })
            .count()
    }

    fn pending(&self) -> usize {
        [&self.refresh, &self.warning, &self.logout]
            .into_iter()
            .flatten()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

/// Owner of one generation of session timers.
pub struct AuthTimers {
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    handles: Mutex<TimerHandles>,
}

impl AuthTimers {
    pub fn new(clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        Self {
            clock,
            config,
            handles: Mutex::new(TimerHandles::default()),
        }
    }

    /// Cancel whatever is armed. Safe to call any number of times.
    pub fn clear(&self) {
        let cancelled = self.lock().abort_all();
        if cancelled > 0 {
            debug!(cancelled, "Auth timers cleared");
        }
    }

    /// Number of timers that have not fired or been cancelled yet.
    pub fn pending(&self) -> usize {
        self.lock().pending()
    }

    /// Re-arm the timers against `target`'s current session.
    ///
    /// Returns the plan that was armed, or `None` when there is no session
    /// (or no runtime to spawn on) and nothing was armed.
    pub fn schedule<T: TimerTarget>(&self, target: &Arc<T>) -> Option<TimerPlan> {
        let mut handles = self.lock();
        handles.abort_all();

        let session = target.current_session()?;

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime available, session timers not armed");
                return None;
            }
        };

        let plan = TimerPlan::compute(&session, self.clock.now_ms(), &self.config);
        let armed_at = Instant::now();

        let weak = Arc::downgrade(target);
        let deadline = armed_at + plan.refresh_in;
        handles.refresh = Some(runtime.spawn(async move {
            sleep_until(deadline).await;
            let Some(target) = weak.upgrade() else { return };
            debug!("Access token refresh timer fired");
            if !Arc::clone(&target).on_refresh().await {
                target.on_hard_logout(LogoutReason::RefreshFailed).await;
            }
        }));

        let weak = Arc::downgrade(target);
        let deadline = armed_at + plan.warn_in;
        handles.warning = Some(runtime.spawn(async move {
            sleep_until(deadline).await;
            if let Some(target) = weak.upgrade() {
                debug!("Session expiry warning timer fired");
                target.on_show_warning();
            }
        }));

        let weak = Arc::downgrade(target);
        let deadline = armed_at + plan.logout_in;
        handles.logout = Some(runtime.spawn(async move {
            sleep_until(deadline).await;
            if let Some(target) = weak.upgrade() {
                debug!("Session ceiling reached");
                target.on_hard_logout(LogoutReason::SessionCeiling).await;
            }
        }));

        debug!(
            refresh_in_ms = plan.refresh_in.as_millis() as u64,
            warn_in_ms = plan.warn_in.as_millis() as u64,
            logout_in_ms = plan.logout_in.as_millis() as u64,
            "Auth timers armed"
        );
        Some(plan)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimerHandles> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AuthTimers {
    fn drop(&mut self) {
        self.handles
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}
