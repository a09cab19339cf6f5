//! Passthrough / Session Controller (spec §4.H): a small per-engine state
//! machine deciding whether an incoming user turn resolves to a fresh
//! `execute` or is routed as `input` to whichever plugin currently owns the
//! session.
//!
//! Grounded on the teacher's small, non-blocking mutex pattern for shared
//! dispatch state (`rocode-core::Bus`'s subscriber map guarded by a lock
//! held only across the synchronous mutation) — the mutex here is likewise
//! never held across an awaited plugin RPC; callers read/mutate the state,
//! release the lock, and only then issue the dispatch.

use rise_core::deadline::Deadline;
use tokio::sync::Mutex;

use std::time::Duration;

#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    Owned { plugin: String, deadline: Deadline },
}

/// What the caller should do with the current user turn, decided before
/// any RPC is issued.
#[derive(Debug, Clone)]
pub enum Route {
    /// No owner (or the owner's deadline elapsed): resolve as a function
    /// call via the catalogue.
    Execute,
    /// The named plugin owns the session: deliver as `input` verbatim, no
    /// function resolution.
    InputTo(String),
}

pub struct SessionController {
    state: Mutex<SessionState>,
    session_timeout: Duration,
}

impl SessionController {
    pub fn new(session_timeout: Duration) -> Self {
        Self { state: Mutex::new(SessionState::Idle), session_timeout }
    }

    /// Decide how to route the next turn. If an owner exists but its
    /// deadline has elapsed, this also performs the `Owned -> Idle`
    /// transition (§4.H reason (c)) before returning `Route::Execute`.
    pub async fn route(&self) -> Route {
        let mut guard = self.state.lock().await;
        match &*guard {
            SessionState::Idle => Route::Execute,
            SessionState::Owned { plugin, deadline } => {
                if deadline.has_elapsed() {
                    *guard = SessionState::Idle;
                    Route::Execute
                } else {
                    Route::InputTo(plugin.clone())
                }
            }
        }
    }

    /// Apply the outcome of a completed dispatch to `plugin`. `keep_session`
    /// drives `Idle -> Owned` and `Owned -> Owned` (refreshing the
    /// deadline); `keep_session = false` drives `Owned -> Idle`.
    pub async fn on_complete(&self, plugin: &str, keep_session: bool) {
        let mut guard = self.state.lock().await;
        if keep_session {
            *guard = SessionState::Owned { plugin: plugin.to_string(), deadline: Deadline::after(self.session_timeout) };
        } else if matches!(&*guard, SessionState::Owned { plugin: owner, .. } if owner == plugin) {
            *guard = SessionState::Idle;
        }
    }

    /// An `error` notification from the owner, or the owner terminating for
    /// any reason, always releases ownership (§4.H reasons (b) and (d))
    /// regardless of `keep_session`.
    pub async fn release_if_owner(&self, plugin: &str) {
        let mut guard = self.state.lock().await;
        if matches!(&*guard, SessionState::Owned { plugin: owner, .. } if owner == plugin) {
            *guard = SessionState::Idle;
        }
    }

    pub async fn current_owner(&self) -> Option<String> {
        match &*self.state.lock().await {
            SessionState::Idle => None,
            SessionState::Owned { plugin, .. } => Some(plugin.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_session_routes_to_execute() {
        let controller = SessionController::new(Duration::from_secs(300));
        assert!(matches!(controller.route().await, Route::Execute));
    }

    #[tokio::test]
    async fn keep_session_true_transitions_idle_to_owned() {
        let controller = SessionController::new(Duration::from_secs(300));
        controller.on_complete("weather", true).await;
        assert!(matches!(controller.route().await, Route::InputTo(p) if p == "weather"));
    }

    #[tokio::test]
    async fn keep_session_false_releases_ownership() {
        let controller = SessionController::new(Duration::from_secs(300));
        controller.on_complete("weather", true).await;
        controller.on_complete("weather", false).await;
        assert!(matches!(controller.route().await, Route::Execute));
    }

    #[tokio::test]
    async fn error_from_owner_releases_ownership_even_if_keep_session_was_set() {
        let controller = SessionController::new(Duration::from_secs(300));
        controller.on_complete("weather", true).await;
        controller.release_if_owner("weather").await;
        assert!(matches!(controller.route().await, Route::Execute));
    }

    #[tokio::test]
    async fn elapsed_deadline_releases_ownership_on_next_route() {
        let controller = SessionController::new(Duration::from_millis(10));
        controller.on_complete("weather", true).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(controller.route().await, Route::Execute));
        assert!(controller.current_owner().await.is_none());
    }

    #[tokio::test]
    async fn only_the_current_owner_can_be_released() {
        let controller = SessionController::new(Duration::from_secs(300));
        controller.on_complete("weather", true).await;
        controller.release_if_owner("clock").await;
        assert!(matches!(controller.route().await, Route::InputTo(p) if p == "weather"));
    }
}
