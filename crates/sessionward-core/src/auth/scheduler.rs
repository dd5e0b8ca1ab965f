//! Refresh ahead of expiry.
//!
//! Waits for a fraction of the remaining token lifetime plus a random
//! jitter, then refreshes through the coordinator. Jitter keeps tabs that
//! restored the same session from refreshing in lockstep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::refresh::SessionRefreshCoordinator;
use super::session::Session;
use crate::config::ProactiveRefreshConfig;

/// Delay before refreshing a token that expires in `expires_in`.
///
/// Never later than the expiry itself when the token is still valid.
pub fn compute_delay(expires_in: Duration, config: &ProactiveRefreshConfig) -> Duration {
    let fraction = config.lifetime_fraction.clamp(0.0, 1.0);
    let base = expires_in.mul_f64(fraction);

    let min = config.min_jitter_secs as f64;
    let max = (config.max_jitter_secs as f64).max(min);
    let jitter = if max > min {
        rand::thread_rng().gen_range(min..max)
    } else {
        min
    };

    let delay = base + Duration::from_secs_f64(jitter);
    if expires_in.is_zero() {
        delay
    } else {
        delay.min(expires_in)
    }
}

fn armed_expiry(rx: &mut watch::Receiver<Session>) -> Option<DateTime<Utc>> {
    let session = rx.borrow_and_update();
    if session.is_authenticated {
        session.token_expires_at
    } else {
        None
    }
}

/// Handle to the background refresh timer. Dropping it stops the timer.
pub struct ProactiveRefreshScheduler {
    handle: Option<JoinHandle<()>>,
}

impl ProactiveRefreshScheduler {
    /// Start watching the store behind `coordinator`.
    ///
    /// Returns an idle scheduler when proactive refresh is disabled.
    pub fn start(coordinator: Arc<SessionRefreshCoordinator>, config: ProactiveRefreshConfig) -> Self {
        if !config.enabled {
            debug!("Proactive refresh disabled");
            return Self { handle: None };
        }

        let rx = coordinator.store().subscribe();
        let handle = tokio::spawn(Self::run(coordinator, config, rx));
        Self {
            handle: Some(handle),
        }
    }

    async fn run(
        coordinator: Arc<SessionRefreshCoordinator>,
        config: ProactiveRefreshConfig,
        mut rx: watch::Receiver<Session>,
    ) {
        loop {
            let Some(expires_at) = armed_expiry(&mut rx) else {
                if rx.changed().await.is_err() {
                    return;
                }
                continue;
            };

            let expires_in = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let delay = compute_delay(expires_in, &config);
            debug!(
                expires_in_secs = expires_in.as_secs(),
                delay_secs = delay.as_secs(),
                "Proactive refresh armed"
            );

            let timer = tokio::time::sleep(delay);
            tokio::pin!(timer);
            let fired = loop {
                tokio::select! {
                    _ = &mut timer => break true,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if armed_expiry(&mut rx) != Some(expires_at) {
                            break false;
                        }
                    }
                }
            };
            if !fired {
                debug!("Session changed, re-arming proactive refresh");
                continue;
            }

            if coordinator.is_refreshing().await {
                debug!("Refresh already in flight, skipping proactive refresh");
            } else if let Err(e) = coordinator.refresh().await {
                warn!(error = %e, "Proactive refresh failed");
            }

            // Re-arm once the expiry moves (refreshed) or the session ends
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                if armed_expiry(&mut rx) != Some(expires_at) {
                    break;
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Proactive refresh stopped");
        }
    }
}

impl Drop for ProactiveRefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::tests::{session_response, user, MockAuth};
    use crate::auth::SessionStore;
    use crate::config::SessionConfig;
    use crate::sync::SyncEvent;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_delay_window_for_1000s_expiry() {
        let config = ProactiveRefreshConfig::default();
        for _ in 0..1000 {
            let delay = compute_delay(Duration::from_secs(1000), &config);
            assert!(delay > Duration::from_secs(705), "{:?}", delay);
            assert!(delay < Duration::from_secs(780), "{:?}", delay);
        }
    }

    #[test]
    fn test_delay_never_passes_expiry() {
        let config = ProactiveRefreshConfig::default();
        assert!(compute_delay(Duration::from_secs(10), &config) <= Duration::from_secs(10));
        assert!(compute_delay(Duration::ZERO, &config) >= Duration::from_secs(5));
    }

    fn signed_in(auth: Arc<MockAuth>, expires_in_secs: i64) -> (Arc<SessionStore>, Arc<SessionRefreshCoordinator>) {
        let config = SessionConfig::default();
        let store = Arc::new(SessionStore::new(auth, &config));
        let exp = Utc::now().timestamp() + expires_in_secs;
        store.apply_sync_event(SyncEvent::Login {
            user: user(),
            tokens: session_response("r-1", exp).tokens,
        });
        let coordinator = SessionRefreshCoordinator::new(Arc::clone(&store));
        (store, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_ahead_of_expiry() {
        let auth = MockAuth::refreshing_to(session_response("r-2", Utc::now().timestamp() + 10_000));
        let (store, coordinator) = signed_in(auth.clone(), 1000);
        let _scheduler = ProactiveRefreshScheduler::start(coordinator, ProactiveRefreshConfig::default());

        tokio::time::sleep(Duration::from_secs(700)).await;
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.state().refresh_token().map(|t| t.as_str()), Some("r-2"));

        // Re-armed from the new expiry, far away
        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let auth = MockAuth::refreshing_to(session_response("r-2", Utc::now().timestamp() + 10_000));
        let (_store, coordinator) = signed_in(auth.clone(), 1000);
        let mut scheduler = ProactiveRefreshScheduler::start(coordinator, ProactiveRefreshConfig::default());
        tokio::task::yield_now().await;
        assert!(scheduler.is_running());

        scheduler.stop();
        tokio::time::sleep(Duration::from_secs(2000)).await;
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_disarms_timer() {
        let auth = MockAuth::refreshing_to(session_response("r-2", Utc::now().timestamp() + 10_000));
        let (store, coordinator) = signed_in(auth.clone(), 1000);
        let _scheduler = ProactiveRefreshScheduler::start(coordinator, ProactiveRefreshConfig::default());

        tokio::time::sleep(Duration::from_secs(100)).await;
        store.apply_sync_event(SyncEvent::Logout);
        tokio::time::sleep(Duration::from_secs(2000)).await;
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_when_refresh_in_flight() {
        let auth = MockAuth::slow(
            Ok(session_response("r-2", Utc::now().timestamp() + 10_000)),
            Duration::from_secs(100),
        );
        let (_store, coordinator) = signed_in(auth.clone(), 1000);
        let _scheduler = ProactiveRefreshScheduler::start(Arc::clone(&coordinator), ProactiveRefreshConfig::default());

        tokio::time::sleep(Duration::from_secs(740)).await;
        let manual = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.refresh().await }
        });

        tokio::time::sleep(Duration::from_secs(160)).await;
        assert!(manual.await.unwrap().is_ok());
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_scheduler_is_idle() {
        let auth = MockAuth::refreshing_to(session_response("r-2", 2_100_000_000));
        let (_store, coordinator) = signed_in(auth, 1000);
        let config = ProactiveRefreshConfig { enabled: false, ..ProactiveRefreshConfig::default() };
        assert!(!ProactiveRefreshScheduler::start(coordinator, config).is_running());
    }
}
