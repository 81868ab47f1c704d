//! Background token refresh
//!
//! One task per store: sleep until `expires - margin`, refresh with the
//! stored refresh token, write the new credential back, repeat. After a
//! successful refresh the wait is at least half the new token's lifetime,
//! so tokens shorter than the margin do not cause back-to-back refreshes. Failed
//! refreshes are retried with exponential backoff; revoked or missing
//! refresh tokens end the loop immediately.
//!
//! Transitions live in the pure [`handle_event`]; the spawned task only
//! performs the action it returns and feeds back the next event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::MIN_REFRESH_INTERVAL;
use crate::credentials::{Credential, CredentialStore, now_millis};
use crate::error::{Error, Result};
use crate::token::TokenEndpoint;

/// Bounded exponential backoff for one refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Single attempt: the first failure is terminal.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Scheduler status, published on the handle's `watch` channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshStatus {
    /// Waiting for the next refresh to come due
    Running,
    Refreshing { attempt: u32 },
    BackingOff { attempt: u32, delay: Duration },
    /// Cancelled through the handle
    Stopped,
    /// Terminal refresh failure
    Failed(String),
}

impl RefreshStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshStatus::Stopped | RefreshStatus::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            RefreshStatus::Running => "running",
            RefreshStatus::Refreshing { .. } => "refreshing",
            RefreshStatus::BackingOff { .. } => "backing_off",
            RefreshStatus::Stopped => "stopped",
            RefreshStatus::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub enum RefreshEvent {
    /// Refresh came due
    WakeUp,
    Refreshed,
    RefreshFailed { permanent: bool, reason: String },
    /// Backoff expired
    RetryTimer,
    Cancelled,
}

/// What the task does next.
#[derive(Debug, PartialEq)]
pub enum RefreshAction {
    SleepUntilDue,
    Refresh,
    ScheduleRetry { delay: Duration },
    Finish,
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: RefreshStatus,
    event: RefreshEvent,
    policy: &RetryPolicy,
) -> (RefreshStatus, RefreshAction) {
    match (state, event) {
        // Terminal states absorb everything
        (state @ (RefreshStatus::Stopped | RefreshStatus::Failed(_)), _) => {
            (state, RefreshAction::Finish)
        }

        (_, RefreshEvent::Cancelled) => (RefreshStatus::Stopped, RefreshAction::Finish),

        (RefreshStatus::Running, RefreshEvent::WakeUp) => (
            RefreshStatus::Refreshing { attempt: 1 },
            RefreshAction::Refresh,
        ),

        (RefreshStatus::Refreshing { .. }, RefreshEvent::Refreshed) => {
            (RefreshStatus::Running, RefreshAction::SleepUntilDue)
        }

        (RefreshStatus::Refreshing { .. }, RefreshEvent::RefreshFailed { permanent: true, reason }) => {
            (RefreshStatus::Failed(reason), RefreshAction::Finish)
        }

        (RefreshStatus::Refreshing { attempt }, RefreshEvent::RefreshFailed { reason, .. })
            if attempt >= policy.max_attempts =>
        {
            let reason = if attempt > 1 {
                format!("{reason} (gave up after {attempt} attempts)")
            } else {
                reason
            };
            (RefreshStatus::Failed(reason), RefreshAction::Finish)
        }

        (RefreshStatus::Refreshing { attempt }, RefreshEvent::RefreshFailed { .. }) => {
            let delay = policy.delay_for(attempt);
            (
                RefreshStatus::BackingOff { attempt, delay },
                RefreshAction::ScheduleRetry { delay },
            )
        }

        (RefreshStatus::BackingOff { attempt, .. }, RefreshEvent::RetryTimer) => (
            RefreshStatus::Refreshing {
                attempt: attempt + 1,
            },
            RefreshAction::Refresh,
        ),

        (state, _event) => (state, RefreshAction::None),
    }
}

/// Builder for the background refresh task.
pub struct RefreshScheduler {
    store: Arc<CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    margin: Duration,
    policy: RetryPolicy,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        margin: Duration,
    ) -> Self {
        Self {
            store,
            endpoint,
            margin,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start the refresh loop on the current runtime.
    pub fn spawn(self) -> RefreshHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status) = watch::channel(RefreshStatus::Running);
        let join = tokio::spawn(self.run(cancel.clone(), status_tx));
        RefreshHandle {
            cancel,
            join,
            status,
        }
    }

    async fn run(self, cancel: CancellationToken, status_tx: watch::Sender<RefreshStatus>) {
        let mut state = RefreshStatus::Running;
        let mut action = RefreshAction::SleepUntilDue;
        let mut just_refreshed = false;

        loop {
            let event = match action {
                RefreshAction::SleepUntilDue => {
                    let delay = self.next_delay(just_refreshed).await;
                    debug!(delay_secs = delay.as_secs(), "next token refresh scheduled");
                    tokio::select! {
                        _ = cancel.cancelled() => RefreshEvent::Cancelled,
                        _ = tokio::time::sleep(delay) => RefreshEvent::WakeUp,
                    }
                }
                RefreshAction::Refresh => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => RefreshEvent::Cancelled,
                        result = self.refresh_once() => match result {
                            Ok(()) => RefreshEvent::Refreshed,
                            Err(e) => RefreshEvent::RefreshFailed {
                                permanent: e.is_permanent(),
                                reason: e.to_string(),
                            },
                        },
                    }
                }
                RefreshAction::ScheduleRetry { delay } => {
                    metrics::counter!("oauth_refresh_retries_total").increment(1);
                    tokio::select! {
                        _ = cancel.cancelled() => RefreshEvent::Cancelled,
                        _ = tokio::time::sleep(delay) => RefreshEvent::RetryTimer,
                    }
                }
                RefreshAction::Finish => break,
                RefreshAction::None => {
                    warn!(state = ?state, "refresh loop reached an unexpected transition");
                    break;
                }
            };

            just_refreshed = matches!(event, RefreshEvent::Refreshed);
            let (next, next_action) = handle_event(state, event, &self.policy);
            match &next {
                RefreshStatus::BackingOff { attempt, delay } => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "token refresh failed, retrying");
                }
                RefreshStatus::Failed(reason) => {
                    error!(reason = %reason, "token refresh failed permanently, refresh loop stopped");
                }
                RefreshStatus::Stopped => info!("refresh loop cancelled"),
                _ => {}
            }
            status_tx.send_replace(next.clone());
            state = next;
            action = next_action;
        }
    }

    async fn next_delay(&self, just_refreshed: bool) -> Duration {
        match self.store.current().await {
            Some(credential) if just_refreshed => {
                credential.paced_refresh_delay(self.margin, MIN_REFRESH_INTERVAL, now_millis())
            }
            Some(credential) => credential.refresh_delay(self.margin, now_millis()),
            None => Duration::ZERO,
        }
    }

    /// Refresh once and write the result to the store.
    async fn refresh_once(&self) -> Result<()> {
        let current = self
            .store
            .current()
            .await
            .ok_or_else(|| Error::Refresh("no credential to refresh".into()))?;
        let refresh_token = current
            .refresh
            .as_ref()
            .ok_or_else(|| Error::Refresh("credential has no refresh token".into()))?;

        let response = self.endpoint.refresh(refresh_token.expose()).await?;
        let credential = Credential::from_token_response(
            response,
            &current.scopes,
            Some(refresh_token),
            now_millis(),
        );
        let client = self.store.update(credential).await?;
        info!(
            generation = client.generation(),
            expires = client.expires(),
            "access token refreshed"
        );
        Ok(())
    }
}

/// Control handle for a spawned [`RefreshScheduler`].
pub struct RefreshHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    status: watch::Receiver<RefreshStatus>,
}

impl RefreshHandle {
    pub fn status(&self) -> RefreshStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RefreshStatus> {
        self.status.clone()
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel the loop, wait for it to exit and return the final status.
    pub async fn stop(self) -> RefreshStatus {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "refresh task ended abnormally");
        }
        self.status.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;
    use tokio::time::Instant;

    use crate::testing::{Call, ScriptedEndpoint};

    fn failed(permanent: bool) -> RefreshEvent {
        RefreshEvent::RefreshFailed {
            permanent,
            reason: "boom".into(),
        }
    }

    async fn store_expiring_in(ttl: Duration, refresh: Option<&str>) -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::new());
        store
            .update(Credential {
                access: Secret::from("at_0"),
                refresh: refresh.map(Secret::from),
                expires: now_millis() + ttl.as_millis() as u64,
                scopes: vec!["scope-a".into()],
            })
            .await
            .unwrap();
        store
    }

    async fn wait_for_generation(store: &CredentialStore, generation: u64) {
        while store.current_client().await.unwrap().generation() < generation {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn refresh_at(call: Call) -> Instant {
        match call {
            Call::Refresh { at, .. } => at,
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn default_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_max_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }

    #[test]
    fn wake_up_starts_first_attempt() {
        let (state, action) =
            handle_event(RefreshStatus::Running, RefreshEvent::WakeUp, &RetryPolicy::default());
        assert_eq!(state, RefreshStatus::Refreshing { attempt: 1 });
        assert_eq!(action, RefreshAction::Refresh);
    }

    #[test]
    fn success_goes_back_to_sleep() {
        let (state, action) = handle_event(
            RefreshStatus::Refreshing { attempt: 3 },
            RefreshEvent::Refreshed,
            &RetryPolicy::default(),
        );
        assert_eq!(state, RefreshStatus::Running);
        assert_eq!(action, RefreshAction::SleepUntilDue);
    }

    #[test]
    fn transient_failure_backs_off_then_retries() {
        let policy = RetryPolicy::default();
        let (state, action) = handle_event(RefreshStatus::Refreshing { attempt: 1 }, failed(false), &policy);
        assert_eq!(
            action,
            RefreshAction::ScheduleRetry {
                delay: Duration::from_secs(2)
            }
        );

        let (state, action) = handle_event(state, RefreshEvent::RetryTimer, &policy);
        assert_eq!(state, RefreshStatus::Refreshing { attempt: 2 });
        assert_eq!(action, RefreshAction::Refresh);
    }

    #[test]
    fn last_attempt_failure_is_terminal() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let (state, action) = handle_event(RefreshStatus::Refreshing { attempt: 3 }, failed(false), &policy);
        assert!(matches!(state, RefreshStatus::Failed(ref r) if r.contains("3 attempts")));
        assert_eq!(action, RefreshAction::Finish);
    }

    #[test]
    fn no_retry_policy_fails_on_first_error() {
        let (state, _) = handle_event(
            RefreshStatus::Refreshing { attempt: 1 },
            failed(false),
            &RetryPolicy::none(),
        );
        assert_eq!(state, RefreshStatus::Failed("boom".into()));
    }

    #[test]
    fn permanent_failure_skips_backoff() {
        let (state, action) = handle_event(
            RefreshStatus::Refreshing { attempt: 1 },
            failed(true),
            &RetryPolicy::default(),
        );
        assert_eq!(state, RefreshStatus::Failed("boom".into()));
        assert_eq!(action, RefreshAction::Finish);
    }

    #[test]
    fn cancel_stops_from_any_live_state() {
        let policy = RetryPolicy::default();
        for state in [
            RefreshStatus::Running,
            RefreshStatus::Refreshing { attempt: 2 },
            RefreshStatus::BackingOff {
                attempt: 1,
                delay: Duration::from_secs(2),
            },
        ] {
            let (next, action) = handle_event(state, RefreshEvent::Cancelled, &policy);
            assert_eq!(next, RefreshStatus::Stopped);
            assert_eq!(action, RefreshAction::Finish);
        }
    }

    #[test]
    fn terminal_states_absorb_events() {
        let policy = RetryPolicy::default();
        let (state, action) =
            handle_event(RefreshStatus::Failed("x".into()), RefreshEvent::WakeUp, &policy);
        assert_eq!(state, RefreshStatus::Failed("x".into()));
        assert_eq!(action, RefreshAction::Finish);

        let (state, _) = handle_event(RefreshStatus::Stopped, RefreshEvent::Refreshed, &policy);
        assert_eq!(state, RefreshStatus::Stopped);
    }

    #[test]
    fn unexpected_events_are_ignored() {
        let (state, action) = handle_event(
            RefreshStatus::Running,
            RefreshEvent::RetryTimer,
            &RetryPolicy::default(),
        );
        assert_eq!(state, RefreshStatus::Running);
        assert_eq!(action, RefreshAction::None);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_shortly_before_expiry_and_loops() {
        let store = store_expiring_in(Duration::from_secs(330), Some("rt_1")).await;
        let (endpoint, mut calls) = ScriptedEndpoint::new();
        let start = Instant::now();
        let handle =
            RefreshScheduler::new(store.clone(), endpoint, Duration::from_secs(300)).spawn();

        let first = calls.recv().await.unwrap();
        match &first {
            Call::Refresh { token, .. } => assert_eq!(token, "rt_1"),
            other => panic!("unexpected call {other:?}"),
        }
        let elapsed = refresh_at(first) - start;
        assert!(
            elapsed >= Duration::from_secs(25) && elapsed <= Duration::from_secs(35),
            "refreshed after {elapsed:?}"
        );

        wait_for_generation(&store, 2).await;
        let refreshed = store.current().await.unwrap();
        assert_eq!(refreshed.access.expose(), "at_refreshed_1");
        // Provider sent no new refresh token; the old one is kept
        assert_eq!(refreshed.refresh.unwrap().expose(), "rt_1");
        assert_eq!(refreshed.scopes, vec!["scope-a"]);

        // Next one-hour token comes due 55 minutes later
        let second = refresh_at(calls.recv().await.unwrap()) - start;
        let expected = Duration::from_secs(30 + 3300);
        assert!(
            second >= expected - Duration::from_secs(5) && second <= expected + Duration::from_secs(5),
            "second refresh after {second:?}"
        );

        assert_eq!(handle.stop().await, RefreshStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn short_lived_tokens_are_refreshed_at_half_life() {
        let store = store_expiring_in(Duration::from_secs(60), Some("rt_1")).await;
        let (endpoint, mut calls) = ScriptedEndpoint::new();
        for n in 0..5 {
            endpoint.push_refresh(Ok(crate::testing::token(&format!("at_short_{n}"), None, 60)));
        }
        let handle =
            RefreshScheduler::new(store.clone(), endpoint, Duration::from_secs(300)).spawn();

        // Margin exceeds the lifetime, so the first refresh is immediate
        let mut previous = refresh_at(calls.recv().await.unwrap());
        for _ in 0..4 {
            let at = refresh_at(calls.recv().await.unwrap());
            let gap = at - previous;
            assert!(
                gap >= Duration::from_secs(29) && gap <= Duration::from_secs(31),
                "refreshes {gap:?} apart"
            );
            previous = at;
        }

        assert_eq!(handle.stop().await, RefreshStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_stops_on_first_failure() {
        let store = store_expiring_in(Duration::from_secs(301), Some("rt_1")).await;
        let (endpoint, mut calls) = ScriptedEndpoint::new();
        endpoint.push_refresh(Err(Error::Network("connection reset".into())));
        let handle = RefreshScheduler::new(store.clone(), endpoint, Duration::from_secs(300))
            .with_retry_policy(RetryPolicy::none())
            .spawn();

        let mut status = handle.subscribe();
        status.wait_for(RefreshStatus::is_terminal).await.unwrap();
        match handle.status() {
            RefreshStatus::Failed(reason) => assert!(reason.contains("connection reset"), "{reason}"),
            other => panic!("expected failure, got {other:?}"),
        }

        assert!(calls.try_recv().is_ok());
        assert!(calls.try_recv().is_err(), "exactly one refresh attempt");
        assert_eq!(store.current().await.unwrap().access.expose(), "at_0");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_retries_until_success() {
        let store = store_expiring_in(Duration::from_secs(300), Some("rt_1")).await;
        let (endpoint, mut calls) = ScriptedEndpoint::new();
        endpoint.push_refresh(Err(Error::Network("connection reset".into())));
        endpoint.push_refresh(Err(Error::TokenEndpoint {
            status: 503,
            body: "try later".into(),
        }));
        let handle = RefreshScheduler::new(store.clone(), endpoint, Duration::from_secs(300))
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            })
            .spawn();

        let first = refresh_at(calls.recv().await.unwrap());
        let second = refresh_at(calls.recv().await.unwrap());
        let third = refresh_at(calls.recv().await.unwrap());
        let close = |gap: Duration, want: u64| {
            gap >= Duration::from_secs(want) && gap < Duration::from_secs(want) + Duration::from_millis(50)
        };
        assert!(close(second - first, 2), "first backoff {:?}", second - first);
        assert!(close(third - second, 4), "second backoff {:?}", third - second);

        wait_for_generation(&store, 2).await;
        assert_eq!(handle.status(), RefreshStatus::Running);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_refresh_token_is_not_retried() {
        let store = store_expiring_in(Duration::from_secs(300), Some("rt_revoked")).await;
        let (endpoint, mut calls) = ScriptedEndpoint::new();
        endpoint.push_refresh(Err(Error::InvalidGrant("400: invalid_grant".into())));
        let handle = RefreshScheduler::new(store, endpoint, Duration::from_secs(300)).spawn();

        let mut status = handle.subscribe();
        status.wait_for(RefreshStatus::is_terminal).await.unwrap();
        assert!(matches!(handle.status(), RefreshStatus::Failed(_)));

        // Give a would-be retry every chance to fire
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(calls.try_recv().is_ok());
        assert!(calls.try_recv().is_err());
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_refresh_token_fails_without_calling_endpoint() {
        let store = store_expiring_in(Duration::from_secs(60), None).await;
        let (endpoint, mut calls) = ScriptedEndpoint::new();
        let handle = RefreshScheduler::new(store, endpoint, Duration::from_secs(300)).spawn();

        let mut status = handle.subscribe();
        status.wait_for(RefreshStatus::is_terminal).await.unwrap();
        match handle.status() {
            RefreshStatus::Failed(reason) => assert!(reason.contains("no refresh token"), "{reason}"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_sleeping_loop() {
        let store = store_expiring_in(Duration::from_secs(3600), Some("rt_1")).await;
        let (endpoint, mut calls) = ScriptedEndpoint::new();
        let handle = RefreshScheduler::new(store, endpoint, Duration::from_secs(300)).spawn();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.stop().await, RefreshStatus::Stopped);
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_token_stops_loop() {
        let store = store_expiring_in(Duration::from_secs(3600), Some("rt_1")).await;
        let (endpoint, _calls) = ScriptedEndpoint::new();
        let handle = RefreshScheduler::new(store, endpoint, Duration::from_secs(300)).spawn();

        handle.cancellation_token().cancel();
        let mut status = handle.subscribe();
        status.wait_for(RefreshStatus::is_terminal).await.unwrap();
        assert_eq!(handle.status(), RefreshStatus::Stopped);
    }
}
