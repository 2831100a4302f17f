//! Background renewal of the bearer token.
//!
//! A refresher is the single writer of the [`TokenStore`]. Each cycle sends
//! a refresh grant, swaps the renewed credential in and rewrites the
//! credential file. Any failure ends the loop: auth and not-found answers
//! need operator action, and nothing else is retried either.

use crate::credential::{persist_credential, TokenStore};
use crate::error::{ApiError, ErrorKind};
use crate::oauth::TokenEndpoint;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh rejected: {0}")]
    Rejected(#[source] ApiError),

    #[error("refresh endpoint not found: {0}")]
    NotFound(#[source] ApiError),

    #[error("refresh failed: {0}")]
    Failed(#[source] ApiError),

    #[error("failed to persist refreshed tokens: {0}")]
    Persist(String),
}

impl RefreshError {
    fn classify(err: ApiError) -> Self {
        match err.kind {
            ErrorKind::Unauthorized | ErrorKind::Forbidden => RefreshError::Rejected(err),
            ErrorKind::NotFound => RefreshError::NotFound(err),
            ErrorKind::Transport | ErrorKind::Unknown => RefreshError::Failed(err),
        }
    }
}

/// Upper bound on how early a token is renewed.
const MAX_RENEWAL_MARGIN: Duration = Duration::from_secs(300);

/// Sleep between background cycles for a token that lives `ttl`.
///
/// Renewal starts a fifth of the lifetime early (at most five minutes), so
/// the new token lands before the current one expires.
pub fn refresh_interval(ttl: Duration) -> Duration {
    ttl - (ttl / 5).min(MAX_RENEWAL_MARGIN)
}

/// Lifecycle of a refresher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
    /// Loop ended; `None` when asked to stop, otherwise the failure text.
    Stopped(Option<String>),
}

pub struct TokenRefresher<E: TokenEndpoint> {
    endpoint: E,
    store: TokenStore,
    auth_file: PathBuf,
    state: Arc<Mutex<RefreshState>>,
}

impl<E: TokenEndpoint> TokenRefresher<E> {
    pub fn new(endpoint: E, store: TokenStore, auth_file: impl Into<PathBuf>) -> Self {
        Self {
            endpoint,
            store,
            auth_file: auth_file.into(),
            state: Arc::new(Mutex::new(RefreshState::Idle)),
        }
    }

    fn set_state(&self, state: RefreshState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn state(&self) -> RefreshState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Run one refresh cycle.
    pub fn refresh_once(&self) -> Result<(), RefreshError> {
        self.set_state(RefreshState::Refreshing);
        let result = self.cycle();
        match &result {
            Ok(()) => self.set_state(RefreshState::Idle),
            Err(e) => {
                self.log_failure(e);
                self.store.mark_stale();
                self.set_state(RefreshState::Stopped(Some(e.to_string())));
            }
        }
        result
    }

    fn cycle(&self) -> Result<(), RefreshError> {
        let current = self.store.get();
        tracing::info!("requesting a new access token and refresh token");
        let pair = self
            .endpoint
            .refresh(&current.client_id, &current.refresh_token)
            .map_err(RefreshError::classify)?;

        let mut renewed = current.renewed(pair.access_token, pair.refresh_token);
        renewed.device_code = None;
        self.store.set(renewed.clone());
        tracing::info!("updated access token and refresh token received");

        persist_credential(&self.auth_file, &renewed)
            .map_err(|e| RefreshError::Persist(format!("{e:#}")))?;
        tracing::info!(path = %self.auth_file.display(), "updated tokens written to file system");
        Ok(())
    }

    fn log_failure(&self, err: &RefreshError) {
        let uri = self.endpoint.uri();
        match err {
            RefreshError::Rejected(e) => {
                tracing::error!("{} with URI: {}", e.detail, uri);
            }
            RefreshError::NotFound(e) => {
                tracing::error!("{} with URL: {}", e.detail, uri);
                tracing::error!("Please check device code or service URI");
            }
            RefreshError::Failed(e) => {
                tracing::error!(uri, error = %e, "error updating access and refresh tokens");
            }
            RefreshError::Persist(e) => {
                tracing::error!(path = %self.auth_file.display(), error = %e, "unable to write credential file");
            }
        }
    }

    /// Refresh repeatedly, sleeping `delay` between successful cycles.
    ///
    /// A zero `delay` refreshes exactly once. Otherwise the loop runs until a
    /// cycle fails or `stop` fires (a message or a dropped sender).
    pub fn run(&self, delay: Duration, stop: &mpsc::Receiver<()>) -> Result<(), RefreshError> {
        loop {
            self.refresh_once()?;
            if delay.is_zero() {
                return Ok(());
            }
            match stop.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    self.set_state(RefreshState::Stopped(None));
                    tracing::info!("token refresher stopped");
                    return Ok(());
                }
            }
        }
    }
}

impl<E: TokenEndpoint + 'static> TokenRefresher<E> {
    /// Start the loop on its own thread. The first cycle runs after `delay`,
    /// on the assumption that the caller refreshed synchronously just before.
    pub fn spawn(self, delay: Duration) -> std::io::Result<RefreshHandle> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let state = Arc::clone(&self.state);
        let delay = delay.max(Duration::from_millis(100));
        let thread = std::thread::Builder::new()
            .name("token-refresh".into())
            .spawn(move || {
                tracing::info!(delay_secs = delay.as_secs(), "starting token refresher");
                match stop_rx.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        self.set_state(RefreshState::Stopped(None));
                        return;
                    }
                }
                if let Err(e) = self.run(delay, &stop_rx) {
                    tracing::warn!(error = %e, "token refresher exited");
                }
            })?;
        Ok(RefreshHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
            state,
        })
    }
}

/// Control handle of a running refresher. Dropping it stops the loop.
pub struct RefreshHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    state: Arc<Mutex<RefreshState>>,
}

impl RefreshHandle {
    pub fn state(&self) -> RefreshState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// True once a cycle has failed and the loop has given up.
    pub fn last_refresh_failed(&self) -> bool {
        matches!(self.state(), RefreshState::Stopped(Some(_)))
    }

    /// Signal the loop and wait for it. An in-flight refresh request is
    /// allowed to finish first.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                tracing::error!("token refresher thread panicked");
            }
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{load_credential, Credential};
    use crate::oauth::TokenPair;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted token endpoint: answers from `script` in order, then repeats
    /// the last entry.
    struct ScriptedEndpoint {
        script: Vec<Result<(), (u16, &'static str)>>,
        calls: Arc<AtomicUsize>,
        seen_refresh_tokens: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedEndpoint {
        fn new(script: Vec<Result<(), (u16, &'static str)>>) -> Self {
            Self {
                script,
                calls: Arc::new(AtomicUsize::new(0)),
                seen_refresh_tokens: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl TokenEndpoint for ScriptedEndpoint {
        fn uri(&self) -> &str {
            "https://auth.example.com/oauth/token"
        }

        fn refresh(&self, _client_id: &str, refresh_token: &str) -> Result<TokenPair, ApiError> {
            self.seen_refresh_tokens.lock().unwrap().push(refresh_token.to_string());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.get(n).or(self.script.last()).cloned().unwrap_or(Ok(()));
            match step {
                Ok(()) => Ok(TokenPair {
                    access_token: format!("access-{}", n + 1),
                    refresh_token: format!("refresh-{}", n + 1),
                }),
                Err((status, body)) => Err(ApiError::from_response("refresh_tokens", status, body)),
            }
        }
    }

    fn store() -> TokenStore {
        let mut c = Credential::unissued("cid", 2000);
        c.access_token = "access-0".into();
        c.refresh_token = "refresh-0".into();
        c.device_code = Some("dev".into());
        TokenStore::new(c)
    }

    #[test]
    fn zero_delay_refreshes_once_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let auth = tmp.path().join("auth.json");
        let endpoint = ScriptedEndpoint::new(vec![Ok(())]);
        let calls = Arc::clone(&endpoint.calls);
        let tokens = store();
        let refresher = TokenRefresher::new(endpoint, tokens.clone(), &auth);

        let (_tx, rx) = mpsc::channel();
        refresher.run(Duration::ZERO, &rx).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(refresher.state(), RefreshState::Idle);
        assert_eq!(tokens.get().access_token, "access-1");
        assert_eq!(tokens.get().refresh_token, "refresh-1");
        let persisted = load_credential(&auth, 2000).unwrap();
        assert_eq!(persisted.refresh_token, "refresh-1");
        assert_eq!(persisted.device_code, None);
    }

    #[test]
    fn each_cycle_uses_the_latest_refresh_token() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = ScriptedEndpoint::new(vec![Ok(()), Ok(()), Ok(())]);
        let seen = Arc::clone(&endpoint.seen_refresh_tokens);
        let refresher = TokenRefresher::new(endpoint, store(), tmp.path().join("auth.json"));

        for _ in 0..3 {
            refresher.refresh_once().unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec!["refresh-0", "refresh-1", "refresh-2"]);
    }

    #[test]
    fn invalid_grant_ends_the_loop_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = ScriptedEndpoint::new(vec![Ok(()), Err((401, r#"{"error_description":"invalid_grant"}"#))]);
        let calls = Arc::clone(&endpoint.calls);
        let tokens = store();
        let refresher = TokenRefresher::new(endpoint, tokens.clone(), tmp.path().join("auth.json"));

        let (_tx, rx) = mpsc::channel();
        let err = refresher.run(Duration::from_millis(5), &rx).unwrap_err();

        assert!(matches!(err, RefreshError::Rejected(ref e) if e.detail == "invalid_grant"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(tokens.is_stale());
        assert_eq!(tokens.get().access_token, "access-1");
        match refresher.state() {
            RefreshState::Stopped(Some(reason)) => assert!(reason.contains("invalid_grant")),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn not_found_and_server_errors_are_classified() {
        let tmp = tempfile::tempdir().unwrap();
        let nf = TokenRefresher::new(
            ScriptedEndpoint::new(vec![Err((404, r#"{"message":"Not Found"}"#))]),
            store(),
            tmp.path().join("a.json"),
        );
        assert!(matches!(nf.refresh_once(), Err(RefreshError::NotFound(_))));

        let boom = TokenRefresher::new(
            ScriptedEndpoint::new(vec![Err((502, "Bad Gateway"))]),
            store(),
            tmp.path().join("b.json"),
        );
        assert!(matches!(boom.refresh_once(), Err(RefreshError::Failed(_))));
    }

    #[test]
    fn unwritable_credential_file_stops_refreshing() {
        let tmp = tempfile::tempdir().unwrap();
        let auth = tmp.path().join("missing-dir").join("auth.json");
        let tokens = store();
        let refresher = TokenRefresher::new(ScriptedEndpoint::new(vec![Ok(())]), tokens.clone(), auth);

        let err = refresher.refresh_once().unwrap_err();
        assert!(matches!(err, RefreshError::Persist(_)));
        assert!(tokens.is_stale());
    }

    #[test]
    fn background_loop_refreshes_until_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = ScriptedEndpoint::new(vec![Ok(())]);
        let calls = Arc::clone(&endpoint.calls);
        let tokens = store();
        let handle = TokenRefresher::new(endpoint, tokens.clone(), tmp.path().join("auth.json"))
            .spawn(Duration::from_secs(1))
            .unwrap();

        std::thread::sleep(Duration::from_millis(2500));
        assert!(!handle.last_refresh_failed());
        handle.stop();

        let n = calls.load(Ordering::SeqCst);
        assert!(n >= 1, "expected at least one background refresh, got {n}");
        assert_eq!(tokens.get().refresh_token, format!("refresh-{n}"));
    }

    #[test]
    fn background_failure_is_visible_on_the_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = ScriptedEndpoint::new(vec![Err((403, r#"{"error_description":"access_denied"}"#))]);
        let handle = TokenRefresher::new(endpoint, store(), tmp.path().join("auth.json"))
            .spawn(Duration::from_secs(1))
            .unwrap();

        std::thread::sleep(Duration::from_millis(1500));
        assert!(handle.last_refresh_failed());
    }

    #[test]
    fn renewal_starts_before_expiry() {
        assert_eq!(refresh_interval(Duration::from_secs(2000)), Duration::from_secs(1700));
        assert_eq!(refresh_interval(Duration::from_secs(100)), Duration::from_secs(80));
        assert_eq!(refresh_interval(Duration::from_secs(5)), Duration::from_secs(4));
        assert_eq!(refresh_interval(Duration::ZERO), Duration::ZERO);
    }

    /// Endpoint that takes `latency` to answer every refresh.
    struct SlowEndpoint {
        latency: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl TokenEndpoint for SlowEndpoint {
        fn uri(&self) -> &str {
            "https://auth.example.com/oauth/token"
        }

        fn refresh(&self, _client_id: &str, _refresh_token: &str) -> Result<TokenPair, ApiError> {
            std::thread::sleep(self.latency);
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenPair {
                access_token: format!("access-{n}"),
                refresh_token: format!("refresh-{n}"),
            })
        }
    }

    #[test]
    fn readers_never_see_an_expired_token_while_refreshing() {
        let tmp = tempfile::tempdir().unwrap();
        let ttl = Duration::from_secs(3);
        let mut c = Credential::unissued("cid", ttl.as_secs());
        c.access_token = "access-0".into();
        c.refresh_token = "refresh-0".into();
        let tokens = TokenStore::new(c);
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = SlowEndpoint {
            latency: Duration::from_millis(200),
            calls: Arc::clone(&calls),
        };
        let handle = TokenRefresher::new(endpoint, tokens.clone(), tmp.path().join("auth.json"))
            .spawn(refresh_interval(ttl))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_millis(3500);
        let mut expired_seen = 0;
        while std::time::Instant::now() < deadline {
            if tokens.get().is_expired_at(chrono::Utc::now()) {
                expired_seen += 1;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.stop();

        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(expired_seen, 0);
        assert_ne!(tokens.get().access_token, "access-0");
    }

    #[test]
    fn dropping_the_handle_before_the_first_cycle_refreshes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = ScriptedEndpoint::new(vec![Ok(())]);
        let calls = Arc::clone(&endpoint.calls);
        let handle = TokenRefresher::new(endpoint, store(), tmp.path().join("auth.json"))
            .spawn(Duration::from_secs(30))
            .unwrap();
        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
