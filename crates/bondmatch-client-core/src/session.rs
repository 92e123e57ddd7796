//! Session lifecycle: the state machine that keeps an access credential usable.
//!
//! At most one refresh exchange is in flight per [`SessionManager`]. Callers that
//! need a fresh credential while an exchange is running await the same shared
//! future and receive its result instead of spending the refresh token again.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::sync::watch;

use crate::auth::{AuthApiTransport, RefreshRequest, RefreshResponse, login_request};
use crate::credential::{self, Claims, Clock, Credential, SystemClock, token_preview};
use crate::cross_tab::{SessionChannel, SessionSignal, StorageSessionChannel};
use crate::error::{SessionError, TransportError};
use crate::storage::KeyValueStore;
use crate::token_store::TokenStore;

const INVALID_CREDENTIALS_MESSAGE: &str = "invalid username or password";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Anonymous,
    Authenticated,
    Refreshing,
    Expired,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticated => "authenticated",
            Self::Refreshing => "refreshing",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn is_logged_in(self) -> bool {
        matches!(self, Self::Authenticated | Self::Refreshing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    RedirectToLogin,
}

/// Sends the user to the login entry point.
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self);
}

/// Navigator for hosts without a login screen to return to.
#[derive(Debug, Clone, Copy, Default)]
pub struct StayPut;

impl Navigator for StayPut {
    fn redirect_to_login(&self) {}
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, SessionError>>>;

enum RefreshPlan {
    Ready(String),
    Join(RefreshFuture),
    RefreshExpired,
    Missing,
}

struct SessionInner {
    tokens: TokenStore,
    transport: Arc<dyn AuthApiTransport>,
    clock: Arc<dyn Clock>,
    channel: Arc<dyn SessionChannel>,
    navigator: Arc<dyn Navigator>,
    state: watch::Sender<SessionState>,
    in_flight: Mutex<Option<RefreshFuture>>,
}

impl SessionInner {
    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(
                from = current.as_str(),
                to = next.as_str(),
                "session state transition"
            );
            *current = next;
            true
        });
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<RefreshFuture>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn derive_state(&self) -> SessionState {
        match self.tokens.read() {
            Ok(Some(stored)) => {
                if credential::usable_claims(&stored.access_token, self.clock.now()).is_some() {
                    SessionState::Authenticated
                } else {
                    SessionState::Expired
                }
            }
            Ok(None) => SessionState::Anonymous,
            Err(error) => {
                tracing::warn!(error = %error, "failed to read stored credential");
                SessionState::Anonymous
            }
        }
    }

    /// Unrecoverable authentication failure: drop everything and go back to login.
    fn terminate(&self, reason: &str) {
        tracing::info!(reason, "ending session");
        if let Err(error) = self.tokens.clear() {
            tracing::warn!(error = %error, "failed to clear stored credential");
        }
        self.set_state(SessionState::Expired);
        self.channel.publish(SessionSignal::SignedOut);
        self.navigator.redirect_to_login();
    }
}

pub struct SessionManagerBuilder {
    tokens: TokenStore,
    transport: Arc<dyn AuthApiTransport>,
    clock: Option<Arc<dyn Clock>>,
    channel: Option<Arc<dyn SessionChannel>>,
    navigator: Option<Arc<dyn Navigator>>,
}

impl SessionManagerBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to announcing changes through the persisted store itself.
    #[must_use]
    pub fn channel(mut self, channel: Arc<dyn SessionChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    #[must_use]
    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    #[must_use]
    pub fn build(self) -> SessionManager {
        let channel = self
            .channel
            .unwrap_or_else(|| Arc::new(StorageSessionChannel::new(self.tokens.backing())));
        let (state, _) = watch::channel(SessionState::Anonymous);
        let inner = Arc::new(SessionInner {
            tokens: self.tokens,
            transport: self.transport,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            channel,
            navigator: self.navigator.unwrap_or_else(|| Arc::new(StayPut)),
            state,
            in_flight: Mutex::new(None),
        });
        inner.set_state(inner.derive_state());
        SessionManager { inner }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    #[must_use]
    pub fn builder(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn AuthApiTransport>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            tokens: TokenStore::new(store),
            transport,
            clock: None,
            channel: None,
            navigator: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.state().is_logged_in()
    }

    /// Every state transition, latest value first.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.inner.tokens.backing()
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    #[must_use]
    pub fn channel(&self) -> Arc<dyn SessionChannel> {
        Arc::clone(&self.inner.channel)
    }

    /// Claims of the stored access credential, expired or not.
    #[must_use]
    pub fn claims(&self) -> Option<Claims> {
        let stored = self.inner.tokens.read().ok()??;
        credential::decode(&stored.access_token).ok()
    }

    #[must_use]
    pub fn last_username(&self) -> Option<String> {
        self.inner.tokens.last_username()
    }

    #[must_use]
    pub fn guard_route(&self) -> RouteDecision {
        match self.inner.tokens.read() {
            Ok(Some(_)) => RouteDecision::Allow,
            _ => RouteDecision::RedirectToLogin,
        }
    }

    /// Re-reads persisted storage and adopts whatever state it implies. Used at
    /// startup and whenever another tab changes the stored credential.
    pub fn resync_from_store(&self) -> SessionState {
        let derived = self.inner.derive_state();
        let next = if derived == SessionState::Expired && self.inner.in_flight().is_some() {
            SessionState::Refreshing
        } else {
            derived
        };
        self.inner.set_state(next);
        next
    }

    /// Startup: derive the initial state and, when the stored access credential
    /// has expired, try one refresh before the first call needs it.
    pub async fn restore(&self) -> SessionState {
        if self.resync_from_store() == SessionState::Expired {
            if let Err(error) = self.valid_access_token().await {
                tracing::info!(code = error.code(), "startup refresh did not restore session");
            }
        }
        self.state()
    }

    /// Stores a credential obtained elsewhere and marks the session authenticated.
    pub fn login(&self, credential: Credential) -> Result<(), SessionError> {
        self.inner.tokens.save(&credential)?;
        self.inner.set_state(SessionState::Authenticated);
        self.inner.channel.publish(SessionSignal::SignedIn);
        Ok(())
    }

    pub async fn sign_in(&self, username: &str, password: &str) -> Result<(), SessionError> {
        let request = login_request(username, password).map_err(|error| {
            SessionError::InvalidInput {
                message: error.to_string(),
            }
        })?;
        let username = request.username.clone();

        let credential = self
            .inner
            .transport
            .login(request)
            .await
            .map_err(|error| match error {
                TransportError::Rejected {
                    status: 400 | 401 | 403,
                    message,
                } => SessionError::InvalidCredentials {
                    message: if message.trim().is_empty() {
                        INVALID_CREDENTIALS_MESSAGE.to_string()
                    } else {
                        message
                    },
                },
                other => SessionError::from_transport(other),
            })?;

        self.login(credential)?;
        if let Err(error) = self.inner.tokens.remember_username(&username) {
            tracing::warn!(error = %error, "failed to remember last username");
        }
        tracing::info!("signed in");
        Ok(())
    }

    /// Logout initiated by this client. Other tabs follow through the channel.
    pub fn logout(&self) -> Result<(), SessionError> {
        let cleared = self.inner.tokens.clear();
        self.inner.set_state(SessionState::Anonymous);
        self.inner.channel.publish(SessionSignal::SignedOut);
        self.inner.navigator.redirect_to_login();
        cleared.map_err(SessionError::from)
    }

    /// The stored access credential if usable, otherwise the result of a refresh.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        self.valid_access_token().await.ok()
    }

    /// Like [`Self::get_valid_access_token`], keeping the reason a token is unavailable.
    pub async fn valid_access_token(&self) -> Result<String, SessionError> {
        self.obtain(None).await
    }

    /// Refresh even though `rejected_access_token` may still look valid locally:
    /// the server has just refused it. If another caller already replaced it,
    /// the replacement is returned without a new exchange.
    pub async fn force_refresh(&self, rejected_access_token: &str) -> Result<String, SessionError> {
        self.obtain(Some(rejected_access_token)).await
    }

    async fn obtain(&self, rejected: Option<&str>) -> Result<String, SessionError> {
        match self.plan_refresh(rejected)? {
            RefreshPlan::Ready(token) => {
                self.inner.set_state(SessionState::Authenticated);
                Ok(token)
            }
            RefreshPlan::Join(exchange) => exchange.await,
            RefreshPlan::RefreshExpired => {
                self.inner.terminate("refresh credential expired");
                Err(SessionError::CredentialExpired)
            }
            RefreshPlan::Missing => {
                self.inner.set_state(SessionState::Anonymous);
                Err(SessionError::NotAuthenticated)
            }
        }
    }

    fn plan_refresh(&self, rejected: Option<&str>) -> Result<RefreshPlan, SessionError> {
        let mut in_flight = self.inner.in_flight();
        if let Some(exchange) = in_flight.as_ref() {
            return Ok(RefreshPlan::Join(exchange.clone()));
        }

        let Some(stored) = self.inner.tokens.read()? else {
            return Ok(RefreshPlan::Missing);
        };
        let now = self.inner.clock.now();

        let access_usable = rejected.is_none_or(|rejected| rejected != stored.access_token)
            && credential::usable_claims(&stored.access_token, now).is_some();
        if access_usable {
            return Ok(RefreshPlan::Ready(stored.access_token));
        }
        if credential::usable_claims(&stored.refresh_token, now).is_none() {
            return Ok(RefreshPlan::RefreshExpired);
        }

        let exchange = run_exchange(Arc::clone(&self.inner), stored.refresh_token)
            .boxed()
            .shared();
        *in_flight = Some(exchange.clone());
        drop(in_flight);

        self.inner.set_state(SessionState::Refreshing);
        Ok(RefreshPlan::Join(exchange))
    }
}

async fn run_exchange(
    inner: Arc<SessionInner>,
    refresh_token: String,
) -> Result<String, SessionError> {
    tracing::debug!(
        refresh = %token_preview(&refresh_token),
        "exchanging refresh credential"
    );
    let outcome = inner
        .transport
        .refresh(RefreshRequest {
            refresh: refresh_token.clone(),
        })
        .await;

    let result = match outcome {
        Ok(response) => adopt_refreshed(&inner, &refresh_token, response),
        Err(error) if error.is_credential_rejection() => {
            inner.terminate("refresh credential rejected");
            Err(SessionError::RefreshRejected {
                message: error.to_string(),
            })
        }
        Err(error) => {
            tracing::warn!(error = %error, "refresh exchange failed; session kept for retry");
            inner.set_state(SessionState::Expired);
            Err(SessionError::TransportFailure {
                message: error.to_string(),
            })
        }
    };

    inner.in_flight().take();
    result
}

/// Writes the refreshed credential unless the session moved on while the
/// exchange was in flight (logout, or a new login with a different refresh token).
/// A rotated refresh token replaces the stored one in the same batch.
fn adopt_refreshed(
    inner: &SessionInner,
    refresh_token: &str,
    response: RefreshResponse,
) -> Result<String, SessionError> {
    match inner.tokens.read()? {
        Some(stored) if stored.refresh_token == refresh_token => {
            match response.refresh.filter(|rotated| !rotated.trim().is_empty()) {
                Some(rotated) => inner.tokens.save(&Credential {
                    access_token: response.access.clone(),
                    refresh_token: rotated,
                })?,
                None => inner.tokens.update_access_only(&response.access)?,
            }
            inner.set_state(SessionState::Authenticated);
            inner.channel.publish(SessionSignal::TokensChanged);
            tracing::debug!(access = %token_preview(&response.access), "access credential refreshed");
            Ok(response.access)
        }
        Some(stored) => {
            tracing::debug!("session changed during refresh; keeping newer credential");
            Ok(stored.access_token)
        }
        None => Err(SessionError::NotAuthenticated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{ManualClock, encode_unsigned};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::auth::LoginRequest;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().expect("valid timestamp")
    }

    fn token(expires_at: i64) -> String {
        encode_unsigned(&Claims {
            subject_id: Some("7".to_string()),
            subject_name: Some("trader".to_string()),
            expires_at: at(expires_at),
        })
    }

    #[derive(Default)]
    struct ScriptedTransport {
        refresh_calls: AtomicUsize,
        login_calls: AtomicUsize,
        refresh_result: Mutex<Option<Result<RefreshResponse, TransportError>>>,
    }

    impl ScriptedTransport {
        fn refreshing_to(access: String) -> Self {
            Self {
                refresh_result: Mutex::new(Some(Ok(RefreshResponse::access_only(access)))),
                ..Self::default()
            }
        }

        fn failing_with(error: TransportError) -> Self {
            Self {
                refresh_result: Mutex::new(Some(Err(error))),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl AuthApiTransport for ScriptedTransport {
        async fn login(&self, request: LoginRequest) -> Result<Credential, TransportError> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            if request.password == "wrong" {
                return Err(TransportError::Rejected {
                    status: 401,
                    message: String::new(),
                });
            }
            Ok(Credential {
                access_token: token(2_000),
                refresh_token: token(90_000),
            })
        }

        async fn refresh(
            &self,
            _request: RefreshRequest,
        ) -> Result<RefreshResponse, TransportError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_result
                .lock()
                .expect("lock")
                .clone()
                .unwrap_or_else(|| Err(TransportError::Network("unscripted".to_string())))
        }
    }

    #[derive(Default)]
    struct CountingNavigator {
        redirects: AtomicUsize,
    }

    impl Navigator for CountingNavigator {
        fn redirect_to_login(&self) {
            self.redirects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        transport: Arc<ScriptedTransport>,
        navigator: Arc<CountingNavigator>,
        session: SessionManager,
    }

    fn fixture(stored: Option<(String, String)>, transport: ScriptedTransport) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        if let Some((access_token, refresh_token)) = stored {
            TokenStore::new(store.clone())
                .save(&Credential {
                    access_token,
                    refresh_token,
                })
                .expect("seed");
        }
        let transport = Arc::new(transport);
        let navigator = Arc::new(CountingNavigator::default());
        let session = SessionManager::builder(store.clone(), transport.clone())
            .clock(Arc::new(ManualClock::new(at(1_000))))
            .navigator(navigator.clone())
            .build();
        Fixture {
            store,
            transport,
            navigator,
            session,
        }
    }

    #[test]
    fn initial_state_follows_stored_credential() {
        let anonymous = fixture(None, ScriptedTransport::default());
        assert_eq!(anonymous.session.state(), SessionState::Anonymous);

        let fresh = fixture(
            Some((token(2_000), token(90_000))),
            ScriptedTransport::default(),
        );
        assert_eq!(fresh.session.state(), SessionState::Authenticated);

        let expired = fixture(
            Some((token(500), token(90_000))),
            ScriptedTransport::default(),
        );
        assert_eq!(expired.session.state(), SessionState::Expired);

        let malformed = fixture(
            Some(("not-a-token".to_string(), token(90_000))),
            ScriptedTransport::default(),
        );
        assert_eq!(malformed.session.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn valid_access_token_is_returned_without_refresh() {
        let access = token(2_000);
        let fixture = fixture(
            Some((access.clone(), token(90_000))),
            ScriptedTransport::default(),
        );
        assert_eq!(fixture.session.get_valid_access_token().await, Some(access));
        assert_eq!(fixture.transport.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_credential_yields_absent_token() {
        let fixture = fixture(None, ScriptedTransport::default());
        assert_eq!(fixture.session.get_valid_access_token().await, None);
        assert_eq!(
            fixture.session.valid_access_token().await,
            Err(SessionError::NotAuthenticated)
        );
        assert_eq!(fixture.session.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn expired_access_is_refreshed_and_refresh_token_kept() {
        let refreshed = token(5_000);
        let refresh = token(90_000);
        let fixture = fixture(
            Some((token(500), refresh.clone())),
            ScriptedTransport::refreshing_to(refreshed.clone()),
        );

        assert_eq!(
            fixture.session.get_valid_access_token().await,
            Some(refreshed.clone())
        );
        assert_eq!(fixture.session.state(), SessionState::Authenticated);
        let stored = TokenStore::new(fixture.store.clone())
            .read()
            .expect("read")
            .expect("present");
        assert_eq!(stored.access_token, refreshed);
        assert_eq!(stored.refresh_token, refresh);
    }

    #[tokio::test]
    async fn expired_refresh_token_clears_storage_without_network_call() {
        let fixture = fixture(
            Some((token(500), token(900))),
            ScriptedTransport::refreshing_to(token(5_000)),
        );

        assert_eq!(fixture.session.get_valid_access_token().await, None);
        assert_eq!(fixture.transport.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.session.state(), SessionState::Expired);
        assert_eq!(
            TokenStore::new(fixture.store.clone()).read().expect("read"),
            None
        );
        assert_eq!(fixture.navigator.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_forces_logout() {
        let fixture = fixture(
            Some((token(500), token(90_000))),
            ScriptedTransport::failing_with(TransportError::Rejected {
                status: 401,
                message: "token is blacklisted".to_string(),
            }),
        );

        let error = fixture
            .session
            .valid_access_token()
            .await
            .expect_err("rejected");
        assert!(matches!(error, SessionError::RefreshRejected { .. }));
        assert_eq!(fixture.session.state(), SessionState::Expired);
        assert_eq!(
            TokenStore::new(fixture.store.clone()).read().expect("read"),
            None
        );
        assert_eq!(fixture.navigator.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_failure_during_refresh_keeps_credential_for_retry() {
        let fixture = fixture(
            Some((token(500), token(90_000))),
            ScriptedTransport::failing_with(TransportError::Network("timed out".to_string())),
        );

        let error = fixture
            .session
            .valid_access_token()
            .await
            .expect_err("network failure");
        assert!(error.is_retryable());
        assert!(
            TokenStore::new(fixture.store.clone())
                .read()
                .expect("read")
                .is_some()
        );
        assert_eq!(fixture.navigator.redirects.load(Ordering::SeqCst), 0);

        *fixture.transport.refresh_result.lock().expect("lock") =
            Some(Ok(RefreshResponse::access_only(token(5_000))));
        assert!(fixture.session.get_valid_access_token().await.is_some());
        assert_eq!(fixture.transport.refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_locally_valid_token() {
        let rejected = token(2_000);
        let replacement = token(6_000);
        let fixture = fixture(
            Some((rejected.clone(), token(90_000))),
            ScriptedTransport::refreshing_to(replacement.clone()),
        );

        let refreshed = fixture
            .session
            .force_refresh(&rejected)
            .await
            .expect("refreshed");
        assert_eq!(refreshed, replacement);
        assert_eq!(fixture.transport.refresh_calls.load(Ordering::SeqCst), 1);

        // A second caller still holding the old token gets the replacement for free.
        let again = fixture
            .session
            .force_refresh(&rejected)
            .await
            .expect("refreshed");
        assert_eq!(again, replacement);
        assert_eq!(fixture.transport.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sign_in_stores_pair_and_remembers_username() {
        let fixture = fixture(None, ScriptedTransport::default());
        fixture
            .session
            .sign_in(" trader ", "secret")
            .await
            .expect("signed in");
        assert_eq!(fixture.session.state(), SessionState::Authenticated);
        assert!(fixture.session.is_logged_in());
        assert_eq!(fixture.session.last_username().as_deref(), Some("trader"));
        assert_eq!(
            fixture
                .session
                .claims()
                .and_then(|claims| claims.subject_name),
            Some("trader".to_string())
        );
        assert_eq!(fixture.session.guard_route(), RouteDecision::Allow);
    }

    #[tokio::test]
    async fn sign_in_maps_rejection_to_invalid_credentials() {
        let fixture = fixture(None, ScriptedTransport::default());
        let error = fixture
            .session
            .sign_in("trader", "wrong")
            .await
            .expect_err("rejected");
        assert_eq!(
            error,
            SessionError::InvalidCredentials {
                message: INVALID_CREDENTIALS_MESSAGE.to_string()
            }
        );
        assert_eq!(fixture.session.state(), SessionState::Anonymous);
        assert_eq!(fixture.session.guard_route(), RouteDecision::RedirectToLogin);
    }

    #[tokio::test]
    async fn sign_in_rejects_blank_input_without_network_call() {
        let fixture = fixture(None, ScriptedTransport::default());
        let error = fixture
            .session
            .sign_in("  ", "secret")
            .await
            .expect_err("invalid");
        assert_eq!(error.code(), "invalid_input");
        assert_eq!(fixture.transport.login_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn logout_clears_storage_and_redirects() {
        let fixture = fixture(
            Some((token(2_000), token(90_000))),
            ScriptedTransport::default(),
        );
        fixture.session.logout().expect("logout");
        assert_eq!(fixture.session.state(), SessionState::Anonymous);
        assert_eq!(
            TokenStore::new(fixture.store.clone()).read().expect("read"),
            None
        );
        assert_eq!(fixture.navigator.redirects.load(Ordering::SeqCst), 1);
        fixture.session.logout().expect("idempotent logout");
    }

    #[tokio::test]
    async fn restore_refreshes_expired_session_at_startup() {
        let fixture = fixture(
            Some((token(500), token(90_000))),
            ScriptedTransport::refreshing_to(token(5_000)),
        );
        assert_eq!(fixture.session.restore().await, SessionState::Authenticated);
        assert_eq!(fixture.transport.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn watchers_observe_transitions() {
        let fixture = fixture(None, ScriptedTransport::default());
        let mut watcher = fixture.session.watch();
        fixture
            .session
            .login(Credential {
                access_token: token(2_000),
                refresh_token: token(90_000),
            })
            .expect("login");
        watcher.changed().await.expect("changed");
        assert_eq!(*watcher.borrow_and_update(), SessionState::Authenticated);
    }

    #[test]
    fn access_expiry_follows_the_clock() {
        let clock = Arc::new(ManualClock::new(at(1_000)));
        let store = Arc::new(MemoryStore::new());
        TokenStore::new(store.clone())
            .save(&Credential {
                access_token: token(1_100),
                refresh_token: token(90_000),
            })
            .expect("seed");
        let session = SessionManager::builder(store, Arc::new(ScriptedTransport::default()))
            .clock(clock.clone())
            .build();
        assert_eq!(session.state(), SessionState::Authenticated);

        clock.advance(Duration::seconds(100));
        assert_eq!(session.resync_from_store(), SessionState::Expired);
    }

    /// Holds every refresh exchange until released, so tests can change the
    /// session while one is in flight.
    struct GatedTransport {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        response: RefreshResponse,
    }

    impl GatedTransport {
        fn answering(response: RefreshResponse) -> Arc<Self> {
            Arc::new(Self {
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
                response,
            })
        }
    }

    #[async_trait]
    impl AuthApiTransport for GatedTransport {
        async fn login(&self, _request: LoginRequest) -> Result<Credential, TransportError> {
            Err(TransportError::Network("login not scripted".to_string()))
        }

        async fn refresh(
            &self,
            _request: RefreshRequest,
        ) -> Result<RefreshResponse, TransportError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(self.response.clone())
        }
    }

    fn gated_session(transport: Arc<GatedTransport>) -> (Arc<MemoryStore>, SessionManager) {
        let store = Arc::new(MemoryStore::new());
        TokenStore::new(store.clone())
            .save(&Credential {
                access_token: token(500),
                refresh_token: token(90_000),
            })
            .expect("seed");
        let session = SessionManager::builder(store.clone(), transport)
            .clock(Arc::new(ManualClock::new(at(1_000))))
            .build();
        (store, session)
    }

    #[tokio::test]
    async fn logout_during_refresh_is_not_undone() {
        let transport = GatedTransport::answering(RefreshResponse::access_only(token(5_000)));
        let (store, session) = gated_session(transport.clone());

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.valid_access_token().await }
        });
        transport.entered.notified().await;
        assert_eq!(session.state(), SessionState::Refreshing);

        session.logout().expect("logout");
        transport.release.notify_one();

        let outcome = pending.await.expect("join");
        assert_eq!(outcome, Err(SessionError::NotAuthenticated));
        assert_eq!(TokenStore::new(store).read().expect("read"), None);
        assert_eq!(session.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn login_during_refresh_keeps_new_credential() {
        let transport = GatedTransport::answering(RefreshResponse::access_only(token(5_000)));
        let (store, session) = gated_session(transport.clone());

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.valid_access_token().await }
        });
        transport.entered.notified().await;

        let newer = Credential {
            access_token: token(7_000),
            refresh_token: token(95_000),
        };
        session.login(newer.clone()).expect("login");
        transport.release.notify_one();

        let outcome = pending.await.expect("join");
        assert_eq!(outcome, Ok(newer.access_token.clone()));
        assert_eq!(TokenStore::new(store).read().expect("read"), Some(newer));
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_stored_pair() {
        let access = token(5_000);
        let rotated = token(99_000);
        let transport = GatedTransport::answering(RefreshResponse {
            access: access.clone(),
            refresh: Some(rotated.clone()),
        });
        let (store, session) = gated_session(transport.clone());
        transport.release.notify_one();

        assert_eq!(session.get_valid_access_token().await, Some(access.clone()));
        assert_eq!(
            TokenStore::new(store).read().expect("read"),
            Some(Credential {
                access_token: access,
                refresh_token: rotated,
            })
        );
        assert_eq!(session.state(), SessionState::Authenticated);
    }
}
