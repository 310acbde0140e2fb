use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::auth::{AuthClient, AuthResponse, LoginRequest, RegisterRequest};
use crate::error::AuthError;

use super::session_models::{AuthState, Session, SessionEvent, User};
use super::session_store::SessionStore;

/// Owns the login lifecycle and is the only writer of the session store.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: SessionStore,
    auth_client: AuthClient,
    state: watch::Sender<AuthState>,
}

impl SessionManager {
    /// Starts in [`AuthState::Loading`]; call [`SessionManager::restore`] before use.
    pub fn new(store: SessionStore, auth_client: AuthClient) -> Self {
        let (state, _) = watch::channel(AuthState::Loading);
        Self {
            inner: Arc::new(Inner {
                store,
                auth_client,
                state,
            }),
        }
    }

    /// Rehydrates the session from storage.
    pub fn restore(&self) -> AuthState {
        let restored = match self.inner.store.load() {
            Some(session) => {
                tracing::info!("Restored session for {}", session.user.email);
                AuthState::Authenticated(session)
            }
            None => AuthState::Anonymous,
        };
        self.inner.state.send_replace(restored.clone());
        restored
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let request = LoginRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
        };

        match self.inner.auth_client.login(&request).await {
            Ok(response) => Ok(self.establish(response)),
            Err(e) => {
                tracing::warn!("Login failed for {}: {}", request.email, e);
                Err(e)
            }
        }
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<User, AuthError> {
        let request = RegisterRequest {
            name: name.trim().to_string(),
            email: email.trim().to_string(),
            password: password.to_string(),
        };

        match self.inner.auth_client.register(&request).await {
            Ok(response) => Ok(self.establish(response)),
            Err(e) => {
                tracing::warn!("Registration failed for {}: {}", request.email, e);
                Err(e)
            }
        }
    }

    /// Ends the session. Calling it while logged out is a no-op.
    pub fn logout(&self) {
        self.inner.store.clear();
        let previous = self.inner.state.send_replace(AuthState::Anonymous);
        if let Some(user) = previous.user() {
            tracing::info!("Logged out {}", user.email);
        }
    }

    /// Applies one event from the task client.
    pub fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Unauthorized { token } => {
                // Only the current token can be revoked; a 401 for an older token, or for a
                // request sent before login, leaves the present session alone.
                let current = self.token();
                if current.is_none() || token != current {
                    tracing::debug!("Ignoring 401 for a token that is not the current one");
                    return;
                }

                tracing::warn!("Server rejected the session, logging out");
                self.logout();
            }
        }
    }

    /// Consumes events until every sender is gone.
    pub fn listen(&self, mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => manager.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Every event means "log out", so a dropped one is covered by the next.
                        tracing::warn!("Session listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Resolves once the state is [`AuthState::Anonymous`].
    ///
    /// A forced logout is applied by the [`SessionManager::listen`] task, after the
    /// failing request has already returned `ApiError::Unauthorized`; await this to
    /// observe it. It never resolves if the 401 was ignored, so bound it with a timeout.
    pub async fn signed_out(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives in `self`, so the channel stays open while we wait.
        let _ = state.wait_for(AuthState::is_anonymous).await;
    }

    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner.state.borrow().user().cloned()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state.borrow().token().map(str::to_string)
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.inner.state.borrow(), AuthState::Loading)
    }

    fn establish(&self, response: AuthResponse) -> User {
        let user = response.user();
        let session = Session {
            token: response.token,
            user: user.clone(),
        };

        if let Err(e) = self.inner.store.save(&session) {
            tracing::warn!("Session for {} will not survive a restart: {}", user.email, e);
        }
        self.inner.state.send_replace(AuthState::Authenticated(session));
        tracing::info!("Authenticated as {}", user.email);
        user
    }
}
