//! # Auth Bridge
//!
//! Identity of the signed-in user, supplied by the host.
//!
//! ## Session Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   SignedOut ── sign in ──► SignedIn(session) ── sign out ──► SignedOut │
//! │                                 │      ▲                                │
//! │                                 │      │ new credential                 │
//! │                                 ▼      │                                │
//! │                        remote rejects credential                        │
//! │                        (engine: needs_reauth = true,                    │
//! │                         flush suspended until the next SignedIn)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The handshake itself (providers, token refresh) lives outside the engine.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::info;

/// A signed-in user and their credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,

    /// Opaque credential passed to the remote store by the host.
    pub credential: String,

    /// Expiry (epoch ms), when the provider reports one.
    pub expires_at: Option<i64>,
}

impl AuthSession {
    pub fn new(user_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            credential: credential.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True once the credential's expiry has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| Utc::now().timestamp_millis() >= at)
    }
}

/// What the auth provider currently reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    SignedOut,
    SignedIn(AuthSession),
}

impl AuthState {
    pub fn session(&self) -> Option<&AuthSession> {
        match self {
            AuthState::SignedIn(session) => Some(session),
            AuthState::SignedOut => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session().map(|s| s.user_id.as_str())
    }
}

/// Source of the current session and of sign-in/sign-out signals.
#[async_trait]
pub trait AuthBridge: Send + Sync {
    /// Returns the live session, if a user is signed in.
    async fn current_session(&self) -> Option<AuthSession>;

    /// Watches the auth state. Every sign-in (including a credential
    /// refresh) is a new value.
    fn subscribe(&self) -> watch::Receiver<AuthState>;
}

// =============================================================================
// Static Auth
// =============================================================================

/// [`AuthBridge`] driven directly by the host or a test.
#[derive(Debug)]
pub struct StaticAuth {
    state: watch::Sender<AuthState>,
}

impl StaticAuth {
    pub fn signed_out() -> Self {
        let (state, _) = watch::channel(AuthState::SignedOut);
        Self { state }
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        let auth = Self::signed_out();
        auth.sign_in(user_id);
        auth
    }

    /// Signs in with a placeholder credential.
    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        let credential = format!("static-{}", user_id);
        self.sign_in_with(AuthSession::new(user_id, credential));
    }

    /// Signs in (or refreshes the credential) with an explicit session.
    pub fn sign_in_with(&self, session: AuthSession) {
        info!(user_id = %session.user_id, "Signed in");
        self.state.send_replace(AuthState::SignedIn(session));
    }

    pub fn sign_out(&self) {
        info!("Signed out");
        self.state.send_replace(AuthState::SignedOut);
    }
}

impl Default for StaticAuth {
    fn default() -> Self {
        Self::signed_out()
    }
}

#[async_trait]
impl AuthBridge for StaticAuth {
    async fn current_session(&self) -> Option<AuthSession> {
        self.state.borrow().session().cloned()
    }

    fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }
}
