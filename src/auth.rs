//! Bearer-token plumbing.
//!
//! The session core never talks to an auth endpoint itself. It reads tokens
//! through [`TokenProvider`] and reacts to the refresh notifications the
//! provider publishes.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::Result;

/// Capacity of the refresh notification channel.
const REFRESH_CHANNEL_CAPACITY: usize = 16;

/// Tokens expiring within this window are already treated as invalid.
const DEFAULT_EXPIRY_LEEWAY: TimeDelta = TimeDelta::seconds(10);

/// Source of bearer tokens for the STOMP `CONNECT` frame.
///
/// A refresh notification carries `Some(token)` when a new token was issued
/// and `None` when the user logged out.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// The current token, valid or not.
    fn token(&self) -> Option<SecretString>;

    /// Whether [`TokenProvider::token`] is present and not expired.
    fn is_token_valid(&self) -> bool;

    /// Subscribe to refresh notifications.
    fn on_token_refresh(&self) -> broadcast::Receiver<Option<SecretString>>;

    /// Force a refresh cycle after the server rejected the current token.
    ///
    /// Returns the new token, or `None` if the session cannot be renewed.
    async fn refresh(&self) -> Result<Option<SecretString>> {
        Ok(self.token().filter(|_| self.is_token_valid()))
    }
}

/// The token currently in use and the user it was issued for.
#[derive(Clone)]
pub struct AuthContext {
    token: SecretString,
    issued_for: String,
}

impl AuthContext {
    #[must_use]
    pub fn new<T: Into<String>, U: Into<String>>(token: T, issued_for: U) -> Self {
        Self {
            token: SecretString::from(token.into()),
            issued_for: issued_for.into(),
        }
    }

    #[must_use]
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Identifier of the user the token belongs to.
    #[must_use]
    pub fn issued_for(&self) -> &str {
        &self.issued_for
    }

    /// Expiry taken from the token's JWT `exp` claim, if it has one.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        token_expiry(self.token.expose_secret())
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("token", &self.token)
            .field("issued_for", &self.issued_for)
            .finish()
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Read the `exp` claim of a JWT without verifying its signature.
///
/// Opaque (non-JWT) tokens and tokens without `exp` yield `None`.
#[must_use]
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

/// Async hook that obtains a fresh [`AuthContext`], typically by calling a refresh endpoint.
pub type Refresher = Arc<dyn Fn() -> BoxFuture<'static, Result<Option<AuthContext>>> + Send + Sync>;

/// In-memory [`TokenProvider`] for applications that manage tokens themselves.
///
/// [`MemoryTokenProvider::set_token`] and [`MemoryTokenProvider::clear`]
/// publish refresh notifications, so a connected session follows login,
/// token rotation and logout automatically.
pub struct MemoryTokenProvider {
    current: RwLock<Option<AuthContext>>,
    refreshes: broadcast::Sender<Option<SecretString>>,
    leeway: TimeDelta,
    refresher: Option<Refresher>,
}

impl Default for MemoryTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTokenProvider {
    #[must_use]
    pub fn new() -> Self {
        let (refreshes, _) = broadcast::channel(REFRESH_CHANNEL_CAPACITY);
        Self {
            current: RwLock::new(None),
            refreshes,
            leeway: DEFAULT_EXPIRY_LEEWAY,
            refresher: None,
        }
    }

    /// Start with a token already in place. No notification is published.
    #[must_use]
    pub fn with_context(context: AuthContext) -> Self {
        let provider = Self::new();
        *provider
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(context);
        provider
    }

    /// Treat tokens expiring within `leeway` as already expired.
    #[must_use]
    pub fn leeway(mut self, leeway: TimeDelta) -> Self {
        self.leeway = leeway;
        self
    }

    /// Install the hook used by [`TokenProvider::refresh`].
    #[must_use]
    pub fn refresher(mut self, refresher: Refresher) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Replace the token and notify subscribers.
    pub fn set_token(&self, context: AuthContext) {
        let token = context.token.clone();
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(context);
        // No receivers simply means nobody is connected yet.
        _ = self.refreshes.send(Some(token));
    }

    /// Drop the token and publish a logout notification.
    pub fn clear(&self) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        _ = self.refreshes.send(None);
    }

    #[must_use]
    pub fn context(&self) -> Option<AuthContext> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_valid_at(&self, context: &AuthContext, now: DateTime<Utc>) -> bool {
        if context.token.expose_secret().is_empty() {
            return false;
        }
        context
            .expires_at()
            .is_none_or(|expires_at| expires_at - self.leeway > now)
    }
}

#[async_trait]
impl TokenProvider for MemoryTokenProvider {
    fn token(&self) -> Option<SecretString> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|context| context.token.clone())
    }

    fn is_token_valid(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|context| self.is_valid_at(context, Utc::now()))
    }

    fn on_token_refresh(&self) -> broadcast::Receiver<Option<SecretString>> {
        self.refreshes.subscribe()
    }

    async fn refresh(&self) -> Result<Option<SecretString>> {
        let Some(refresher) = &self.refresher else {
            return Ok(self.token().filter(|_| self.is_token_valid()));
        };

        match refresher().await? {
            Some(context) => {
                let token = context.token.clone();
                self.set_token(context);
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }
}
