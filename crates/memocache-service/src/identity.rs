//! Resolving callers to the identity their cached resources are keyed by.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// The identity a cache entry belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserId(Arc<str>);

impl UserId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The opaque session credential a request was made with.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are credentials, keep them out of logs.
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// Looks up who a session belongs to.
#[async_trait]
pub trait IdentityProvider: Send + Sync + fmt::Debug {
    /// Returns the identity behind `session`, or `None` if the session is not authenticated.
    async fn identify(&self, session: &SessionToken) -> Option<UserId>;
}

/// An [`IdentityProvider`] backed by a fixed map of sessions, for local setups and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentities {
    sessions: HashMap<SessionToken, UserId>,
}

impl StaticIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider that knows all of the given `(session, user)` pairs.
    pub fn from_sessions<I, S, U>(sessions: I) -> Self
    where
        I: IntoIterator<Item = (S, U)>,
        S: Into<String>,
        U: AsRef<str>,
    {
        sessions
            .into_iter()
            .fold(Self::new(), |identities, (session, user)| {
                identities.with_session(session, user)
            })
    }

    /// Registers `session` as belonging to `user`.
    pub fn with_session(mut self, session: impl Into<String>, user: impl AsRef<str>) -> Self {
        self.sessions
            .insert(SessionToken::new(session), UserId::new(user));
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentities {
    async fn identify(&self, session: &SessionToken) -> Option<UserId> {
        self.sessions.get(session).cloned()
    }
}
