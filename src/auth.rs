//! Admission control: token sources on the client, a decision hook on the
//! server.
//!
//! The hub does not mint or verify tokens. Clients hand it something that
//! yields a token string — a value, a closure, or an async producer — and
//! the server hands it an [`Authenticator`] that turns (document, token)
//! into an allow/deny decision. Everything in between is pass-through.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

/// Scope granted with an allowed attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScope {
    /// Read and submit updates.
    Write,
    /// Receive updates only; submitted updates are dropped.
    ReadOnly,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow(AuthScope),
    Deny(String),
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow(_))
    }
}

/// Server-side admission hook, called once per (connection, document).
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Decide admission for `doc`. `token` is `None` when the client opened
    /// with a sync request and never sent an `Auth` frame.
    async fn authenticate(&self, doc: &str, token: Option<&str>) -> AuthDecision;
}

/// The default policy: everyone may write to everything.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _doc: &str, _token: Option<&str>) -> AuthDecision {
        AuthDecision::Allow(AuthScope::Write)
    }
}

/// Producer of an eventual token string.
pub type AsyncTokenFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, TokenError>> + Send + Sync>;

/// Failure of a token producer. Treated as "no token available": the
/// provider proceeds without sending one and the server policy decides.
#[derive(Debug, Clone)]
pub struct TokenError(pub String);

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token producer failed: {}", self.0)
    }
}

impl std::error::Error for TokenError {}

/// Where the client's token comes from.
#[derive(Clone, Default)]
pub enum AuthToken {
    /// No token; the provider opens with a bare sync request.
    #[default]
    None,
    /// A fixed token string.
    Static(String),
    /// A synchronous producer invoked on every (re)connect.
    Sync(Arc<dyn Fn() -> Result<String, TokenError> + Send + Sync>),
    /// An asynchronous producer invoked on every (re)connect.
    Async(AsyncTokenFn),
}

impl AuthToken {
    /// Resolve the token. Producer failure is logged and collapses to
    /// `None` — admission then rests on server policy.
    pub async fn resolve(&self) -> Option<String> {
        match self {
            AuthToken::None => None,
            AuthToken::Static(token) => Some(token.clone()),
            AuthToken::Sync(producer) => match producer() {
                Ok(token) => Some(token),
                Err(e) => {
                    log::warn!("auth token producer failed: {e}");
                    None
                }
            },
            AuthToken::Async(producer) => match producer().await {
                Ok(token) => Some(token),
                Err(e) => {
                    log::warn!("auth token producer failed: {e}");
                    None
                }
            },
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthToken::None => write!(f, "AuthToken::None"),
            AuthToken::Static(_) => write!(f, "AuthToken::Static(..)"),
            AuthToken::Sync(_) => write!(f, "AuthToken::Sync(..)"),
            AuthToken::Async(_) => write!(f, "AuthToken::Async(..)"),
        }
    }
}

impl From<&str> for AuthToken {
    fn from(token: &str) -> Self {
        AuthToken::Static(token.to_owned())
    }
}

impl From<String> for AuthToken {
    fn from(token: String) -> Self {
        AuthToken::Static(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        let auth = AllowAll;
        assert_eq!(
            auth.authenticate("doc", None).await,
            AuthDecision::Allow(AuthScope::Write)
        );
        assert!(auth.authenticate("doc", Some("anything")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_static_token() {
        let token = AuthToken::from("secret");
        assert_eq!(token.resolve().await.as_deref(), Some("secret"));
        assert_eq!(AuthToken::None.resolve().await, None);
    }

    #[tokio::test]
    async fn test_sync_producer() {
        let token = AuthToken::Sync(Arc::new(|| Ok("minted".to_owned())));
        assert_eq!(token.resolve().await.as_deref(), Some("minted"));

        let failing = AuthToken::Sync(Arc::new(|| Err(TokenError("boom".into()))));
        assert_eq!(failing.resolve().await, None);
    }

    #[tokio::test]
    async fn test_async_producer() {
        let token = AuthToken::Async(Arc::new(|| {
            Box::pin(async { Ok("eventual".to_owned()) })
        }));
        assert_eq!(token.resolve().await.as_deref(), Some("eventual"));

        let failing: AuthToken = AuthToken::Async(Arc::new(|| {
            Box::pin(async { Err(TokenError("offline".into())) })
        }));
        assert_eq!(failing.resolve().await, None);
    }

    #[tokio::test]
    async fn test_custom_authenticator() {
        struct TokenGate;

        #[async_trait]
        impl Authenticator for TokenGate {
            async fn authenticate(&self, doc: &str, token: Option<&str>) -> AuthDecision {
                match token {
                    Some(t) if t == format!("key-{doc}") => {
                        AuthDecision::Allow(AuthScope::Write)
                    }
                    Some(_) => AuthDecision::Deny("wrong key".into()),
                    None => AuthDecision::Deny("token required".into()),
                }
            }
        }

        let gate = TokenGate;
        assert!(gate.authenticate("d", Some("key-d")).await.is_allowed());
        assert!(!gate.authenticate("d", Some("key-x")).await.is_allowed());
        assert!(!gate.authenticate("d", None).await.is_allowed());
    }
}
