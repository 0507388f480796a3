//! Request extractor for the authenticated user.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, Cookie, HeaderMapExt};

use super::{AuthConfig, AuthError, SessionLookup, UserIdentity};

/// Shared authentication state.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    lookup: Arc<dyn SessionLookup>,
}

impl AuthState {
    pub fn new(config: AuthConfig, lookup: Arc<dyn SessionLookup>) -> Self {
        Self {
            config: Arc::new(config),
            lookup,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.config.origin_allowed(origin)
    }

    /// Resolve the user behind a request, preferring the session cookie over
    /// a bearer token.
    pub async fn authenticate(&self, parts: &Parts) -> Result<UserIdentity, AuthError> {
        let token = self
            .token_from_parts(parts)
            .ok_or(AuthError::MissingCredentials)?;

        self.lookup
            .user_from_token(&token)
            .await?
            .ok_or(AuthError::InvalidSession)
    }

    fn token_from_parts(&self, parts: &Parts) -> Option<String> {
        if let Some(cookie) = parts.headers.typed_get::<Cookie>() {
            if let Some(value) = cookie.get(&self.config.cookie_name) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }

        parts
            .headers
            .typed_get::<Authorization<Bearer>>()
            .map(|auth| auth.token().to_string())
            .filter(|token| !token.is_empty())
    }
}

/// The authenticated user, extracted from the session cookie or bearer token.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserIdentity);

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn nickname(&self) -> &str {
        &self.0.nickname
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
    AuthState: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthState::from_ref(state);
        auth.authenticate(parts).await.map(CurrentUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::http::{Request, header};

    struct FixedLookup;

    #[async_trait]
    impl SessionLookup for FixedLookup {
        async fn user_from_token(&self, token: &str) -> Result<Option<UserIdentity>> {
            Ok((token == "good").then(|| UserIdentity {
                id: "u1".to_string(),
                nickname: "alice".to_string(),
            }))
        }
    }

    fn state() -> AuthState {
        AuthState::new(AuthConfig::default(), Arc::new(FixedLookup))
    }

    fn parts(name: header::HeaderName, value: &str) -> Parts {
        let (parts, _) = Request::builder()
            .header(name, value)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[tokio::test]
    async fn cookie_token_is_accepted() {
        let parts = parts(header::COOKIE, "theme=dark; session_id=good");
        let user = state().authenticate(&parts).await.unwrap();
        assert_eq!(user.id, "u1");
    }

    #[tokio::test]
    async fn bearer_token_is_accepted() {
        let parts = parts(header::AUTHORIZATION, "Bearer good");
        assert!(state().authenticate(&parts).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let parts = parts(header::COOKIE, "session_id=bad");
        assert!(matches!(
            state().authenticate(&parts).await,
            Err(AuthError::InvalidSession)
        ));
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let parts = parts(header::ACCEPT, "*/*");
        assert!(matches!(
            state().authenticate(&parts).await,
            Err(AuthError::MissingCredentials)
        ));
    }
}
