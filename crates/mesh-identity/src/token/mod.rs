//! Bearer token validation.
//!
//! A [`TokenValidator`] maps the token presented with a Certify request to the
//! identity name its bearer is entitled to. The provided
//! [`ServiceAccountValidator`] delegates authentication to a
//! [`TokenReviewer`] (the Kubernetes TokenReview API in production) and maps
//! the reviewed service account through the [`TrustDomain`].

#[cfg(feature = "kube")]
mod review;

#[cfg(feature = "kube")]
pub use review::KubeTokenReviewer;

use crate::trust_domain::TrustDomain;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

/// Username prefix Kubernetes assigns to service account tokens.
pub const SERVICE_ACCOUNT_USER_PREFIX: &str = "system:serviceaccount:";

/// Validates a bearer token against a requested identity.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns the confirmed identity name for `token`.
    ///
    /// Fails with [`Error::TokenInvalid`] if the token is not accepted, and
    /// with [`Error::IdentityMismatch`] if it is valid for another identity.
    async fn validate(&self, token: &[u8], requested: &str) -> Result<String>;
}

/// The authenticated subject of a reviewed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewedUser {
    pub username: String,
}

/// Authenticates a token with an external identity provider.
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    /// Returns the authenticated user, [`Error::TokenInvalid`] if the
    /// provider rejects the token, or [`Error::TokenReview`] if the provider
    /// could not be consulted.
    async fn review(&self, token: &str) -> Result<ReviewedUser>;
}

/// Validates service account tokens through a [`TokenReviewer`].
#[derive(Debug, Clone)]
pub struct ServiceAccountValidator<R> {
    reviewer: R,
    trust_domain: TrustDomain,
}

impl<R: TokenReviewer> ServiceAccountValidator<R> {
    pub fn new(reviewer: R, trust_domain: TrustDomain) -> Self {
        Self {
            reviewer,
            trust_domain,
        }
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Maps `system:serviceaccount:<ns>:<sa>` to its identity name.
    fn identity_for(&self, username: &str) -> Result<String> {
        let rest = username
            .strip_prefix(SERVICE_ACCOUNT_USER_PREFIX)
            .ok_or_else(|| {
                Error::TokenInvalid(format!("{username} is not a service account"))
            })?;
        let (namespace, service_account) = rest.split_once(':').ok_or_else(|| {
            Error::TokenInvalid(format!("malformed service account username: {username}"))
        })?;
        self.trust_domain
            .service_account_identity(service_account, namespace)
            .map_err(|e| Error::TokenInvalid(format!("unusable service account {username}: {e}")))
    }
}

#[async_trait]
impl<R: TokenReviewer> TokenValidator for ServiceAccountValidator<R> {
    async fn validate(&self, token: &[u8], requested: &str) -> Result<String> {
        let token = std::str::from_utf8(token)
            .map_err(|_| Error::TokenInvalid("token is not valid UTF-8".to_string()))?
            .trim();
        if token.is_empty() {
            return Err(Error::TokenInvalid("empty token".to_string()));
        }

        let user = self.reviewer.review(token).await?;
        let actual = self.identity_for(&user.username)?;
        if actual != requested {
            return Err(Error::IdentityMismatch {
                requested: requested.to_string(),
                actual,
            });
        }

        debug!(identity = %actual, "token validated");
        Ok(actual)
    }
}

/// An in-memory reviewer mapping fixed tokens to usernames.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenReviewer {
    users: HashMap<String, String>,
}

impl StaticTokenReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `token` as `username`.
    pub fn with_user(mut self, token: impl Into<String>, username: impl Into<String>) -> Self {
        self.users.insert(token.into(), username.into());
        self
    }

    /// Accepts `token` as the service account `namespace/service_account`.
    pub fn with_service_account(
        self,
        token: impl Into<String>,
        namespace: &str,
        service_account: &str,
    ) -> Self {
        self.with_user(
            token,
            format!("{SERVICE_ACCOUNT_USER_PREFIX}{namespace}:{service_account}"),
        )
    }
}

#[async_trait]
impl TokenReviewer for StaticTokenReviewer {
    async fn review(&self, token: &str) -> Result<ReviewedUser> {
        self.users
            .get(token)
            .map(|username| ReviewedUser {
                username: username.clone(),
            })
            .ok_or_else(|| Error::TokenInvalid("token not recognized".to_string()))
    }
}
