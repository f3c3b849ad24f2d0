//! Kubernetes TokenReview backed reviewer.
//!
//! Validates service account tokens by submitting them to the TokenReview
//! API. The authenticated username has the form
//! `system:serviceaccount:{namespace}:{name}`.

use crate::token::{ReviewedUser, TokenReviewer};
use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::path::Path;
use tracing::debug;

/// Token reviewer using the Kubernetes TokenReview API.
#[derive(Clone)]
pub struct KubeTokenReviewer {
    client: Client,
    /// Optional audiences the token must be valid for.
    audiences: Option<Vec<String>>,
}

impl KubeTokenReviewer {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            audiences: None,
        }
    }

    /// Requires reviewed tokens to be valid for one of `audiences`.
    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = (!audiences.is_empty()).then_some(audiences);
        self
    }

    /// Connects using an explicit kubeconfig, or the in-cluster / default
    /// configuration when `kubeconfig` is `None`.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::TokenReview(format!("failed to read kubeconfig {}: {e}", path.display()))
                })?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| Error::TokenReview(format!("invalid kubeconfig: {e}")))?;
                Client::try_from(config)
                    .map_err(|e| Error::TokenReview(format!("failed to build client: {e}")))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| Error::TokenReview(format!("failed to build client: {e}")))?,
        };
        Ok(Self::new(client))
    }
}

impl std::fmt::Debug for KubeTokenReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeTokenReviewer")
            .field("audiences", &self.audiences)
            .finish()
    }
}

#[async_trait]
impl TokenReviewer for KubeTokenReviewer {
    async fn review(&self, token: &str) -> Result<ReviewedUser> {
        let api: Api<TokenReview> = Api::all(self.client.clone());

        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audiences.clone(),
            },
            status: None,
        };

        let result = api
            .create(&Default::default(), &review)
            .await
            .map_err(|e| Error::TokenReview(format!("TokenReview API error: {e}")))?;

        let status = result
            .status
            .ok_or_else(|| Error::TokenReview("TokenReview returned no status".to_string()))?;

        reviewed_user(&status)
    }
}

/// Extracts the authenticated user from a TokenReview status.
fn reviewed_user(status: &TokenReviewStatus) -> Result<ReviewedUser> {
    if !status.authenticated.unwrap_or(false) {
        let reason = status
            .error
            .as_deref()
            .unwrap_or("token authentication failed");
        return Err(Error::TokenInvalid(reason.to_string()));
    }

    let username = status
        .user
        .as_ref()
        .and_then(|user| user.username.clone())
        .ok_or_else(|| Error::TokenInvalid("TokenReview returned no username".to_string()))?;

    debug!(username = %username, "TokenReview authenticated token");
    Ok(ReviewedUser { username })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::authentication::v1::UserInfo;

    fn status(authenticated: Option<bool>, username: Option<&str>) -> TokenReviewStatus {
        TokenReviewStatus {
            authenticated,
            user: Some(UserInfo {
                username: username.map(str::to_string),
                groups: Some(vec!["system:serviceaccounts".to_string()]),
                uid: None,
                extra: None,
            }),
            error: None,
            audiences: None,
        }
    }

    #[test]
    fn test_reviewed_user_authenticated() {
        let user = reviewed_user(&status(Some(true), Some("system:serviceaccount:default:web")))
            .unwrap();
        assert_eq!(user.username, "system:serviceaccount:default:web");
    }

    #[test]
    fn test_reviewed_user_unauthenticated() {
        let mut s = status(Some(false), None);
        s.error = Some("token expired".to_string());
        match reviewed_user(&s) {
            Err(Error::TokenInvalid(msg)) => assert_eq!(msg, "token expired"),
            other => panic!("expected TokenInvalid, got {other:?}"),
        }
        assert!(matches!(
            reviewed_user(&status(None, Some("system:serviceaccount:default:web"))),
            Err(Error::TokenInvalid(_))
        ));
    }

    #[test]
    fn test_reviewed_user_missing_username() {
        assert!(matches!(
            reviewed_user(&status(Some(true), None)),
            Err(Error::TokenInvalid(_))
        ));
    }
}
