//! The Certify protocol handler.
//!
//! Each request is handled independently:
//!
//! 1. Validate the bearer token and confirm it entitles the caller to the
//!    requested identity
//! 2. Parse the CSR, verify its signature and require it to name exactly
//!    the requested identity
//! 3. Sign a leaf certificate with the shared CA
//! 4. Return the leaf and the issuer chain (trust anchors excluded)
//!
//! The transport (gRPC) lives in the controller binary; this module only
//! deals in plain request and response values so that in-process clients
//! and tests can drive it directly.

use crate::ca::CertificateAuthority;
use crate::csr::CertificationRequest;
use crate::token::TokenValidator;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

/// A request for an identity certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct CertifyRequest {
    /// The requested identity name.
    pub identity: String,
    /// DER-encoded CSR.
    pub certificate_signing_request: Vec<u8>,
    /// Bearer token proving entitlement to `identity`.
    pub token: Vec<u8>,
}

impl std::fmt::Debug for CertifyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertifyRequest")
            .field("identity", &self.identity)
            .field("csr_len", &self.certificate_signing_request.len())
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// An issued leaf certificate and the chain needed to verify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertifyResponse {
    /// DER-encoded leaf certificate.
    pub leaf_certificate: Vec<u8>,
    /// DER-encoded intermediates, leaf's issuer first.
    pub intermediate_certificates: Vec<Vec<u8>>,
}

/// Anything that can answer Certify requests: the in-process service or a
/// remote client.
#[async_trait]
pub trait CertifyClient: Send + Sync {
    async fn certify(&self, request: CertifyRequest) -> Result<CertifyResponse>;
}

#[async_trait]
impl<T: CertifyClient + ?Sized> CertifyClient for Arc<T> {
    async fn certify(&self, request: CertifyRequest) -> Result<CertifyResponse> {
        (**self).certify(request).await
    }
}

/// Stateless Certify handler over a shared, read-only CA.
pub struct IdentityService<V> {
    validator: V,
    ca: Arc<CertificateAuthority>,
}

impl<V: TokenValidator> IdentityService<V> {
    pub fn new(validator: V, ca: Arc<CertificateAuthority>) -> Self {
        Self { validator, ca }
    }

    /// Handles one Certify request.
    pub async fn certify(&self, request: CertifyRequest) -> Result<CertifyResponse> {
        let CertifyRequest {
            identity,
            certificate_signing_request,
            token,
        } = request;

        if identity.is_empty() {
            return Err(Error::InvalidName("missing identity".to_string()));
        }
        if token.is_empty() {
            return Err(Error::TokenInvalid("missing token".to_string()));
        }
        if certificate_signing_request.is_empty() {
            return Err(Error::Csr("missing certificate signing request".to_string()));
        }

        let confirmed = match self.validator.validate(&token, &identity).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(identity = %identity, error = %e, "rejected certify request");
                return Err(e);
            }
        };
        if confirmed != identity {
            return Err(Error::IdentityMismatch {
                requested: identity,
                actual: confirmed,
            });
        }

        let csr = CertificationRequest::from_der(&certificate_signing_request)?;
        if let Err(e) = csr.ensure_identity(&identity) {
            warn!(identity = %identity, error = %e, "CSR does not match requested identity");
            return Err(e);
        }

        let leaf = self
            .ca
            .issue(&certificate_signing_request, &identity, OffsetDateTime::now_utc())?;

        info!(
            identity = %identity,
            fingerprint = %leaf.fingerprint(),
            expiry = %leaf.not_after()?,
            "certified identity"
        );

        Ok(CertifyResponse {
            leaf_certificate: leaf.der().to_vec(),
            intermediate_certificates: self
                .ca
                .intermediates()
                .iter()
                .map(|c| c.der().to_vec())
                .collect(),
        })
    }
}

#[async_trait]
impl<V: TokenValidator> CertifyClient for IdentityService<V> {
    async fn certify(&self, request: CertifyRequest) -> Result<CertifyResponse> {
        IdentityService::certify(self, request).await
    }
}
