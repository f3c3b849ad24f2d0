//! Workload identity issuance for the mesh.
//!
//! This crate implements both sides of the identity issuance protocol: the
//! certificate authority that signs short-lived identity certificates for
//! verified workloads, and the agent that runs beside each workload to
//! request, verify and rotate its certificate.
//!
//! # Components
//!
//! - [`trust_domain`] - Identity naming scheme
//! - [`validity`] - Clock-skew allowance and issuance lifetime
//! - [`certificate`] - X.509 certificates and trust anchors
//! - [`csr`] - Key and CSR generation, CSR inspection
//! - [`verifier`] - End-entity chain verification
//! - [`ca`] - Issuer credentials and leaf signing
//! - [`token`] - Bearer token validation
//! - [`service`] - The Certify protocol handler
//! - [`agent`] - End-entity directory and renewal loop
//! - [`shutdown`] - Signal driven cancellation

use std::path::PathBuf;
use std::time::Duration;

pub mod agent;
pub mod ca;
pub mod certificate;
pub mod csr;
pub mod service;
pub mod shutdown;
pub mod token;
pub mod trust_domain;
pub mod validity;
pub mod verifier;

pub use agent::{Agent, AgentConfig, IssuedCertificate};
pub use ca::{CertificateAuthority, IssuerCredentials, TrustRoot};
pub use certificate::{Certificate, TrustAnchors};
pub use csr::{CertSign, CertificationRequest, CsrOptions};
pub use service::{CertifyClient, CertifyRequest, CertifyResponse, IdentityService};
pub use token::{ServiceAccountValidator, StaticTokenReviewer, TokenReviewer, TokenValidator};
pub use trust_domain::TrustDomain;
pub use validity::Validity;

/// Errors that can occur in mesh-identity operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Identity name or trust domain component is malformed.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Validity policy is unusable.
    #[error("invalid validity policy: {0}")]
    InvalidValidity(String),

    /// Certificate or trust anchor parsing error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// CSR generation or parsing error.
    #[error("CSR error: {0}")]
    Csr(String),

    /// Issuer failed to sign a certificate.
    #[error("CA signing failed: {0}")]
    CaSigning(String),

    /// Issuer credentials do not verify against the trust anchors.
    #[error("issuer verification failed: {0}")]
    IssuerVerification(String),

    /// The bearer token was not accepted.
    #[error("token rejected: {0}")]
    TokenInvalid(String),

    /// The token review backend could not be reached.
    #[error("token review failed: {0}")]
    TokenReview(String),

    /// The confirmed identity does not match the requested one.
    #[error("identity mismatch: requested {requested}, got {actual}")]
    IdentityMismatch { requested: String, actual: String },

    /// An issued certificate failed verification.
    #[error("certificate verification failed: {0}")]
    VerificationFailed(String),

    /// End-entity material already exists in the agent directory.
    #[error("end-entity conflict: {} already exists", .0.display())]
    EndEntityConflict(PathBuf),

    /// The end-entity directory is missing or has unsafe permissions.
    #[error("invalid end-entity directory {}: {reason}", path.display())]
    EndEntityDir { path: PathBuf, reason: String },

    /// The Certify call failed.
    #[error("certify call failed: {0}")]
    Rpc(String),

    /// The Certify call did not complete in time.
    #[error("certify call timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for errors that reject a single request because the
    /// caller is not entitled to the identity it asked for.
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            Error::TokenInvalid(_) | Error::IdentityMismatch { .. }
        )
    }

    /// Returns true for errors a client should retry on its normal schedule.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::Timeout(_) | Error::TokenReview(_) | Error::VerificationFailed(_)
        )
    }
}

/// Result type for mesh-identity operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<Error> {
        vec![
            Error::InvalidName("x".into()),
            Error::InvalidValidity("x".into()),
            Error::Certificate("x".into()),
            Error::Csr("x".into()),
            Error::CaSigning("x".into()),
            Error::IssuerVerification("x".into()),
            Error::TokenInvalid("x".into()),
            Error::TokenReview("x".into()),
            Error::IdentityMismatch {
                requested: "a".into(),
                actual: "b".into(),
            },
            Error::VerificationFailed("x".into()),
            Error::EndEntityConflict(PathBuf::from("/ee/key")),
            Error::EndEntityDir {
                path: PathBuf::from("/ee"),
                reason: "x".into(),
            },
            Error::Rpc("x".into()),
            Error::Timeout(Duration::from_secs(30)),
            Error::Io(std::io::Error::other("x")),
        ]
    }

    #[test]
    fn test_error_classification() {
        for err in all_variants() {
            let authorization = matches!(
                err,
                Error::TokenInvalid(_) | Error::IdentityMismatch { .. }
            );
            let transient = matches!(
                err,
                Error::Rpc(_) | Error::Timeout(_) | Error::TokenReview(_) | Error::VerificationFailed(_)
            );
            assert_eq!(err.is_authorization(), authorization, "{err}");
            assert_eq!(err.is_transient(), transient, "{err}");
            assert!(!(err.is_authorization() && err.is_transient()), "{err}");
        }
    }

    #[test]
    fn test_startup_errors_are_fatal() {
        let fatal = [
            Error::IssuerVerification("x".into()),
            Error::EndEntityConflict(PathBuf::from("/ee/crt.pem")),
            Error::EndEntityDir {
                path: PathBuf::from("/ee"),
                reason: "mode 0755".into(),
            },
            Error::InvalidName("x".into()),
        ];
        for err in fatal {
            assert!(!err.is_authorization() && !err.is_transient(), "{err}");
        }
    }
}
