//! The identity agent.
//!
//! Runs beside a workload and keeps a valid identity certificate in its
//! end-entity directory:
//!
//! 1. At startup, validate the directory, read the bearer token, then
//!    generate a key and CSR and write both. Any failure here is fatal.
//! 2. In a loop, re-read the token, call Certify, verify the response
//!    against the trust anchors and write `crt.pem`.
//! 3. Sleep for 80% of the remaining validity (clamped), or until the
//!    shutdown token is cancelled.
//!
//! Failed attempts never discard the certificate already held.
//!
//! # Example
//!
//! ```ignore
//! let agent = Agent::start(config, client).await?;
//! agent.run(shutdown).await;
//! ```

mod end_entity;
mod refresh;

pub use end_entity::{EndEntityDir, CRT_FILE, CSR_FILE, KEY_FILE};
pub use refresh::{refresh_interval, MAX_REFRESH, MIN_REFRESH};

use crate::certificate::{self, Certificate, TrustAnchors};
use crate::csr::{CertificationRequest, CsrOptions};
use crate::service::{CertifyClient, CertifyRequest};
use crate::verifier::verify_end_entity;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument, Span};

/// Default deadline for a single Certify call.
pub const DEFAULT_CERTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// The identity name to request.
    pub name: String,
    /// File holding the bearer token; re-read on every attempt.
    pub token_path: PathBuf,
    /// The end-entity directory.
    pub dir: PathBuf,
    pub trust_anchors: TrustAnchors,
    /// Deadline for each Certify call.
    pub certify_timeout: Duration,
}

/// A verified certificate held by the agent.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub leaf: Certificate,
    pub intermediates: Vec<Certificate>,
    pub expiry: OffsetDateTime,
}

impl IssuedCertificate {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expiry
    }
}

/// Requests and rotates the workload's identity certificate.
pub struct Agent<C> {
    name: String,
    token_path: PathBuf,
    trust_anchors: TrustAnchors,
    certify_timeout: Duration,
    client: C,
    dir: EndEntityDir,
    csr_der: Vec<u8>,
    public_key_der: Vec<u8>,
    token: Vec<u8>,
    current: Option<IssuedCertificate>,
    span: Span,
}

impl<C: CertifyClient> Agent<C> {
    /// Prepares the end-entity directory and key material.
    pub async fn start(config: AgentConfig, client: C) -> Result<Self> {
        let AgentConfig {
            name,
            token_path,
            dir,
            trust_anchors,
            certify_timeout,
        } = config;

        let dir = EndEntityDir::check(dir)?;

        // Read before anything is written so a missing token leaves the
        // directory reusable.
        let token = tokio::fs::read(&token_path).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read token {}: {e}", token_path.display()),
            ))
        })?;

        let cert_sign = CsrOptions::new(name.clone()).generate()?;
        dir.write_key(cert_sign.private_key_der())?;
        dir.write_csr(cert_sign.csr_der())?;
        let public_key_der = CertificationRequest::from_der(cert_sign.csr_der())?
            .public_key_der()
            .to_vec();

        let span = info_span!("identity", id = %name);
        span.in_scope(|| info!(dir = %dir.path().display(), "generated key and CSR"));

        Ok(Self {
            name,
            token_path,
            trust_anchors,
            certify_timeout,
            client,
            dir,
            csr_der: cert_sign.csr_der().to_vec(),
            public_key_der,
            token,
            current: None,
            span,
        })
    }

    /// The identity name this agent requests.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn end_entity_dir(&self) -> &EndEntityDir {
        &self.dir
    }

    /// The most recently verified certificate, if any.
    pub fn current(&self) -> Option<&IssuedCertificate> {
        self.current.as_ref()
    }

    /// Renews until `shutdown` is cancelled.
    ///
    /// Cancellation interrupts the sleep between attempts; a Certify call
    /// already in flight completes first.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let span = self.span.clone();
        async move {
            loop {
                if shutdown.is_cancelled() {
                    info!("shutting down");
                    return;
                }

                let refresh = self.renew().await;

                tokio::select! {
                    _ = tokio::time::sleep(refresh) => {}
                    _ = shutdown.cancelled() => {
                        info!("shutting down");
                        return;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Makes one renewal attempt and returns the delay before the next.
    pub async fn renew(&mut self) -> Duration {
        self.reload_token().await;

        match self.certify().await {
            Ok(issued) => self.current = Some(issued),
            Err(e) if e.is_authorization() => warn!(error = %e, "certify request rejected"),
            Err(e) if e.is_transient() => warn!(error = %e, "failed to renew certificate, will retry"),
            Err(e) => error!(error = %e, "failed to renew certificate"),
        }

        let now = OffsetDateTime::now_utc();
        match &self.current {
            Some(issued) if issued.is_expired(now) => {
                warn!(
                    fingerprint = %issued.leaf.fingerprint(),
                    expiry = %issued.expiry,
                    refresh_in = ?MIN_REFRESH,
                    "held certificate has expired"
                );
                MIN_REFRESH
            }
            Some(issued) => {
                let refresh = refresh_interval(issued.expiry, now);
                info!(
                    fingerprint = %issued.leaf.fingerprint(),
                    expiry = %issued.expiry,
                    refresh_in = ?refresh,
                    "holding certificate"
                );
                refresh
            }
            None => {
                info!(refresh_in = ?MIN_REFRESH, "no certificate");
                MIN_REFRESH
            }
        }
    }

    async fn reload_token(&mut self) {
        match tokio::fs::read(&self.token_path).await {
            Ok(token) => self.token = token,
            Err(e) => warn!(
                path = %self.token_path.display(),
                error = %e,
                "failed to re-read token, reusing previous"
            ),
        }
    }

    async fn certify(&self) -> Result<IssuedCertificate> {
        let request = CertifyRequest {
            identity: self.name.clone(),
            certificate_signing_request: self.csr_der.clone(),
            token: self.token.clone(),
        };

        let rsp = tokio::time::timeout(self.certify_timeout, self.client.certify(request))
            .await
            .map_err(|_| Error::Timeout(self.certify_timeout))??;

        if rsp.leaf_certificate.is_empty() {
            return Err(Error::VerificationFailed(
                "response carries no leaf certificate".to_string(),
            ));
        }
        let leaf = Certificate::from_der(rsp.leaf_certificate)
            .map_err(|e| Error::VerificationFailed(format!("invalid leaf: {e}")))?;
        let intermediates = rsp
            .intermediate_certificates
            .into_iter()
            .map(|der| {
                Certificate::from_der(der)
                    .map_err(|e| Error::VerificationFailed(format!("invalid intermediate: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let now = OffsetDateTime::now_utc();
        verify_end_entity(&leaf, &intermediates, &self.trust_anchors, &self.name, now)?;

        let parsed = certificate::parse(leaf.der())?;
        if parsed.public_key().raw != self.public_key_der.as_slice() {
            return Err(Error::VerificationFailed(
                "certificate does not bind the agent's key".to_string(),
            ));
        }
        let expiry = leaf.not_after()?;

        self.dir.write_certificate(&leaf).await?;

        Ok(IssuedCertificate {
            leaf,
            intermediates,
            expiry,
        })
    }
}

impl<C> std::fmt::Debug for Agent<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("token", &"[REDACTED]")
            .field("current", &self.current.as_ref().map(|c| c.expiry))
            .finish()
    }
}
