//! Self-signed trust root.
//!
//! Generates a trust anchor and issuer certificates chained to it. Used by
//! the controller's `bootstrap` command and by tests; production clusters
//! typically supply their own anchors and issuer.
//!
//! # Example
//!
//! ```
//! use mesh_identity::ca::TrustRoot;
//! use std::time::Duration;
//!
//! let root = TrustRoot::generate("root.linkerd.cluster.local", Duration::from_secs(3600)).unwrap();
//! let issuer = root
//!     .issue_issuer("identity.linkerd.cluster.local", Duration::from_secs(3600))
//!     .unwrap();
//! assert!(issuer.crt_pem().starts_with("-----BEGIN CERTIFICATE-----"));
//! ```

use crate::ca::IssuerCredentials;
use crate::certificate::{Certificate, TrustAnchors};
use crate::{Error, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use std::time::Duration;
use time::{Duration as TimeDuration, OffsetDateTime};

/// Backdating applied to generated CA certificates.
const BACKDATE: TimeDuration = TimeDuration::minutes(1);

/// A self-signed root CA.
pub struct TrustRoot {
    /// The root CA key pair.
    key: KeyPair,
    /// The root CA certificate parameters (needed for creating Issuer).
    params: CertificateParams,
    certificate: Certificate,
}

impl TrustRoot {
    /// Generates a P-256 root CA valid for `lifetime`.
    pub fn generate(common_name: &str, lifetime: Duration) -> Result<Self> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::CaSigning(format!("root key generation failed: {e}")))?;

        let mut params = ca_params(common_name, lifetime)?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let cert = params
            .clone()
            .self_signed(&key)
            .map_err(|e| Error::CaSigning(format!("root cert generation failed: {e}")))?;
        let certificate = Certificate::from_der(cert.der().to_vec())?;

        Ok(Self {
            key,
            params,
            certificate,
        })
    }

    /// Returns the root certificate.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Returns a trust anchor bundle containing only this root.
    pub fn trust_anchors(&self) -> Result<TrustAnchors> {
        TrustAnchors::new(vec![self.certificate.clone()])
    }

    /// Returns the PEM-encoded root private key.
    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Issues an issuer CA certificate named `name`, with a fresh key.
    ///
    /// The issuer may sign end-entity certificates only (path length 0).
    pub fn issue_issuer(&self, name: &str, lifetime: Duration) -> Result<IssuerBundle> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::CaSigning(format!("issuer key generation failed: {e}")))?;

        let mut params = ca_params(name, lifetime)?;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        let san = rcgen::string::Ia5String::try_from(name.to_string())
            .map_err(|e| Error::InvalidName(format!("{name}: {e}")))?;
        params.subject_alt_names = vec![SanType::DnsName(san)];

        let issuer = Issuer::from_params(&self.params, &self.key);
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| Error::CaSigning(format!("issuer cert generation failed: {e}")))?;

        Ok(IssuerBundle {
            key_pem: key.serialize_pem(),
            crt_pem: cert.pem(),
        })
    }
}

impl std::fmt::Debug for TrustRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustRoot")
            .field("key", &"[REDACTED]")
            .field("fingerprint", &self.certificate.fingerprint())
            .finish()
    }
}

fn ca_params(common_name: &str, lifetime: Duration) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| Error::CaSigning(format!("failed to create params: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let lifetime = i64::try_from(lifetime.as_secs())
        .map(TimeDuration::seconds)
        .map_err(|_| Error::InvalidValidity(format!("lifetime out of range: {lifetime:?}")))?;
    let now = OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now + lifetime;

    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    Ok(params)
}

/// A PEM issuer key and certificate, as written to an issuer directory.
#[derive(Clone)]
pub struct IssuerBundle {
    key_pem: String,
    crt_pem: String,
}

impl IssuerBundle {
    /// Returns the PKCS#8 PEM private key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Returns the PEM issuer certificate.
    pub fn crt_pem(&self) -> &str {
        &self.crt_pem
    }

    /// Parses the bundle into issuer credentials.
    pub fn into_credentials(self) -> Result<IssuerCredentials> {
        IssuerCredentials::from_pem(&self.key_pem, &self.crt_pem)
    }
}

impl std::fmt::Debug for IssuerBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerBundle")
            .field("key_pem", &"[REDACTED]")
            .finish()
    }
}
