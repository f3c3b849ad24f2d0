//! X.509 certificate handling for workload identities.
//!
//! Identity certificates carry the workload's identity name as both the
//! subject common name and the only DNS Subject Alternative Name. This module
//! wraps DER/PEM certificates and the trust anchor bundle used to verify them.

use crate::{Error, Result};
use rustls_pki_types::{CertificateDer, TrustAnchor};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use webpki::anchor_from_trusted_cert;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};

/// PEM label for certificates.
pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// An X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// DER-encoded certificate data.
    der: Vec<u8>,
    /// PEM representation (cached).
    pem: String,
}

impl Certificate {
    /// Creates a certificate from DER-encoded bytes.
    ///
    /// The bytes must parse as an X.509 certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        parse(&der)?;
        let pem = der_to_pem(&der, CERTIFICATE_LABEL);
        Ok(Self { der, pem })
    }

    /// Creates a certificate from a single PEM block.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let parsed = pem::parse(pem)
            .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
        if parsed.tag() != CERTIFICATE_LABEL {
            return Err(Error::Certificate(format!(
                "expected {CERTIFICATE_LABEL} PEM block, got {}",
                parsed.tag()
            )));
        }
        Self::from_der(parsed.into_contents())
    }

    /// Returns the DER-encoded certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    /// Borrows the certificate as a `CertificateDer`.
    pub fn as_cert_der(&self) -> CertificateDer<'_> {
        CertificateDer::from(self.der.as_slice())
    }

    /// Returns the certificate's not-before time.
    pub fn not_before(&self) -> Result<OffsetDateTime> {
        Ok(parse(&self.der)?.validity().not_before.to_datetime())
    }

    /// Returns the certificate's not-after (expiry) time.
    pub fn not_after(&self) -> Result<OffsetDateTime> {
        Ok(parse(&self.der)?.validity().not_after.to_datetime())
    }

    /// Returns the DNS names from the Subject Alternative Name extension.
    pub fn dns_names(&self) -> Result<Vec<String>> {
        Ok(dns_names(&parse(&self.der)?))
    }

    /// Returns the first subject common name, if any.
    pub fn common_name(&self) -> Result<Option<String>> {
        let cert = parse(&self.der)?;
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        Ok(cn)
    }

    /// Checks if this certificate is a CA certificate.
    pub fn is_ca(&self) -> Result<bool> {
        Ok(parse(&self.der)?.is_ca())
    }

    /// SHA-256 fingerprint of the DER encoding, lowercase hex.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }
}

/// The set of root certificates every chain must terminate in.
#[derive(Debug, Clone)]
pub struct TrustAnchors {
    roots: Vec<Certificate>,
}

impl TrustAnchors {
    /// Creates a bundle from root certificates. At least one is required.
    pub fn new(roots: Vec<Certificate>) -> Result<Self> {
        if roots.is_empty() {
            return Err(Error::Certificate("trust anchor bundle is empty".to_string()));
        }
        for root in &roots {
            anchor_from_trusted_cert(&root.as_cert_der())
                .map_err(|e| Error::Certificate(format!("invalid trust anchor: {e:?}")))?;
        }
        Ok(Self { roots })
    }

    /// Parses a PEM bundle of root certificates.
    pub fn from_pem(pem: &str) -> Result<Self> {
        Self::new(parse_pem_chain(pem)?)
    }

    /// Returns the root certificates.
    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    /// Returns true if `cert` is byte-identical to one of the anchors.
    pub fn contains(&self, cert: &Certificate) -> bool {
        self.roots.iter().any(|root| root.der() == cert.der())
    }

    /// Builds owned webpki trust anchors.
    pub fn webpki_anchors(&self) -> Result<Vec<TrustAnchor<'static>>> {
        self.roots
            .iter()
            .map(|cert| {
                anchor_from_trusted_cert(&cert.as_cert_der())
                    .map(|anchor| anchor.to_owned())
                    .map_err(|e| Error::Certificate(format!("failed to parse trust anchor: {e:?}")))
            })
            .collect()
    }

    /// Serializes the bundle as concatenated PEM.
    pub fn to_pem(&self) -> String {
        self.roots.iter().map(Certificate::to_pem).collect()
    }
}

/// Parses a PEM-encoded certificate chain, preserving order.
///
/// Non-certificate blocks are rejected.
pub fn parse_pem_chain(pem_str: &str) -> Result<Vec<Certificate>> {
    let blocks = pem::parse_many(pem_str)
        .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
    blocks
        .into_iter()
        .map(|block| {
            if block.tag() != CERTIFICATE_LABEL {
                return Err(Error::Certificate(format!(
                    "unexpected PEM block {} in certificate chain",
                    block.tag()
                )));
            }
            Certificate::from_der(block.into_contents())
        })
        .collect()
}

pub(crate) fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (rest, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
    if !rest.is_empty() {
        return Err(Error::Certificate(
            "trailing data after certificate".to_string(),
        ));
    }
    Ok(cert)
}

pub(crate) fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    names.push((*dns).to_string());
                }
            }
        }
    }
    names
}

/// Converts DER bytes to PEM format.
pub(crate) fn der_to_pem(der: &[u8], label: &str) -> String {
    pem::encode(&pem::Pem::new(label, der))
}
