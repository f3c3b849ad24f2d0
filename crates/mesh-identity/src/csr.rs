//! Certificate Signing Request (CSR) generation and inspection.
//!
//! Agents generate a P-256 ECDSA key and a CSR naming their identity as both
//! subject common name and DNS Subject Alternative Name. The identity service
//! parses incoming CSRs with [`CertificationRequest`], which verifies the
//! self-signature and exposes the requested names.
//!
//! # Example
//!
//! ```
//! use mesh_identity::{CertificationRequest, CsrOptions};
//!
//! let name = "web.default.serviceaccount.identity.linkerd.cluster.local";
//! let cert_sign = CsrOptions::new(name).generate().unwrap();
//!
//! let csr = CertificationRequest::from_der(cert_sign.csr_der()).unwrap();
//! csr.ensure_identity(name).unwrap();
//! ```

use crate::{Error, Result};
use rcgen::{KeyPair, SanType};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

/// Options for generating a Certificate Signing Request.
#[derive(Debug, Clone)]
pub struct CsrOptions {
    /// The identity name, used as DNS SAN and common name.
    name: String,
}

impl CsrOptions {
    /// Creates CSR options for the given identity name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Generates a fresh P-256 key and a CSR signed with it.
    pub fn generate(&self) -> Result<CertSign> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Csr(format!("key generation failed: {e}")))?;

        let mut params = rcgen::CertificateParams::new(vec![])
            .map_err(|e| Error::Csr(format!("failed to create params: {e}")))?;

        let san = rcgen::string::Ia5String::try_from(self.name.clone())
            .map_err(|e| Error::Csr(format!("invalid DNS name {}: {e}", self.name)))?;
        params.subject_alt_names = vec![SanType::DnsName(san)];

        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, self.name.clone());
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::Csr(format!("CSR serialization failed: {e}")))?;

        Ok(CertSign {
            csr_der: csr.der().to_vec(),
            private_key_der: key_pair.serialize_der(),
        })
    }
}

/// A CSR and its private key, both DER encoded.
#[derive(Clone)]
pub struct CertSign {
    csr_der: Vec<u8>,
    /// PKCS#8 private key.
    private_key_der: Vec<u8>,
}

impl CertSign {
    /// Returns the DER-encoded CSR.
    pub fn csr_der(&self) -> &[u8] {
        &self.csr_der
    }

    /// Returns the PKCS#8 DER-encoded private key.
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }
}

impl std::fmt::Debug for CertSign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertSign")
            .field("csr_der", &format_args!("{} bytes", self.csr_der.len()))
            .field("private_key_der", &"[REDACTED]")
            .finish()
    }
}

/// A parsed CSR whose self-signature has been verified.
#[derive(Debug, Clone)]
pub struct CertificationRequest {
    dns_names: Vec<String>,
    common_name: Option<String>,
    public_key_der: Vec<u8>,
}

impl CertificationRequest {
    /// Parses a DER-encoded CSR and verifies its signature.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (rest, csr) = X509CertificationRequest::from_der(der)
            .map_err(|e| Error::Csr(format!("failed to parse CSR: {e}")))?;
        if !rest.is_empty() {
            return Err(Error::Csr("trailing data after CSR".to_string()));
        }
        csr.verify_signature()
            .map_err(|e| Error::Csr(format!("CSR signature invalid: {e}")))?;

        let mut dns_names = Vec::new();
        if let Some(extensions) = csr.requested_extensions() {
            for ext in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = ext {
                    for name in &san.general_names {
                        if let GeneralName::DNSName(dns) = name {
                            dns_names.push((*dns).to_string());
                        }
                    }
                }
            }
        }

        let info = &csr.certification_request_info;
        let common_name = info
            .subject
            .iter_common_name()
            .next()
            .map(|cn| {
                cn.as_str()
                    .map(str::to_string)
                    .map_err(|e| Error::Csr(format!("invalid common name: {e}")))
            })
            .transpose()?;

        Ok(Self {
            dns_names,
            common_name,
            public_key_der: info.subject_pki.raw.to_vec(),
        })
    }

    /// DNS names requested in the subjectAltName extension.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// DER-encoded SubjectPublicKeyInfo of the requesting key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Requires the CSR to name exactly `name`: the DNS SAN set must be
    /// `{name}` and the common name, when present, must equal it.
    pub fn ensure_identity(&self, name: &str) -> Result<()> {
        let mismatch = |actual: String| Error::IdentityMismatch {
            requested: name.to_string(),
            actual,
        };

        if self.dns_names.is_empty() || self.dns_names.iter().any(|n| n != name) {
            return Err(mismatch(format!("DNS SANs {:?}", self.dns_names)));
        }
        if let Some(cn) = &self.common_name {
            if cn != name {
                return Err(mismatch(format!("CN {cn}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::PublicKeyData;

    const NAME: &str = "web.default.serviceaccount.identity.linkerd.cluster.local";

    #[test]
    fn test_generate_csr() {
        let cert_sign = CsrOptions::new(NAME).generate().unwrap();

        // DER-encoded CSRs and PKCS#8 keys start with SEQUENCE tag (0x30)
        assert_eq!(cert_sign.csr_der()[0], 0x30);
        assert_eq!(cert_sign.private_key_der()[0], 0x30);

        let csr = CertificationRequest::from_der(cert_sign.csr_der()).unwrap();
        assert_eq!(csr.dns_names(), &[NAME.to_string()]);
        assert_eq!(csr.common_name(), Some(NAME));
        csr.ensure_identity(NAME).unwrap();
    }

    #[test]
    fn test_public_key_matches_private_key() {
        let cert_sign = CsrOptions::new(NAME).generate().unwrap();
        let csr = CertificationRequest::from_der(cert_sign.csr_der()).unwrap();

        let key = KeyPair::try_from(cert_sign.private_key_der()).unwrap();
        assert_eq!(csr.public_key_der(), key.subject_public_key_info().as_slice());
    }

    #[test]
    fn test_ensure_identity_rejects_other_name() {
        let cert_sign = CsrOptions::new(NAME).generate().unwrap();
        let csr = CertificationRequest::from_der(cert_sign.csr_der()).unwrap();

        let other = "api.default.serviceaccount.identity.linkerd.cluster.local";
        assert!(matches!(
            csr.ensure_identity(other),
            Err(Error::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_ensure_identity_rejects_extra_sans() {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = rcgen::CertificateParams::new(vec![
            NAME.to_string(),
            "admin.kube-system.serviceaccount.identity.linkerd.cluster.local".to_string(),
        ])
        .unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let der = params.serialize_request(&key_pair).unwrap().der().to_vec();

        let csr = CertificationRequest::from_der(&der).unwrap();
        assert!(csr.common_name().is_none());
        assert!(matches!(
            csr.ensure_identity(NAME),
            Err(Error::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_tampered_csr() {
        let cert_sign = CsrOptions::new(NAME).generate().unwrap();
        let mut der = cert_sign.csr_der().to_vec();
        // Flip a byte inside the signature at the tail.
        let last = der.len() - 1;
        der[last] ^= 0xff;

        assert!(CertificationRequest::from_der(&der).is_err());
        assert!(CertificationRequest::from_der(b"not a csr").is_err());
    }

    #[test]
    fn test_rejects_invalid_name() {
        assert!(CsrOptions::new("wéb.default").generate().is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let cert_sign = CsrOptions::new(NAME).generate().unwrap();
        let debug = format!("{cert_sign:?}");
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_multiple_generations_unique() {
        let options = CsrOptions::new(NAME);
        let a = options.generate().unwrap();
        let b = options.generate().unwrap();
        assert_ne!(a.private_key_der(), b.private_key_der());
    }
}
