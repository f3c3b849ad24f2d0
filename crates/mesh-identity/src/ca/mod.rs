//! Certificate Authority (CA) for workload identities.
//!
//! The identity service signs every leaf with a single issuer: an
//! intermediate CA whose certificate chains to the cluster's trust anchors.
//!
//! - [`IssuerCredentials`] - Issuer key and certificate chain, loaded from disk
//! - [`verify_issuer`] - Startup check of the issuer chain against the anchors
//! - [`CertificateAuthority`] - Signs CSRs into leaf certificates
//! - [`TrustRoot`] - Self-signed root for bootstrapping and tests
//!
//! # Security Note
//!
//! The CA never generates keys for workloads. The issued certificate binds the
//! public key from the CSR, whose self-signature proves possession of the
//! private key. Subject and SAN are always replaced by the requested name;
//! nothing else from the CSR is copied into the certificate.

mod self_signed;

pub use self_signed::{IssuerBundle, TrustRoot};

use crate::certificate::{self, parse_pem_chain, Certificate, TrustAnchors};
use crate::validity::Validity;
use crate::{Error, Result};
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
    SerialNumber,
};
use rustls_pki_types::CertificateSigningRequestDer;
use sha2::{Digest, Sha256};
use std::path::Path;
use time::OffsetDateTime;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;

/// File name of the issuer's PKCS#8 PEM private key.
pub const ISSUER_KEY_FILE: &str = "key.pem";
/// File name of the issuer's PEM certificate chain.
pub const ISSUER_CRT_FILE: &str = "crt.pem";

/// The issuer key and its certificate chain (issuer first, then any
/// intermediates up to but excluding a trust anchor).
pub struct IssuerCredentials {
    key: KeyPair,
    chain: Vec<Certificate>,
}

impl IssuerCredentials {
    /// Parses credentials from a PEM key and a PEM certificate chain.
    pub fn from_pem(key_pem: &str, crt_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::IssuerVerification(format!("failed to load issuer key: {e}")))?;
        let chain = parse_pem_chain(crt_pem)?;
        if chain.is_empty() {
            return Err(Error::IssuerVerification(
                "issuer certificate file contains no certificates".to_string(),
            ));
        }
        Ok(Self { key, chain })
    }

    /// Reads `key.pem` and `crt.pem` from the issuer directory.
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let key_pem = tokio::fs::read_to_string(dir.join(ISSUER_KEY_FILE)).await?;
        let crt_pem = tokio::fs::read_to_string(dir.join(ISSUER_CRT_FILE)).await?;
        Self::from_pem(&key_pem, &crt_pem)
    }

    /// Returns the issuer certificate chain.
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }
}

impl std::fmt::Debug for IssuerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerCredentials")
            .field("key", &"[REDACTED]")
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Verifies an issuer chain against the trust anchors.
///
/// 1. The first certificate is a CA that names `expected_name` (DNS SAN or CN)
/// 2. Every certificate is within its validity window at `now`
/// 3. Each certificate is signed by the next one in the chain
/// 4. The last certificate is an anchor or is signed by one
pub fn verify_issuer(
    chain: &[Certificate],
    anchors: &TrustAnchors,
    expected_name: &str,
    now: OffsetDateTime,
) -> Result<()> {
    let parsed = chain
        .iter()
        .map(|c| certificate::parse(c.der()))
        .collect::<Result<Vec<_>>>()?;
    let issuer = parsed
        .first()
        .ok_or_else(|| Error::IssuerVerification("empty issuer chain".to_string()))?;

    if !issuer.is_ca() {
        return Err(Error::IssuerVerification(
            "issuer certificate is not a CA".to_string(),
        ));
    }
    let names = certificate::dns_names(issuer);
    let cn_matches = issuer
        .subject()
        .iter_common_name()
        .any(|cn| cn.as_str().map(|s| s == expected_name).unwrap_or(false));
    if !cn_matches && !names.iter().any(|n| n == expected_name) {
        return Err(Error::IssuerVerification(format!(
            "issuer certificate does not name {expected_name}"
        )));
    }

    for cert in &parsed {
        check_validity(cert, now)?;
    }

    for pair in parsed.windows(2) {
        verify_link(&pair[0], &pair[1])?;
    }

    if anchors.contains(&chain[chain.len() - 1]) {
        return Ok(());
    }
    let last = &parsed[parsed.len() - 1];
    for root in anchors.roots() {
        let anchor = certificate::parse(root.der())?;
        if verify_link(last, &anchor).is_ok() {
            return check_validity(&anchor, now);
        }
    }
    Err(Error::IssuerVerification(
        "issuer chain does not terminate in a trust anchor".to_string(),
    ))
}

fn check_validity(cert: &X509Certificate<'_>, now: OffsetDateTime) -> Result<()> {
    let validity = cert.validity();
    let not_before = validity.not_before.to_datetime();
    let not_after = validity.not_after.to_datetime();
    if now < not_before || now > not_after {
        return Err(Error::IssuerVerification(format!(
            "certificate {} not valid at {now} (valid {not_before} to {not_after})",
            cert.subject()
        )));
    }
    Ok(())
}

fn verify_link(child: &X509Certificate<'_>, parent: &X509Certificate<'_>) -> Result<()> {
    if child.issuer().as_raw() != parent.subject().as_raw() {
        return Err(Error::IssuerVerification(format!(
            "{} is not issued by {}",
            child.subject(),
            parent.subject()
        )));
    }
    if !parent.is_ca() {
        return Err(Error::IssuerVerification(format!(
            "{} is not a CA",
            parent.subject()
        )));
    }
    child
        .verify_signature(Some(parent.public_key()))
        .map_err(|e| {
            Error::IssuerVerification(format!(
                "signature on {} does not verify: {e}",
                child.subject()
            ))
        })
}

/// Signs identity certificates with a verified issuer.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    chain: Vec<Certificate>,
    validity: Validity,
}

impl CertificateAuthority {
    /// Verifies the credentials against `anchors` and builds the signer.
    pub fn new(
        credentials: IssuerCredentials,
        anchors: &TrustAnchors,
        expected_name: &str,
        validity: Validity,
    ) -> Result<Self> {
        let IssuerCredentials { key, mut chain } = credentials;
        verify_issuer(&chain, anchors, expected_name, OffsetDateTime::now_utc())?;

        let issuer_cert = certificate::parse(chain[0].der())?;
        if key.subject_public_key_info() != issuer_cert.public_key().raw {
            return Err(Error::IssuerVerification(
                "issuer key does not match issuer certificate".to_string(),
            ));
        }

        let issuer = Issuer::from_ca_cert_der(&chain[0].as_cert_der(), key)
            .map_err(|e| Error::IssuerVerification(format!("failed to load issuer: {e}")))?;

        // Anchors bundled at the tail of crt.pem are never sent to clients.
        while chain.len() > 1 && chain.last().is_some_and(|c| anchors.contains(c)) {
            chain.pop();
        }

        info!(
            issuer = %expected_name,
            fingerprint = %chain[0].fingerprint(),
            lifetime_secs = validity.lifetime().as_secs(),
            clock_skew_secs = validity.clock_skew_allowance().as_secs(),
            "loaded identity issuer"
        );

        Ok(Self {
            issuer,
            chain,
            validity,
        })
    }

    /// Returns the issuer chain returned to clients as intermediates.
    pub fn intermediates(&self) -> &[Certificate] {
        &self.chain
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    /// Signs `csr_der` into a leaf certificate for `name`.
    ///
    /// The CSR signature is verified; its requested subject and extensions
    /// are discarded in favour of `name`.
    pub fn issue(&self, csr_der: &[u8], name: &str, now: OffsetDateTime) -> Result<Certificate> {
        let window = self.validity.window(now)?;

        let mut csr = CertificateSigningRequestParams::from_der(
            &CertificateSigningRequestDer::from(csr_der),
        )
        .map_err(|e| Error::Csr(format!("failed to parse CSR: {e}")))?;

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::CaSigning(format!("failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;

        let san = rcgen::string::Ia5String::try_from(name.to_string())
            .map_err(|e| Error::InvalidName(format!("{name}: {e}")))?;
        params.subject_alt_names = vec![SanType::DnsName(san)];

        params.not_before = window.not_before;
        params.not_after = window.not_after;
        params.serial_number = Some(serial_number(csr_der, now));

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        csr.params = params;
        let signed = csr
            .signed_by(&self.issuer)
            .map_err(|e| Error::CaSigning(format!("certificate signing failed: {e}")))?;

        debug!(identity = %name, not_after = %window.not_after, "issued certificate");
        Certificate::from_der(signed.der().to_vec())
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("chain_len", &self.chain.len())
            .field("validity", &self.validity)
            .finish()
    }
}

/// Serial derived from the CSR and issuance instant: 128 bits, positive.
fn serial_number(csr_der: &[u8], now: OffsetDateTime) -> SerialNumber {
    let mut hasher = Sha256::new();
    hasher.update(csr_der);
    hasher.update(now.unix_timestamp_nanos().to_be_bytes());
    let digest = hasher.finalize();

    let mut serial = digest[..16].to_vec();
    serial[0] &= 0x7f;
    SerialNumber::from(serial)
}
