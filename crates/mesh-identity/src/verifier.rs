//! End-entity certificate verification.
//!
//! The agent verifies every certificate the identity service returns before
//! it replaces the one on disk:
//!
//! 1. The leaf is inside its validity window at `now`
//! 2. The leaf chains to a trust anchor through the returned intermediates
//! 3. The leaf is valid for the requested identity name
//!
//! Chain building and signature checks are delegated to webpki.

use crate::certificate::{Certificate, TrustAnchors};
use crate::{Error, Result};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::time::Duration;
use time::OffsetDateTime;
use webpki::{EndEntityCert, KeyUsage};

/// Verifies an issued leaf certificate for `expected_name` at `now`.
pub fn verify_end_entity(
    leaf: &Certificate,
    intermediates: &[Certificate],
    anchors: &TrustAnchors,
    expected_name: &str,
    now: OffsetDateTime,
) -> Result<()> {
    let not_before = leaf.not_before()?;
    let not_after = leaf.not_after()?;
    if now < not_before {
        return Err(Error::VerificationFailed(format!(
            "certificate not valid before {not_before}"
        )));
    }
    if now > not_after {
        return Err(Error::VerificationFailed(format!(
            "certificate expired at {not_after}"
        )));
    }

    let names = leaf.dns_names()?;
    if !names.iter().any(|n| n == expected_name) {
        return Err(Error::VerificationFailed(format!(
            "certificate names {names:?} do not include {expected_name}"
        )));
    }

    let end_entity = leaf.as_cert_der();
    let ee_cert = EndEntityCert::try_from(&end_entity).map_err(|e| {
        Error::VerificationFailed(format!("failed to parse end-entity certificate: {e:?}"))
    })?;

    let intermediate_certs: Vec<CertificateDer<'_>> =
        intermediates.iter().map(Certificate::as_cert_der).collect();
    let trust_anchors = anchors.webpki_anchors()?;

    ee_cert
        .verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &trust_anchors,
            &intermediate_certs,
            unix_time(now)?,
            KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|e| {
            tracing::warn!(identity = %expected_name, "certificate chain verification failed: {e:?}");
            Error::VerificationFailed(format!("chain verification failed: {e:?}"))
        })?;

    let server_name = ServerName::try_from(expected_name)
        .map_err(|e| Error::InvalidName(format!("{expected_name}: {e}")))?;
    ee_cert
        .verify_is_valid_for_subject_name(&server_name)
        .map_err(|e| {
            Error::VerificationFailed(format!("certificate not valid for {expected_name}: {e:?}"))
        })?;

    Ok(())
}

fn unix_time(now: OffsetDateTime) -> Result<UnixTime> {
    let secs = u64::try_from(now.unix_timestamp())
        .map_err(|_| Error::VerificationFailed(format!("time {now} precedes the unix epoch")))?;
    Ok(UnixTime::since_unix_epoch(Duration::from_secs(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CertificateAuthority, TrustRoot};
    use crate::csr::CsrOptions;
    use crate::{TrustDomain, Validity};

    const NAME: &str = "web.default.serviceaccount.identity.linkerd.cluster.local";

    struct Fixture {
        root: TrustRoot,
        ca: CertificateAuthority,
    }

    fn fixture(lifetime: Duration) -> Fixture {
        let dom = TrustDomain::new("linkerd", "cluster.local").unwrap();
        let root = TrustRoot::generate("root.linkerd.cluster.local", Duration::from_secs(86400)).unwrap();
        let creds = root
            .issue_issuer(&dom.issuer_name(), Duration::from_secs(86400))
            .unwrap()
            .into_credentials()
            .unwrap();
        let anchors = root.trust_anchors().unwrap();
        let validity = Validity::new(Duration::ZERO, lifetime).unwrap();
        let ca = CertificateAuthority::new(creds, &anchors, &dom.issuer_name(), validity).unwrap();
        Fixture { root, ca }
    }

    fn issue(ca: &CertificateAuthority, name: &str) -> Certificate {
        let sign = CsrOptions::new(name).generate().unwrap();
        ca.issue(sign.csr_der(), name, OffsetDateTime::now_utc()).unwrap()
    }

    #[test]
    fn test_accepts_valid_certificate_chain() {
        let f = fixture(Duration::from_secs(3600));
        let leaf = issue(&f.ca, NAME);
        let anchors = f.root.trust_anchors().unwrap();

        let result = verify_end_entity(
            &leaf,
            f.ca.intermediates(),
            &anchors,
            NAME,
            OffsetDateTime::now_utc(),
        );
        assert!(result.is_ok(), "should accept certificate from trusted CA: {result:?}");
    }

    #[test]
    fn test_rejects_missing_intermediates() {
        let f = fixture(Duration::from_secs(3600));
        let leaf = issue(&f.ca, NAME);
        let anchors = f.root.trust_anchors().unwrap();

        let result = verify_end_entity(&leaf, &[], &anchors, NAME, OffsetDateTime::now_utc());
        assert!(matches!(result, Err(Error::VerificationFailed(_))));
    }

    #[test]
    fn test_rejects_certificate_from_untrusted_ca() {
        let trusted = fixture(Duration::from_secs(3600));
        let rogue = fixture(Duration::from_secs(3600));
        let leaf = issue(&rogue.ca, NAME);
        let anchors = trusted.root.trust_anchors().unwrap();

        let result = verify_end_entity(
            &leaf,
            rogue.ca.intermediates(),
            &anchors,
            NAME,
            OffsetDateTime::now_utc(),
        );
        assert!(
            matches!(result, Err(Error::VerificationFailed(_))),
            "should reject certificate from untrusted CA"
        );
    }

    #[test]
    fn test_rejects_other_identity() {
        let f = fixture(Duration::from_secs(3600));
        let leaf = issue(&f.ca, NAME);
        let anchors = f.root.trust_anchors().unwrap();

        let other = "api.default.serviceaccount.identity.linkerd.cluster.local";
        let result = verify_end_entity(
            &leaf,
            f.ca.intermediates(),
            &anchors,
            other,
            OffsetDateTime::now_utc(),
        );
        assert!(matches!(result, Err(Error::VerificationFailed(_))));
    }

    #[test]
    fn test_rejects_outside_validity_window() {
        let f = fixture(Duration::from_secs(60));
        let leaf = issue(&f.ca, NAME);
        let anchors = f.root.trust_anchors().unwrap();

        let later = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        let result = verify_end_entity(&leaf, f.ca.intermediates(), &anchors, NAME, later);
        assert!(matches!(result, Err(Error::VerificationFailed(msg)) if msg.contains("expired")));

        let earlier = OffsetDateTime::now_utc() - time::Duration::minutes(5);
        let result = verify_end_entity(&leaf, f.ca.intermediates(), &anchors, NAME, earlier);
        assert!(matches!(result, Err(Error::VerificationFailed(msg)) if msg.contains("not valid before")));
    }
}
