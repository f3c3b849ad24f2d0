//! Identity naming scheme.
//!
//! Every workload identity is a DNS name scoped to the controller namespace
//! and the cluster's trust domain:
//!
//! ```text
//! <name>.<namespace>.<kind>.identity.<controller-namespace>.<domain>
//! ```
//!
//! # Example
//!
//! ```
//! use mesh_identity::TrustDomain;
//!
//! let dom = TrustDomain::new("linkerd", "cluster.local").unwrap();
//! assert_eq!(
//!     dom.service_account_identity("web", "default").unwrap(),
//!     "web.default.serviceaccount.identity.linkerd.cluster.local"
//! );
//! assert_eq!(dom.issuer_name(), "identity.linkerd.cluster.local");
//! ```

use crate::{Error, Result};
use std::fmt;

/// Object kind used for service-account backed workload identities.
pub const SERVICE_ACCOUNT_KIND: &str = "serviceaccount";

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

/// The namespace under which workload identities are issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrustDomain {
    controller_namespace: String,
    domain: String,
}

impl TrustDomain {
    /// Creates a trust domain.
    ///
    /// The controller namespace must be a single DNS label and the domain a
    /// dot-separated sequence of DNS labels.
    pub fn new(controller_namespace: impl Into<String>, domain: impl Into<String>) -> Result<Self> {
        let controller_namespace = controller_namespace.into();
        let domain = domain.into();

        validate_label(&controller_namespace, "controller namespace")?;
        validate_subdomain(&domain, "trust domain")?;

        Ok(Self {
            controller_namespace,
            domain,
        })
    }

    /// Returns the controller namespace.
    pub fn controller_namespace(&self) -> &str {
        &self.controller_namespace
    }

    /// Returns the DNS domain (e.g. `cluster.local`).
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Builds the canonical identity name of an object.
    pub fn identity(&self, kind: &str, name: &str, namespace: &str) -> Result<String> {
        validate_label(kind, "kind")?;
        validate_label(name, "name")?;
        validate_label(namespace, "namespace")?;

        let id = format!(
            "{name}.{namespace}.{kind}.identity.{}.{}",
            self.controller_namespace, self.domain
        );
        if id.len() > MAX_NAME_LEN {
            return Err(Error::InvalidName(format!(
                "identity exceeds {MAX_NAME_LEN} bytes: {id}"
            )));
        }
        Ok(id)
    }

    /// Builds the identity name of a service account.
    pub fn service_account_identity(&self, service_account: &str, namespace: &str) -> Result<String> {
        self.identity(SERVICE_ACCOUNT_KIND, service_account, namespace)
    }

    /// The name the issuer certificate must carry.
    pub fn issuer_name(&self) -> String {
        format!("identity.{}.{}", self.controller_namespace, self.domain)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.controller_namespace, self.domain)
    }
}

/// Validates an RFC 1123 DNS label: lowercase alphanumerics and hyphens,
/// not starting or ending with a hyphen.
fn validate_label(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidName(format!("empty {what}")));
    }
    if value.len() > MAX_LABEL_LEN {
        return Err(Error::InvalidName(format!(
            "{what} exceeds {MAX_LABEL_LEN} bytes: {value}"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(Error::InvalidName(format!(
            "{what} contains invalid character {c:?}: {value}"
        )));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(Error::InvalidName(format!(
            "{what} cannot start or end with '-': {value}"
        )));
    }
    Ok(())
}

fn validate_subdomain(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidName(format!("empty {what}")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "{what} exceeds {MAX_NAME_LEN} bytes: {value}"
        )));
    }
    value
        .split('.')
        .try_for_each(|label| validate_label(label, what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_service_account_identity() {
        let dom = TrustDomain::new("linkerd", "cluster.local").unwrap();
        let id = dom.service_account_identity("web", "emojivoto").unwrap();
        assert_eq!(id, "web.emojivoto.serviceaccount.identity.linkerd.cluster.local");
    }

    #[test]
    fn test_issuer_name() {
        let dom = TrustDomain::new("mesh-system", "example.org").unwrap();
        assert_eq!(dom.issuer_name(), "identity.mesh-system.example.org");
        assert_eq!(dom.to_string(), "mesh-system.example.org");
    }

    #[test]
    fn test_rejects_empty_components() {
        assert!(TrustDomain::new("", "cluster.local").is_err());
        assert!(TrustDomain::new("linkerd", "").is_err());
        assert!(TrustDomain::new("linkerd", "cluster..local").is_err());

        let dom = TrustDomain::new("linkerd", "cluster.local").unwrap();
        assert!(dom.service_account_identity("", "default").is_err());
        assert!(dom.service_account_identity("web", "").is_err());
    }

    #[test]
    fn test_rejects_disallowed_characters() {
        for bad in ["Linkerd", "link_erd", "link.erd", "-linkerd", "linkerd-", "l*", "ns/x"] {
            assert!(
                TrustDomain::new(bad, "cluster.local").is_err(),
                "controller namespace {bad:?} should be rejected"
            );
        }
        for bad in ["Cluster.local", "cluster.local.", ".cluster", "clu ster", "cluster_local"] {
            assert!(
                TrustDomain::new("linkerd", bad).is_err(),
                "domain {bad:?} should be rejected"
            );
        }

        let dom = TrustDomain::new("linkerd", "cluster.local").unwrap();
        assert!(dom.service_account_identity("web.evil", "default").is_err());
        assert!(dom.identity("ServiceAccount", "web", "default").is_err());
    }

    #[test]
    fn test_rejects_overlong_label() {
        let long = "a".repeat(64);
        assert!(TrustDomain::new(long.as_str(), "cluster.local").is_err());
        assert!(TrustDomain::new("a".repeat(63), "cluster.local").is_ok());
    }

    fn label() -> impl Strategy<Value = String> {
        "[a-z0-9]([a-z0-9-]{0,14}[a-z0-9])?"
    }

    proptest! {
        #[test]
        fn prop_valid_components_build_canonical_names(
            ctrl in label(),
            domain in prop::collection::vec(label(), 1..4),
            name in label(),
            ns in label(),
        ) {
            let domain = domain.join(".");
            let dom = TrustDomain::new(ctrl.clone(), domain.clone()).unwrap();
            let id = dom.service_account_identity(&name, &ns).unwrap();
            prop_assert_eq!(id, format!("{name}.{ns}.serviceaccount.identity.{ctrl}.{domain}"));
        }

        #[test]
        fn prop_disallowed_characters_rejected(
            prefix in label(),
            bad in "[A-Z_/:@ *%]",
        ) {
            let value = format!("{prefix}{bad}");
            prop_assert!(TrustDomain::new(value.clone(), "cluster.local").is_err());
            prop_assert!(TrustDomain::new("linkerd", value).is_err());
        }
    }
}
