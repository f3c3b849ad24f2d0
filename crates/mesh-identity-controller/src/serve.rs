use crate::grpc;
use anyhow::{Context, Result};
use clap::Args;
use mesh_identity::ca::{CertificateAuthority, IssuerCredentials};
use mesh_identity::shutdown::shutdown_signal;
use mesh_identity::token::{KubeTokenReviewer, ServiceAccountValidator};
use mesh_identity::{IdentityService, TrustAnchors, TrustDomain, Validity};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address for the Certify API.
    #[arg(long, env = "MESH_IDENTITY_ADDR", default_value = "0.0.0.0:8083")]
    addr: SocketAddr,
    /// Namespace the control plane runs in.
    #[arg(long, env = "MESH_IDENTITY_CONTROLLER_NAMESPACE", default_value = "linkerd")]
    controller_namespace: String,
    /// DNS domain identities are issued under.
    #[arg(long, env = "MESH_IDENTITY_TRUST_DOMAIN", default_value = "cluster.local")]
    trust_domain: String,
    /// PEM bundle of trust anchors.
    #[arg(long, env = "MESH_IDENTITY_TRUST_ANCHORS")]
    trust_anchors: PathBuf,
    /// Directory holding the issuer's key.pem and crt.pem.
    #[arg(long, env = "MESH_IDENTITY_ISSUER")]
    issuer: PathBuf,
    /// Lifetime (seconds) of issued certificates.
    #[arg(long, env = "MESH_IDENTITY_ISSUANCE_LIFETIME_SECS", default_value_t = 86400)]
    issuance_lifetime_secs: u64,
    /// Backdating (seconds) of issued certificates' NotBefore.
    #[arg(long, env = "MESH_IDENTITY_CLOCK_SKEW_ALLOWANCE_SECS", default_value_t = 0)]
    clock_skew_allowance_secs: u64,
    /// Kubeconfig for the TokenReview API (in-cluster config when unset).
    #[arg(long, env = "MESH_IDENTITY_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
    /// Audiences tokens must be valid for (repeatable or comma separated).
    #[arg(long = "token-audience", env = "MESH_IDENTITY_TOKEN_AUDIENCES", value_delimiter = ',')]
    token_audiences: Vec<String>,
}

pub async fn execute(args: ServeArgs) -> Result<()> {
    let trust_domain = TrustDomain::new(&args.controller_namespace, &args.trust_domain)
        .context("invalid trust domain")?;

    let anchors_pem = tokio::fs::read_to_string(&args.trust_anchors)
        .await
        .with_context(|| format!("failed to read trust anchors {}", args.trust_anchors.display()))?;
    let anchors = TrustAnchors::from_pem(&anchors_pem).context("invalid trust anchors")?;

    let credentials = IssuerCredentials::load(&args.issuer)
        .await
        .with_context(|| format!("failed to load issuer from {}", args.issuer.display()))?;

    let validity = Validity::new(
        Duration::from_secs(args.clock_skew_allowance_secs),
        Duration::from_secs(args.issuance_lifetime_secs),
    )?;

    let issuer_name = trust_domain.issuer_name();
    let ca = CertificateAuthority::new(credentials, &anchors, &issuer_name, validity)
        .with_context(|| format!("issuer {issuer_name} failed verification"))?;

    let reviewer = KubeTokenReviewer::connect(args.kubeconfig.as_deref())
        .await
        .context("failed to connect to the Kubernetes API")?
        .with_audiences(args.token_audiences);
    let validator = ServiceAccountValidator::new(reviewer, trust_domain);

    info!(
        trust_domain = %validator.trust_domain(),
        issuer = %issuer_name,
        anchors = anchors.roots().len(),
        intermediates = ca.intermediates().len(),
        lifetime = ?ca.validity().lifetime(),
        "starting identity service"
    );
    let service = Arc::new(IdentityService::new(validator, Arc::new(ca)));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    grpc::serve(args.addr, service, shutdown).await
}
