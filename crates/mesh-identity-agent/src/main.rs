//! mesh-identity-agent - keeps a workload's identity certificate fresh.
//!
//! # Examples
//!
//! ```bash
//! mesh-identity-agent \
//!     --addr http://mesh-identity.linkerd.svc:8083 \
//!     --trust-anchors /var/run/identity/trust-anchors.pem \
//!     --token /var/run/secrets/kubernetes.io/serviceaccount/token \
//!     --dir /var/run/identity/end-entity \
//!     --service-account web --namespace default
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use mesh_identity::agent::DEFAULT_CERTIFY_TIMEOUT;
use mesh_identity::shutdown::shutdown_signal;
use mesh_identity::{Agent, AgentConfig, TrustAnchors, TrustDomain};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod grpc;

use grpc::GrpcCertifyClient;

/// Requests and rotates an identity certificate for this workload.
#[derive(Parser, Debug)]
#[command(name = "mesh-identity-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address of the identity service.
    #[arg(long, env = "MESH_IDENTITY_AGENT_ADDR", default_value = "http://localhost:8083")]
    addr: String,

    /// PEM bundle of trust anchors.
    #[arg(
        long,
        env = "MESH_IDENTITY_AGENT_TRUST_ANCHORS",
        required_unless_present = "trust_anchors_pem",
        conflicts_with = "trust_anchors_pem"
    )]
    trust_anchors: Option<PathBuf>,

    /// Inline PEM trust anchors, as an alternative to a file.
    #[arg(long, env = "MESH_IDENTITY_AGENT_TRUST_ANCHORS_PEM")]
    trust_anchors_pem: Option<String>,

    /// Bearer token file, re-read before every request.
    #[arg(long, env = "MESH_IDENTITY_AGENT_TOKEN")]
    token: PathBuf,

    /// End-entity directory for the key, CSR and certificate.
    #[arg(long, env = "MESH_IDENTITY_AGENT_DIR")]
    dir: PathBuf,

    /// Full identity name to request.
    #[arg(
        long,
        env = "MESH_IDENTITY_AGENT_NAME",
        conflicts_with_all = ["service_account", "namespace"]
    )]
    name: Option<String>,

    /// Service account to derive the identity name from.
    #[arg(long, env = "MESH_IDENTITY_AGENT_SERVICE_ACCOUNT", requires = "namespace")]
    service_account: Option<String>,

    /// Namespace of the service account.
    #[arg(long, env = "MESH_IDENTITY_AGENT_NAMESPACE", requires = "service_account")]
    namespace: Option<String>,

    #[arg(long, env = "MESH_IDENTITY_AGENT_CONTROLLER_NAMESPACE", default_value = "linkerd")]
    controller_namespace: String,

    #[arg(long, env = "MESH_IDENTITY_AGENT_TRUST_DOMAIN", default_value = "cluster.local")]
    trust_domain: String,

    /// Deadline for each Certify call, in seconds.
    #[arg(long, env = "MESH_IDENTITY_AGENT_CERTIFY_TIMEOUT_SECS", default_value_t = DEFAULT_CERTIFY_TIMEOUT.as_secs())]
    certify_timeout_secs: u64,

    /// Log output format.
    #[arg(long, env = "MESH_IDENTITY_LOG_FORMAT", value_enum, default_value = "json")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Plain,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Plain => registry.with(fmt::layer()).init(),
    }
}

/// Resolves the identity to request, either given directly or derived from
/// a service account.
fn resolve_name(args: &Args) -> Result<String> {
    let domain = TrustDomain::new(&args.controller_namespace, &args.trust_domain)
        .context("invalid trust domain")?;

    match (&args.name, &args.service_account, &args.namespace) {
        (Some(name), _, _) => {
            let name = name.trim();
            if name.is_empty() {
                bail!("identity name must not be empty");
            }
            Ok(name.to_string())
        }
        (None, Some(sa), Some(ns)) => domain
            .service_account_identity(sa, ns)
            .context("invalid service account identity"),
        _ => bail!("either --name or --service-account and --namespace are required"),
    }
}

async fn load_trust_anchors(args: &Args) -> Result<TrustAnchors> {
    let pem = match (&args.trust_anchors, &args.trust_anchors_pem) {
        (Some(path), _) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read trust anchors {}", path.display()))?,
        (None, Some(pem)) => pem.clone(),
        (None, None) => bail!("no trust anchors configured"),
    };
    TrustAnchors::from_pem(&pem).context("invalid trust anchors")
}

async fn run(args: Args) -> Result<()> {
    let name = resolve_name(&args)?;
    let trust_anchors = load_trust_anchors(&args).await?;
    let client = GrpcCertifyClient::new(args.addr.clone())
        .with_context(|| format!("invalid identity service address {}", args.addr))?;

    let config = AgentConfig {
        name,
        token_path: args.token,
        dir: args.dir,
        trust_anchors,
        certify_timeout: Duration::from_secs(args.certify_timeout_secs),
    };
    let mut agent = Agent::start(config, client)
        .await
        .context("failed to initialize identity agent")?;

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(shutdown.clone()));

    agent.run(shutdown.clone()).await;

    shutdown.cancel();
    signals
        .await
        .context("signal handler panicked")?
        .context("failed to install signal handlers")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let result = run(args).await;
    if let Err(e) = &result {
        tracing::error!(error = %format_args!("{e:#}"), "fatal");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "mesh-identity-agent",
            "--trust-anchors",
            "/anchors.pem",
            "--token",
            "/token",
            "--dir",
            "/ee",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_name_from_service_account() {
        let args = parse(&["--service-account", "web", "--namespace", "default"]);
        assert_eq!(
            resolve_name(&args).unwrap(),
            "web.default.serviceaccount.identity.linkerd.cluster.local"
        );
    }

    #[test]
    fn test_name_uses_trust_domain_flags() {
        let args = parse(&[
            "--service-account",
            "web",
            "--namespace",
            "prod",
            "--controller-namespace",
            "mesh",
            "--trust-domain",
            "example.org",
        ]);
        assert_eq!(
            resolve_name(&args).unwrap(),
            "web.prod.serviceaccount.identity.mesh.example.org"
        );
    }

    #[test]
    fn test_explicit_name() {
        let args = parse(&["--name", "custom.identity.linkerd.cluster.local"]);
        assert_eq!(
            resolve_name(&args).unwrap(),
            "custom.identity.linkerd.cluster.local"
        );
    }

    #[test]
    fn test_missing_name_is_error() {
        let args = parse(&[]);
        assert!(resolve_name(&args).is_err());
    }

    #[test]
    fn test_service_account_requires_namespace() {
        let argv = [
            "mesh-identity-agent",
            "--trust-anchors",
            "/anchors.pem",
            "--token",
            "/token",
            "--dir",
            "/ee",
            "--service-account",
            "web",
        ];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_trust_anchors_required() {
        let argv = ["mesh-identity-agent", "--token", "/token", "--dir", "/ee"];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--name", "x.y"]);
        assert_eq!(args.addr, "http://localhost:8083");
        assert_eq!(args.certify_timeout_secs, 30);
        assert_eq!(args.controller_namespace, "linkerd");
        assert_eq!(args.trust_domain, "cluster.local");
    }

    #[tokio::test]
    async fn test_inline_trust_anchors_rejects_garbage() {
        let argv = [
            "mesh-identity-agent",
            "--trust-anchors-pem",
            "not pem",
            "--token",
            "/token",
            "--dir",
            "/ee",
        ];
        let args = Args::try_parse_from(argv).unwrap();
        assert!(load_trust_anchors(&args).await.is_err());
    }
}
