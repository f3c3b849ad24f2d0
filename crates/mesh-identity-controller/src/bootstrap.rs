//! Generates a trust anchor and issuer credentials for a new cluster.
//!
//! Output layout:
//!
//! ```text
//! <out>/trust-anchors.pem
//! <out>/issuer/key.pem
//! <out>/issuer/crt.pem
//! ```
//!
//! Existing files are never overwritten. The trust anchor's private key is
//! not written anywhere.

use anyhow::{Context, Result};
use clap::Args;
use mesh_identity::ca::{TrustRoot, ISSUER_CRT_FILE, ISSUER_KEY_FILE};
use mesh_identity::TrustDomain;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const TRUST_ANCHORS_FILE: &str = "trust-anchors.pem";
pub const ISSUER_DIR: &str = "issuer";

#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// Output directory.
    #[arg(long, env = "MESH_IDENTITY_BOOTSTRAP_OUT")]
    out: PathBuf,
    /// Namespace the control plane runs in.
    #[arg(long, env = "MESH_IDENTITY_CONTROLLER_NAMESPACE", default_value = "linkerd")]
    controller_namespace: String,
    /// DNS domain identities are issued under.
    #[arg(long, env = "MESH_IDENTITY_TRUST_DOMAIN", default_value = "cluster.local")]
    trust_domain: String,
    /// Lifetime (seconds) of the trust anchor (default: 10 years).
    #[arg(long, default_value_t = 10 * 365 * 86400)]
    anchor_lifetime_secs: u64,
    /// Lifetime (seconds) of the issuer certificate (default: 1 year).
    #[arg(long, default_value_t = 365 * 86400)]
    issuer_lifetime_secs: u64,
}

pub async fn execute(args: BootstrapArgs) -> Result<()> {
    tokio::task::spawn_blocking(move || bootstrap(&args)).await?
}

fn bootstrap(args: &BootstrapArgs) -> Result<()> {
    let trust_domain = TrustDomain::new(&args.controller_namespace, &args.trust_domain)
        .context("invalid trust domain")?;
    let issuer_name = trust_domain.issuer_name();

    let root = TrustRoot::generate(
        &format!("root.{trust_domain}"),
        Duration::from_secs(args.anchor_lifetime_secs),
    )?;
    let issuer = root.issue_issuer(&issuer_name, Duration::from_secs(args.issuer_lifetime_secs))?;

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let issuer_dir = args.out.join(ISSUER_DIR);
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&issuer_dir)
        .with_context(|| format!("failed to create {}", issuer_dir.display()))?;

    let anchors_path = args.out.join(TRUST_ANCHORS_FILE);
    write_new(&anchors_path, root.certificate().to_pem().as_bytes(), 0o644)?;
    write_new(&issuer_dir.join(ISSUER_KEY_FILE), issuer.key_pem().as_bytes(), 0o600)?;
    write_new(&issuer_dir.join(ISSUER_CRT_FILE), issuer.crt_pem().as_bytes(), 0o644)?;

    info!(
        trust_anchors = %anchors_path.display(),
        issuer = %issuer_dir.display(),
        issuer_name = %issuer_name,
        fingerprint = %root.certificate().fingerprint(),
        "wrote identity credentials"
    );
    Ok(())
}

fn write_new(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("refusing to write {}", path.display()))?;
    file.write_all(contents)?;
    Ok(())
}
