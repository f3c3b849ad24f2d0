//! End-to-end issuance: bootstrap a root and issuer, serve Certify
//! in-process and drive the agent against it.

use mesh_identity::agent::{CRT_FILE, MIN_REFRESH};
use mesh_identity::{
    Agent, AgentConfig, Certificate, CertificateAuthority, CertifyRequest,
    CsrOptions, Error, IdentityService, ServiceAccountValidator, StaticTokenReviewer, TrustRoot,
    TrustDomain, Validity,
};
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

const DAY: Duration = Duration::from_secs(86400);

type Service = IdentityService<ServiceAccountValidator<StaticTokenReviewer>>;

struct Cluster {
    domain: TrustDomain,
    root: TrustRoot,
    service: Arc<Service>,
}

fn cluster(validity: Validity) -> Cluster {
    let domain = TrustDomain::new("linkerd", "cluster.local").unwrap();
    let root = TrustRoot::generate("root.linkerd.cluster.local", DAY).unwrap();
    let creds = root
        .issue_issuer(&domain.issuer_name(), DAY)
        .unwrap()
        .into_credentials()
        .unwrap();
    let ca = CertificateAuthority::new(
        creds,
        &root.trust_anchors().unwrap(),
        &domain.issuer_name(),
        validity,
    )
    .unwrap();

    let reviewer = StaticTokenReviewer::new()
        .with_service_account("web-token", "default", "web")
        .with_service_account("api-token", "default", "api");
    let service = Arc::new(IdentityService::new(
        ServiceAccountValidator::new(reviewer, domain.clone()),
        Arc::new(ca),
    ));
    Cluster {
        domain,
        root,
        service,
    }
}

struct Workload {
    _tmp: tempfile::TempDir,
    token_path: PathBuf,
    dir: PathBuf,
}

fn workload(token: &str) -> Workload {
    let tmp = tempfile::tempdir().unwrap();
    let token_path = tmp.path().join("token");
    std::fs::write(&token_path, token).unwrap();
    let dir = tmp.path().join("end-entity");
    std::fs::create_dir(&dir).unwrap();
    std::fs::set_permissions(&dir, Permissions::from_mode(0o700)).unwrap();
    Workload {
        _tmp: tmp,
        token_path,
        dir,
    }
}

impl Cluster {
    fn web(&self) -> String {
        self.domain
            .service_account_identity("web", "default")
            .unwrap()
    }

    fn config(&self, w: &Workload) -> AgentConfig {
        AgentConfig {
            name: self.web(),
            token_path: w.token_path.clone(),
            dir: w.dir.clone(),
            trust_anchors: self.root.trust_anchors().unwrap(),
            certify_timeout: Duration::from_secs(5),
        }
    }
}

fn read_crt(dir: &Path) -> Certificate {
    let pem = std::fs::read_to_string(dir.join(CRT_FILE)).unwrap();
    Certificate::from_pem(&pem).unwrap()
}

#[tokio::test]
async fn test_fresh_workload_receives_certificate() {
    let c = cluster(Validity::default());
    let w = workload("web-token");

    let mut agent = Agent::start(c.config(&w), c.service.clone()).await.unwrap();
    let refresh = agent.renew().await;

    let crt = read_crt(&w.dir);
    assert_eq!(crt.dns_names().unwrap(), vec![c.web()]);
    assert_eq!(crt.common_name().unwrap(), Some(c.web()));
    assert!(crt.not_after().unwrap() > OffsetDateTime::now_utc());
    assert!(!crt.is_ca().unwrap());
    assert!(refresh > MIN_REFRESH);

    let mode = std::fs::metadata(w.dir.join(CRT_FILE))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_existing_certificate_blocks_startup() {
    let c = cluster(Validity::default());
    let w = workload("web-token");
    std::fs::write(w.dir.join(CRT_FILE), "stale").unwrap();

    let result = Agent::start(c.config(&w), c.service.clone()).await;
    assert!(matches!(result, Err(Error::EndEntityConflict(_))));
    // Nothing generated either.
    assert_eq!(std::fs::read_dir(&w.dir).unwrap().count(), 1);
}

#[tokio::test]
async fn test_token_for_other_identity_is_rejected() {
    let c = cluster(Validity::default());
    let w = workload("api-token");

    let mut agent = Agent::start(c.config(&w), c.service.clone()).await.unwrap();
    assert_eq!(agent.renew().await, MIN_REFRESH);
    assert!(agent.current().is_none());
    assert!(!w.dir.join(CRT_FILE).exists());

    let csr = CsrOptions::new(c.web()).generate().unwrap();
    let err = c
        .service
        .certify(CertifyRequest {
            identity: c.web(),
            certificate_signing_request: csr.csr_der().to_vec(),
            token: b"api-token".to_vec(),
        })
        .await
        .unwrap_err();
    assert!(err.is_authorization());
}

#[test]
fn test_issuer_from_foreign_root_fails_to_load() {
    let domain = TrustDomain::new("linkerd", "cluster.local").unwrap();
    let trusted = TrustRoot::generate("root.linkerd.cluster.local", DAY).unwrap();
    let rogue = TrustRoot::generate("root.linkerd.cluster.local", DAY).unwrap();
    let creds = rogue
        .issue_issuer(&domain.issuer_name(), DAY)
        .unwrap()
        .into_credentials()
        .unwrap();

    let result = CertificateAuthority::new(
        creds,
        &trusted.trust_anchors().unwrap(),
        &domain.issuer_name(),
        Validity::default(),
    );
    assert!(matches!(result, Err(Error::IssuerVerification(_))));
}

#[tokio::test]
async fn test_issued_validity_matches_configuration() {
    let skew = Duration::from_secs(20);
    let lifetime = Duration::from_secs(7200);
    let c = cluster(Validity::new(skew, lifetime).unwrap());
    let w = workload("web-token");

    let before = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();
    let mut agent = Agent::start(c.config(&w), c.service.clone()).await.unwrap();
    agent.renew().await;
    let after = OffsetDateTime::now_utc();

    let crt = read_crt(&w.dir);
    let not_before = crt.not_before().unwrap();
    let not_after = crt.not_after().unwrap();
    assert_eq!(not_after - not_before, time::Duration::seconds(7220));
    assert!(not_before >= before - time::Duration::seconds(20));
    assert!(not_before <= after - time::Duration::seconds(20));
}

#[tokio::test]
async fn test_renewals_rotate_certificate_under_same_key() {
    let c = cluster(Validity::default());
    let w = workload("web-token");

    let mut agent = Agent::start(c.config(&w), c.service.clone()).await.unwrap();
    agent.renew().await;
    let first = read_crt(&w.dir);
    agent.renew().await;
    let second = read_crt(&w.dir);

    assert_ne!(first.fingerprint(), second.fingerprint());
    assert_eq!(second, agent.current().unwrap().leaf);
    assert_eq!(std::fs::read_dir(&w.dir).unwrap().count(), 3);
}

#[tokio::test]
async fn test_agents_for_distinct_identities() {
    let c = cluster(Validity::default());
    let api = c.domain.service_account_identity("api", "default").unwrap();

    let web_w = workload("web-token");
    let api_w = workload("api-token");
    let mut api_config = c.config(&api_w);
    api_config.name = api.clone();

    let mut web_agent = Agent::start(c.config(&web_w), c.service.clone())
        .await
        .unwrap();
    let mut api_agent = Agent::start(api_config, c.service.clone()).await.unwrap();
    tokio::join!(web_agent.renew(), api_agent.renew());

    assert_eq!(read_crt(&web_w.dir).dns_names().unwrap(), vec![c.web()]);
    assert_eq!(read_crt(&api_w.dir).dns_names().unwrap(), vec![api]);
}
