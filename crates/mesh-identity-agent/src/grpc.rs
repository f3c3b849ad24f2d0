use async_trait::async_trait;
use mesh_identity::service::{CertifyClient, CertifyRequest, CertifyResponse};
use mesh_identity::{Error, Result};
use mesh_identity_proto::{v1, IdentityClient};
use tonic::transport::{Channel, Endpoint};

/// Certify client over a lazily connected gRPC channel.
#[derive(Debug, Clone)]
pub struct GrpcCertifyClient {
    client: IdentityClient<Channel>,
}

impl GrpcCertifyClient {
    /// Creates a client for `addr`. The connection is established on the
    /// first call and re-established after failures.
    pub fn new(addr: impl Into<String>) -> anyhow::Result<Self> {
        let channel = Endpoint::from_shared(addr.into())?.connect_lazy();
        Ok(Self {
            client: IdentityClient::new(channel),
        })
    }
}

#[async_trait]
impl CertifyClient for GrpcCertifyClient {
    async fn certify(&self, request: CertifyRequest) -> Result<CertifyResponse> {
        let mut client = self.client.clone();
        let rsp = client
            .certify(v1::CertifyRequest {
                identity: request.identity,
                token: request.token,
                certificate_signing_request: request.certificate_signing_request,
            })
            .await
            .map_err(|status| Error::Rpc(format!("{}: {}", status.code(), status.message())))?
            .into_inner();

        Ok(CertifyResponse {
            leaf_certificate: rsp.leaf_certificate,
            intermediate_certificates: rsp.intermediate_certificates,
        })
    }
}
