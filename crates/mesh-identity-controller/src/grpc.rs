//! gRPC transport for the Certify API.

use mesh_identity::service::{CertifyRequest, IdentityService};
use mesh_identity::token::TokenValidator;
use mesh_identity::Error;
use mesh_identity_proto::{v1, Identity, IdentityServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::info;

/// Adapts [`IdentityService`] to the generated `Identity` service trait.
pub struct CertifyRpc<V> {
    service: Arc<IdentityService<V>>,
}

impl<V> CertifyRpc<V> {
    pub fn new(service: Arc<IdentityService<V>>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl<V: TokenValidator + 'static> Identity for CertifyRpc<V> {
    async fn certify(
        &self,
        request: Request<v1::CertifyRequest>,
    ) -> Result<Response<v1::CertifyResponse>, Status> {
        let req = request.into_inner();
        let rsp = self
            .service
            .certify(CertifyRequest {
                identity: req.identity,
                certificate_signing_request: req.certificate_signing_request,
                token: req.token,
            })
            .await
            .map_err(status_from_error)?;

        Ok(Response::new(v1::CertifyResponse {
            leaf_certificate: rsp.leaf_certificate,
            intermediate_certificates: rsp.intermediate_certificates,
        }))
    }
}

/// Maps a library error to the status returned to the caller.
pub fn status_from_error(err: Error) -> Status {
    match &err {
        Error::TokenInvalid(_) => Status::unauthenticated(err.to_string()),
        Error::IdentityMismatch { .. } => Status::permission_denied(err.to_string()),
        Error::InvalidName(_) | Error::Csr(_) => Status::invalid_argument(err.to_string()),
        Error::TokenReview(_) => Status::unavailable(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

/// Binds `addr` and serves until `shutdown` is cancelled.
pub async fn serve<V: TokenValidator + 'static>(
    addr: SocketAddr,
    service: Arc<IdentityService<V>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "identity service listening");
    serve_with_listener(listener, service, shutdown).await?;
    Ok(())
}

/// Serves on an already bound listener. In-flight calls are drained on
/// shutdown.
pub async fn serve_with_listener<V: TokenValidator + 'static>(
    listener: TcpListener,
    service: Arc<IdentityService<V>>,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    tonic::transport::Server::builder()
        .add_service(IdentityServer::new(CertifyRpc::new(service)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await;
            info!("identity service shutting down");
        })
        .await
}
