//! Generated gRPC types for the identity service.

/// `mesh.identity.v1`: the Certify RPC.
pub mod v1 {
    tonic::include_proto!("mesh.identity.v1");
}

pub use v1::identity_client::IdentityClient;
pub use v1::identity_server::{Identity, IdentityServer};
pub use v1::{CertifyRequest, CertifyResponse};
