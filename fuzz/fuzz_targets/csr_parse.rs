#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_identity::CertificationRequest;

fuzz_target!(|data: &[u8]| {
    if let Ok(csr) = CertificationRequest::from_der(data) {
        let _ = csr.ensure_identity("web.default.serviceaccount.identity.linkerd.cluster.local");
    }
});
