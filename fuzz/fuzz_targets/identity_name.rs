#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_identity::TrustDomain;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);
    let mut parts = s.splitn(3, '/');
    let (Some(sa), Some(ns)) = (parts.next(), parts.next()) else {
        return;
    };
    let domain = parts.next().unwrap_or("cluster.local");
    if let Ok(dom) = TrustDomain::new("linkerd", domain) {
        if let Ok(id) = dom.service_account_identity(sa, ns) {
            assert!(id.len() <= 253);
            assert!(id.is_ascii());
        }
    }
});
