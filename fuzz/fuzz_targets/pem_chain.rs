#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_identity::TrustAnchors;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);
    if let Ok(anchors) = TrustAnchors::from_pem(&s) {
        let _ = anchors.webpki_anchors();
    }
});
