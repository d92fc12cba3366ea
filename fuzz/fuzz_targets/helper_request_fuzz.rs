#![no_main]
use leapfrog::modules::channel::{Channel, Frame};
use leapfrog::modules::constants::HELPER_PROTOCOL_VERSION;
use leapfrog::modules::privhelper::protocol::HelperEnvelope;
use leapfrog::modules::privhelper::{HelperPolicy, HelperServer, PrivilegedRequest, SystemMounter};
use libfuzzer_sys::fuzz_target;
use std::path::PathBuf;

fuzz_target!(|data: &[u8]| {
    let Ok((server_end, _client_end)) = Channel::pair() else {
        return;
    };
    // An empty allow-list keeps every request away from the real mount table.
    let policy = HelperPolicy::new(Vec::<PathBuf>::new());
    let mut server = HelperServer::new(server_end, SystemMounter::new(65534, 65534), policy);

    let handshake = HelperEnvelope {
        xid: 0,
        body: PrivilegedRequest::Handshake {
            version: HELPER_PROTOCOL_VERSION,
        },
    };
    if let Ok(body) = serde_json::to_vec(&handshake) {
        let _ = server.handle_frame(Frame {
            body,
            handles: Vec::new(),
        });
    }

    let (response, handles) = server.handle_frame(Frame {
        body: data.to_vec(),
        handles: Vec::new(),
    });
    assert!(handles.is_empty() || response.body.is_ok());
});
