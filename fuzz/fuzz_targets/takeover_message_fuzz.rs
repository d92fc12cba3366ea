#![no_main]
use leapfrog::modules::takeover::{TakeoverData, TakeoverMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = serde_json::from_slice::<TakeoverMessage>(data) {
        let _ = message.name();
        if let TakeoverMessage::Batch { data } = message {
            // No handles arrive with fuzzed frames, so any non-empty batch
            // must be rejected.
            let expected_ok = data.mounts.is_empty();
            let result = TakeoverData::from_parts(data, Vec::new());
            if !expected_ok {
                assert!(result.is_err());
            }
        }
    }
});
