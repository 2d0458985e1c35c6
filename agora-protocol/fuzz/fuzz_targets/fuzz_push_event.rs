#![no_main]
use libfuzzer_sys::fuzz_target;

/// Fuzz push event and command decoding.
///
/// Tests:
/// - Arbitrary bytes never panic the JSON decoders
/// - Decoded events re-encode and yield a stable mutation key

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = serde_json::from_slice::<agora_protocol::PushEvent>(data) {
        let _ = event.conversation_id();
        let first = event.mutation_key();
        let second = event.mutation_key();
        assert_eq!(first, second);
    }
    let _ = serde_json::from_slice::<agora_protocol::Command>(data);
    let _ = serde_json::from_slice::<agora_protocol::CommandResponse>(data);
});
