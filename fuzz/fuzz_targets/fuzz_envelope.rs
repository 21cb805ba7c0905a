#![no_main]

use libfuzzer_sys::fuzz_target;
use persistent_connection::envelope;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    // Decoding must never panic, whatever the frame looks like.
    let Ok(env) = envelope::decode(raw) else {
        return;
    };
    let _ = env.payloads().count();

    // Anything that decodes must survive re-encoding.
    if let Ok(encoded) = env.encode() {
        let again = envelope::decode(&encoded).expect("re-encoded envelope must decode");
        assert_eq!(again.message_id, env.message_id);
        assert_eq!(again.connection_id, env.connection_id);
    }
});
