//! Random-input fuzzer for frame and payload decoding
//!
//! Arbitrary bytes must never panic the decoder. Anything that decodes must
//! re-encode to the same header and payload bytes.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tessera_proto::{Frame, Payload};

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else {
        return;
    };

    let mut encoded = BytesMut::with_capacity(frame.encoded_len());
    frame.encode(&mut encoded).expect("decoded frame must re-encode");
    let again = Frame::decode(&encoded).expect("re-encoded frame must decode");
    assert_eq!(again.header.to_bytes(), frame.header.to_bytes());
    assert_eq!(again.payload, frame.payload);

    // payload decoding may reject the bytes but must not panic
    let _ = Payload::from_frame(&frame);
});
