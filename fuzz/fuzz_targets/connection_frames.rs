//! Feeds arbitrary frame sequences into a negotiating connection
//!
//! Input is split into length-prefixed chunks; each chunk that decodes as a
//! frame is handed to the connection, with a tick between frames. The state
//! machine may fail the connection but must never panic, and once failed
//! it must stay failed.

#![no_main]

use std::time::{Duration, Instant};

use libfuzzer_sys::fuzz_target;
use tessera_core::connection::{Connection, ConnectionConfig, ConnectionPhase};
use tessera_proto::Frame;

fuzz_target!(|data: &[u8]| {
    let mut now = Instant::now();
    let mut connection = Connection::new(now, ConnectionConfig::default());
    let Ok(_) = connection.start(now) else {
        return;
    };

    let mut rest = data;
    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len).min(tail.len());
        let (chunk, tail) = tail.split_at(len);
        rest = tail;

        now += Duration::from_millis(u64::from(len));
        let _ = connection.tick(now);

        let Ok(frame) = Frame::decode(chunk) else {
            continue;
        };
        let failed = connection.phase() == ConnectionPhase::Failed;
        let _ = connection.handle_frame(&frame, now);
        if failed {
            assert_eq!(connection.phase(), ConnectionPhase::Failed);
        }
    }
});
