//! Property-based tests for wire-format negotiation.
//!
//! - Negotiated version is the minimum of both advertised versions
//! - Negotiated max inactivity is the minimum of both durations
//! - Both sides compute the same result (commutativity)
//! - Negotiating twice with the same inputs gives the same result

use std::time::{Duration, Instant};

use proptest::prelude::*;
use tessera_core::{
    connection::{Connection, ConnectionAction, ConnectionConfig},
    error::TransportError,
    wire_format::{WireFormatCapabilities, negotiate},
};
use tessera_proto::Payload;

fn capabilities_strategy() -> impl Strategy<Value = WireFormatCapabilities> {
    (1u32..=12, any::<[bool; 5]>(), 0u64..=120_000).prop_map(|(version, flags, inactivity)| {
        WireFormatCapabilities {
            version,
            stack_trace_enabled: flags[0],
            tcp_no_delay_enabled: flags[1],
            cache_enabled: flags[2],
            tight_encoding_enabled: flags[3],
            size_prefix_disabled: flags[4],
            max_inactivity: Duration::from_millis(inactivity),
        }
    })
}

#[test]
fn prop_version_and_inactivity_are_minimums() {
    proptest!(|(local in capabilities_strategy(), remote in capabilities_strategy())| {
        let negotiated = negotiate(&local, &remote.to_info()).expect("valid versions");

        prop_assert_eq!(negotiated.version, local.version.min(remote.version));
        prop_assert_eq!(negotiated.max_inactivity, local.max_inactivity.min(remote.max_inactivity));
    });
}

#[test]
fn prop_features_require_both_sides() {
    proptest!(|(local in capabilities_strategy(), remote in capabilities_strategy())| {
        let negotiated = negotiate(&local, &remote.to_info()).expect("valid versions");

        prop_assert_eq!(negotiated.cache_enabled, local.cache_enabled && remote.cache_enabled);
        prop_assert_eq!(
            negotiated.tight_encoding_enabled,
            local.tight_encoding_enabled && remote.tight_encoding_enabled
        );
        prop_assert_eq!(
            negotiated.tcp_no_delay_enabled,
            local.tcp_no_delay_enabled && remote.tcp_no_delay_enabled
        );
    });
}

#[test]
fn prop_both_sides_agree() {
    proptest!(|(a in capabilities_strategy(), b in capabilities_strategy())| {
        let from_a = negotiate(&a, &b.to_info()).expect("valid versions");
        let from_b = negotiate(&b, &a.to_info()).expect("valid versions");
        prop_assert_eq!(from_a, from_b);
    });
}

#[test]
fn prop_negotiation_is_idempotent() {
    proptest!(|(local in capabilities_strategy(), remote in capabilities_strategy())| {
        let first = negotiate(&local, &remote.to_info()).expect("valid versions");
        let second = negotiate(&local, &remote.to_info()).expect("valid versions");
        prop_assert_eq!(first, second);

        let again = negotiate(&first, &first.to_info()).expect("valid versions");
        prop_assert_eq!(again, first);
    });
}

#[test]
fn prop_version_zero_always_mismatches() {
    proptest!(|(local in capabilities_strategy(), remote in capabilities_strategy())| {
        let remote = WireFormatCapabilities { version: 0, ..remote };
        let result = negotiate(&local, &remote.to_info());
        prop_assert!(matches!(result, Err(TransportError::NegotiationMismatch(_))));
    });
}

#[test]
fn prop_connection_pair_converges_on_same_capabilities() {
    proptest!(|(a in capabilities_strategy(), b in capabilities_strategy())| {
        let now = Instant::now();
        let mut left = Connection::new(now, ConnectionConfig { wire_format: a, ..ConnectionConfig::default() });
        let mut right = Connection::new(now, ConnectionConfig { wire_format: b, ..ConnectionConfig::default() });

        let from_left = first_frame(left.start(now).expect("start"));
        let from_right = first_frame(right.start(now).expect("start"));

        let left_result = left.handle_frame(&from_right, now).expect("left negotiates");
        let right_result = right.handle_frame(&from_left, now).expect("right negotiates");

        prop_assert_eq!(&left_result, &right_result);
        prop_assert_eq!(left.negotiated(), right.negotiated());
    });
}

fn first_frame(actions: Vec<ConnectionAction>) -> tessera_proto::Frame {
    match actions.into_iter().next() {
        Some(ConnectionAction::SendFrame(frame)) => {
            assert!(matches!(Payload::from_frame(&frame), Ok(Payload::WireFormatInfo(_))));
            frame
        },
        other => panic!("expected negotiation frame, got {other:?}"),
    }
}
