// SPDX-License-Identifier: Apache-2.0
//! Property-based coverage of the canonical encoder: round-trip and
//! determinism hold over a wide swath of generated `CanonicalValue` shapes,
//! not just the handful of literal cases the unit tests in `codec.rs` cover.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use fantasim_core::{decode_canonical, encode_canonical, CanonicalMap, CanonicalValue};
use proptest::prelude::*;
use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};

fn leaf_value() -> impl Strategy<Value = CanonicalValue> {
    prop_oneof![
        Just(CanonicalValue::Nil),
        any::<bool>().prop_map(CanonicalValue::Bool),
        any::<i64>().prop_map(CanonicalValue::Int),
        any::<u64>().prop_map(CanonicalValue::UInt),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(CanonicalValue::Float),
        ".{0,16}".prop_map(CanonicalValue::Str),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(CanonicalValue::Bytes),
    ]
}

/// One level of `Array`/`Map` nesting over [`leaf_value`]. Map keys that
/// collide within a single generated case are simply skipped rather than
/// rejected, since the property under test is round-tripping, not
/// `CanonicalMap::insert`'s own duplicate-key behavior (covered in
/// `codec.rs`'s unit tests).
fn nested_value() -> impl Strategy<Value = CanonicalValue> {
    prop_oneof![
        3 => leaf_value(),
        1 => prop::collection::vec(leaf_value(), 0..4).prop_map(CanonicalValue::Array),
        1 => prop::collection::vec(("[a-z]{1,8}", leaf_value()), 0..4).prop_map(|pairs| {
            let mut map = CanonicalMap::new();
            for (key, value) in pairs {
                let _ = map.insert(key, value);
            }
            CanonicalValue::Map(map)
        }),
    ]
}

#[test]
fn encode_decode_round_trips_over_generated_values() {
    // Pinned seed: a property-test failure here must reproduce identically
    // on every machine and in CI, not just locally.
    const SEED_BYTES: [u8; 32] = [
        0x07, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0,
    ];
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &SEED_BYTES);
    let mut runner = TestRunner::new_with_rng(PropConfig::default(), rng);

    runner
        .run(&nested_value(), |value| {
            let encoded = encode_canonical(&value).expect("well-formed values always encode");
            let decoded = decode_canonical(&encoded).expect("bytes we just wrote always decode");
            prop_assert_eq!(decoded, value);
            Ok(())
        })
        .expect("property test with pinned seed should complete");
}

#[test]
fn encoding_is_deterministic_across_repeated_calls() {
    const SEED_BYTES: [u8; 32] = [
        0x08, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0,
    ];
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &SEED_BYTES);
    let mut runner = TestRunner::new_with_rng(PropConfig::default(), rng);

    runner
        .run(&nested_value(), |value| {
            let first = encode_canonical(&value).expect("encode");
            let second = encode_canonical(&value).expect("encode");
            prop_assert_eq!(first, second);
            Ok(())
        })
        .expect("property test with pinned seed should complete");
}
