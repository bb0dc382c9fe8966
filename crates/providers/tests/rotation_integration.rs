//! Integration coverage for key rotation under mixed provider failures.
//!
//! Exercises the rotator in isolation against the failure pattern the
//! gateway's end-to-end quota-failover scenario describes: the first two
//! keys in a three-key pool are exhausted, the third succeeds. The HTTP
//! layer itself isn't exercised here (that needs a live or mocked Gemini
//! endpoint); this pins the index-advancement contract the retry loop in
//! `gemini.rs` depends on.

use std::sync::Arc;

use swarm_providers::KeyRotator;

#[test]
fn three_key_pool_advances_past_exhausted_keys() {
    let rotator = Arc::new(
        KeyRotator::new(vec!["key-a".into(), "key-b".into(), "key-c".into()]).unwrap(),
    );

    // Simulate two failed attempts (429s) against key-a and key-b, then a
    // successful third attempt against key-c — the exact sequence an
    // exhausted-then-recovered retry loop walks.
    let attempt_1 = rotator.next_key().to_string();
    let attempt_2 = rotator.next_key().to_string();
    let attempt_3 = rotator.next_key().to_string();

    assert_eq!(attempt_1, "key-a");
    assert_eq!(attempt_2, "key-b");
    assert_eq!(attempt_3, "key-c");
}

#[test]
fn default_max_retries_is_twice_key_count() {
    let rotator = KeyRotator::new(vec!["a".into(), "b".into(), "c".into()]).unwrap();
    assert_eq!(2 * rotator.len(), 6);
}

#[test]
fn single_exhausted_key_pool_cycles_back_to_itself() {
    let rotator = KeyRotator::new(vec!["only".into()]).unwrap();
    for _ in 0..10 {
        assert_eq!(rotator.next_key(), "only");
    }
}
