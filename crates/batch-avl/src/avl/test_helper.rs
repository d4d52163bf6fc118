// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the dictionary tests.

use bytes::Bytes;
use rand::Rng;
use rand::rngs::StdRng;

use super::prover::BatchAVLProver;
use super::verifier::BatchAVLVerifier;
use crate::operation::{KeyValue, Modification};
use crate::{ADDigest, ADKey, ADValue, DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH};

pub(crate) fn new_prover() -> BatchAVLProver {
    BatchAVLProver::new(DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH)
}

pub(crate) fn random_key(rng: &mut StdRng) -> ADKey {
    loop {
        let mut key = [0u8; DEFAULT_KEY_LENGTH];
        rng.fill(&mut key[..]);
        if key != [0u8; DEFAULT_KEY_LENGTH] && key != [0xFFu8; DEFAULT_KEY_LENGTH] {
            return Bytes::copy_from_slice(&key);
        }
    }
}

pub(crate) fn random_value(rng: &mut StdRng) -> ADValue {
    let mut value = [0u8; DEFAULT_VALUE_LENGTH];
    rng.fill(&mut value[..]);
    Bytes::copy_from_slice(&value)
}

pub(crate) fn random_kv(rng: &mut StdRng) -> KeyValue {
    KeyValue {
        key: random_key(rng),
        value: random_value(rng),
    }
}

/// A key with `seed` as its first byte, zero-padded to the default length.
pub(crate) fn key_from_byte(seed: u8) -> ADKey {
    let mut key = vec![0u8; DEFAULT_KEY_LENGTH];
    key[0] = seed;
    Bytes::from(key)
}

/// A key holding `seed` big-endian in its trailing bytes, so ascending seeds
/// produce ascending keys.
pub(crate) fn key_from_u64(seed: u64) -> ADKey {
    let mut key = vec![0u8; DEFAULT_KEY_LENGTH];
    key[DEFAULT_KEY_LENGTH - 8..].copy_from_slice(&seed.to_be_bytes());
    Bytes::from(key)
}

pub(crate) fn value_from_u64(seed: u64) -> ADValue {
    Bytes::copy_from_slice(&seed.to_be_bytes())
}

/// Replays `modifications` against `proof` and asserts the verifier lands on
/// `expected`.
pub(crate) fn replay_and_check(
    starting_digest: &ADDigest,
    proof: &Bytes,
    modifications: &[Modification],
    max_inserts: Option<usize>,
    max_deletes: Option<usize>,
    expected: &ADDigest,
) {
    let mut verifier = BatchAVLVerifier::new(
        starting_digest,
        proof,
        DEFAULT_KEY_LENGTH,
        DEFAULT_VALUE_LENGTH,
        max_inserts,
        max_deletes,
    )
    .expect("proof must reconstruct against the starting digest");
    for modification in modifications {
        verifier
            .perform_one_modification(modification)
            .expect("replaying a successful modification must succeed");
    }
    assert_eq!(
        verifier.digest().expect("verifier must stay valid"),
        *expected
    );
}
