// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! The modification vocabulary of a batch. Every element of a batch targets a
//! single key and carries update-function semantics: given the current value
//! of the key (if any), it resolves to keeping the dictionary unchanged,
//! writing a value, or removing the key. The prover and the verifier resolve
//! modifications with identical code, which is what keeps a replayed batch in
//! lockstep with the recorded one.

use anyhow::Result;
use bytes::Bytes;
#[cfg(any(test, feature = "fuzzing"))]
use proptest::prelude::*;
#[cfg(any(test, feature = "fuzzing"))]
use proptest_derive::Arbitrary;
use thiserror::Error;

use crate::{ADKey, ADValue};

/// A key together with the value inserted or written for it.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(any(test, feature = "fuzzing"), derive(Arbitrary))]
pub struct KeyValue {
    #[cfg_attr(
        any(test, feature = "fuzzing"),
        proptest(strategy = "arb_key()")
    )]
    pub key: ADKey,
    #[cfg_attr(
        any(test, feature = "fuzzing"),
        proptest(strategy = "arb_value()")
    )]
    pub value: ADValue,
}

/// Keys drawn byte-wise from the non-sentinel range, so a generated key can
/// never collide with the chain sentinels.
#[cfg(any(test, feature = "fuzzing"))]
fn arb_key() -> impl Strategy<Value = ADKey> {
    proptest::collection::vec(1u8..=0xFE, crate::DEFAULT_KEY_LENGTH).prop_map(Bytes::from)
}

#[cfg(any(test, feature = "fuzzing"))]
fn arb_value() -> impl Strategy<Value = ADValue> {
    proptest::collection::vec(any::<u8>(), crate::DEFAULT_VALUE_LENGTH).prop_map(Bytes::from)
}

/// Failure raised by a modification against the live dictionary. The tree is
/// left byte-identical to its state before the failing call and the batch may
/// continue.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ModificationError {
    #[error("key is already present in the dictionary")]
    DuplicateKey,

    #[error("key is not present in the dictionary")]
    MissingKey,

    #[error("cannot seed an absent counter with a negative delta")]
    NegativeDelta,

    #[error("counter update overflows a signed 64-bit value")]
    ArithmeticOverflow,

    #[error("counter values must be exactly 8 bytes, got {0}")]
    BadCounterWidth(usize),

    #[error("key length {got} does not match the tree key length {expected}")]
    KeyLength { got: usize, expected: usize },

    #[error("value length {got} does not match the tree value length {expected}")]
    ValueLength { got: usize, expected: usize },

    #[error("the all-zero and all-0xFF keys are reserved chain sentinels")]
    ReservedKey,
}

/// What a modification decided once the target leaf was resolved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Resolution {
    /// Pure lookup; nothing changes.
    Unchanged,
    /// Insert or update the key with this value.
    Write(ADValue),
    /// Remove the key and its leaf.
    Delete,
}

/// One element of a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Modification {
    /// Writes a fresh key; fails with [`ModificationError::DuplicateKey`] if
    /// the key already exists.
    Insert(KeyValue),
    /// Overwrites an existing key; fails with
    /// [`ModificationError::MissingKey`] if the key is absent.
    Update(KeyValue),
    /// Writes the value whether or not the key exists.
    InsertOrUpdate(KeyValue),
    /// Removes an existing key; fails with
    /// [`ModificationError::MissingKey`] if the key is absent.
    Remove(ADKey),
    /// Removes the key when present; succeeds silently (digest unchanged)
    /// when it is absent.
    RemoveIfExists(ADKey),
    /// Treats the value as a big-endian signed 64-bit counter and adds
    /// `delta` to it. An absent key is seeded with `delta` when the delta is
    /// non-negative; overflow fails the modification.
    UpdateLongBy { key: ADKey, delta: i64 },
    /// Reads the current value without changing the tree. The descent is
    /// still part of the proof, so replayed lookups are authenticated.
    Lookup(ADKey),
}

impl Modification {
    /// The key this modification targets.
    pub fn key(&self) -> &ADKey {
        match self {
            Modification::Insert(kv)
            | Modification::Update(kv)
            | Modification::InsertOrUpdate(kv) => &kv.key,
            Modification::Remove(key)
            | Modification::RemoveIfExists(key)
            | Modification::UpdateLongBy { key, .. }
            | Modification::Lookup(key) => key,
        }
    }

    /// Applies the update-function semantics to the current value of the
    /// target key, if any.
    pub(crate) fn resolve(&self, old: Option<&ADValue>) -> Result<Resolution> {
        match (self, old) {
            (Modification::Insert(_), Some(_)) => Err(ModificationError::DuplicateKey.into()),
            (Modification::Insert(kv), None) => Ok(Resolution::Write(kv.value.clone())),
            (Modification::Update(kv), Some(_)) => Ok(Resolution::Write(kv.value.clone())),
            (Modification::Update(_), None) => Err(ModificationError::MissingKey.into()),
            (Modification::InsertOrUpdate(kv), _) => Ok(Resolution::Write(kv.value.clone())),
            (Modification::Remove(_), Some(_)) => Ok(Resolution::Delete),
            (Modification::Remove(_), None) => Err(ModificationError::MissingKey.into()),
            (Modification::RemoveIfExists(_), Some(_)) => Ok(Resolution::Delete),
            (Modification::RemoveIfExists(_), None) => Ok(Resolution::Unchanged),
            (Modification::UpdateLongBy { delta, .. }, old) => resolve_counter(*delta, old),
            (Modification::Lookup(_), _) => Ok(Resolution::Unchanged),
        }
    }
}

fn resolve_counter(delta: i64, old: Option<&ADValue>) -> Result<Resolution> {
    match old {
        None if delta < 0 => Err(ModificationError::NegativeDelta.into()),
        None => Ok(Resolution::Write(counter_to_value(delta))),
        Some(value) => {
            let current = value_to_counter(value)?;
            let next = current
                .checked_add(delta)
                .ok_or(ModificationError::ArithmeticOverflow)?;
            Ok(Resolution::Write(counter_to_value(next)))
        }
    }
}

/// Encodes a signed 64-bit counter as the big-endian value bytes used by
/// [`Modification::UpdateLongBy`].
pub fn counter_to_value(value: i64) -> ADValue {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Decodes the big-endian signed 64-bit counter held in `value`.
pub fn value_to_counter(value: &ADValue) -> Result<i64> {
    let bytes: [u8; 8] = value
        .as_ref()
        .try_into()
        .map_err(|_| ModificationError::BadCounterWidth(value.len()))?;
    Ok(i64::from_be_bytes(bytes))
}
