// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Hash adapter for node labels and tree digests.
//!
//! A label is the 32-byte SHA-256 commitment of a node. Leaves and internal
//! nodes are domain-separated by a one-byte tag, and an internal label covers
//! its balance byte, so the root label commits to the full shape of the tree.
//! A digest appends the root height to the root label; the height byte is
//! what lets a verifier bound its replay work without trusting the prover.

use anyhow::{Result, ensure};
use bytes::{BufMut, BytesMut};
use primitive_types::H256;
use sha2::{Digest, Sha256};

use crate::{ADDigest, ADKey, ADValue};

/// Byte length of a node label.
pub const LABEL_LENGTH: usize = 32;

/// Byte length of a tree digest: one label plus the trailing height byte.
pub const DIGEST_LENGTH: usize = LABEL_LENGTH + 1;

/// Domain tag hashed in front of leaf payloads.
const LEAF_PREFIX: u8 = 0x00;

/// Domain tag hashed in front of internal payloads.
const INTERNAL_PREFIX: u8 = 0x01;

pub type NodeLabel = H256;

/// `H(0x00 ‖ key ‖ value ‖ next_leaf_key)`
pub(crate) fn leaf_label(key: &ADKey, value: &ADValue, next_leaf_key: &ADKey) -> NodeLabel {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(key);
    hasher.update(value);
    hasher.update(next_leaf_key);
    H256::from_slice(&hasher.finalize())
}

/// `H(0x01 ‖ balance ‖ left.label ‖ right.label)`, balance −1 encoded `0xFF`.
pub(crate) fn internal_label(balance: i8, left: &NodeLabel, right: &NodeLabel) -> NodeLabel {
    let mut hasher = Sha256::new();
    hasher.update([INTERNAL_PREFIX, balance as u8]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    H256::from_slice(&hasher.finalize())
}

/// Assembles the 33-byte digest from a root label and the root height.
pub(crate) fn digest_of(label: &NodeLabel, height: usize) -> ADDigest {
    debug_assert!(height <= u8::MAX as usize);
    let mut bytes = BytesMut::with_capacity(DIGEST_LENGTH);
    bytes.put_slice(label.as_bytes());
    bytes.put_u8(height as u8);
    bytes.freeze()
}

/// Splits a digest into its label and (unsigned) height parts.
pub(crate) fn split_digest(digest: &ADDigest) -> Result<(NodeLabel, usize)> {
    ensure!(
        digest.len() == DIGEST_LENGTH,
        "digest must be {} bytes, got {}",
        DIGEST_LENGTH,
        digest.len()
    );
    let label = H256::from_slice(&digest[..LABEL_LENGTH]);
    Ok((label, digest[LABEL_LENGTH] as usize))
}
