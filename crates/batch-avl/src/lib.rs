// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
//! This crate implements a batched authenticated AVL dictionary: an untrusted
//! *prover* maintains an ordered key→value dictionary while a *verifier*
//! stores nothing but a 33-byte digest (the Merkle-style root label plus the
//! tree height). After applying a batch of modifications the prover emits a
//! compact proof; any party holding the pre-batch digest can replay the same
//! modifications against the proof and derive the post-batch digest, which
//! attests that the prover followed the protocol.
//!
//! The public entry points are [`BatchAVLProver`] for the mutable side,
//! [`BatchAVLVerifier`] for the replay side, and
//! [`PersistentBatchAVLProver`] for a prover whose committed batches are
//! durable in a [`VersionedAVLStore`] and can be rolled back to any prior
//! digest.

mod avl;
mod operation;

pub use avl::hash::{DIGEST_LENGTH, LABEL_LENGTH, NodeLabel};
pub use avl::node_type::{Node, NodeDecodeError, NodeRef};
pub use avl::prover::BatchAVLProver;
pub use avl::storage::{InMemoryVersionedStore, PersistentBatchAVLProver, VersionedAVLStore};
pub use avl::verifier::{BatchAVLVerifier, VerificationError};
pub use operation::{KeyValue, Modification, ModificationError, counter_to_value, value_to_counter};

/// A dictionary key: a fixed-length opaque byte string. The all-zero and
/// all-`0xFF` keys of the tree's key length are reserved chain sentinels and
/// are rejected as user keys.
pub type ADKey = bytes::Bytes;

/// A dictionary value: a fixed-length opaque byte string.
pub type ADValue = bytes::Bytes;

/// A tree digest: the root label followed by one byte holding the root
/// height. The height byte is unsigned; a reader holding it in a signed byte
/// adds 256 to negative values.
pub type ADDigest = bytes::Bytes;

/// Key length used when none is specified.
pub const DEFAULT_KEY_LENGTH: usize = 32;

/// Value length used when none is specified.
pub const DEFAULT_VALUE_LENGTH: usize = 8;
