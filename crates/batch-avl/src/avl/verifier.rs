// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! The replay side of the dictionary: reconstructs the touched part of the
//! pre-batch tree out of a proof, checks it against the starting digest, and
//! re-executes the batch against it by consuming the recorded direction bits.

use anyhow::{Result, bail, ensure};
use bytes::Bytes;
use thiserror::Error;

use super::hash;
use super::node_type::{NodeRef, internal_parts, label_of, leaf_parts};
use super::proof::{self, malformed};
use super::{AVLTree, AuthenticatedTreeOps};
use crate::operation::Modification;
use crate::{ADDigest, ADKey, ADValue};

/// Failure families of proof verification. Every failure is sticky: once a
/// check fails the verifier's digest stays `None` for the rest of the batch.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum VerificationError {
    /// Unreadable skeleton, stack invariant violated, or length envelope
    /// exceeded.
    #[error("proof is malformed: {0}")]
    ProofMalformed(String),

    /// Reconstructed root label differs from the starting digest.
    #[error("reconstructed root label does not match the starting digest")]
    DigestMismatch,

    /// The proof does not convey the leaf a replayed modification needs.
    #[error("the proof does not convey the leaf required by this modification")]
    ModificationInapplicable,

    /// Replayed insert/delete counts do not fit the declared envelope.
    #[error("replayed modifications do not fit the declared envelope")]
    EnvelopeMismatch,
}

/// Verifier over one batch proof.
///
/// Construction reconstructs the prover's pre-batch tree restricted to the
/// nodes the batch touched and compares its root label against
/// `starting_digest`. The caller then replays, in order, the successful
/// modifications of the batch; [`digest`](Self::digest) yields the post-batch
/// digest, or `None` if anything failed along the way.
pub struct BatchAVLVerifier {
    tree: AVLTree,
    proof: Bytes,
    /// Byte offset of the direction bitstream inside `proof`.
    directions_start: usize,
    /// Bit cursor of the next unread direction.
    directions_index: usize,
    replay_index: usize,
    last_right_step: usize,
    valid: bool,
    max_inserts: Option<usize>,
    max_deletes: Option<usize>,
    inserts_performed: usize,
    deletes_performed: usize,
}

impl BatchAVLVerifier {
    /// Reconstructs the partial tree held in `proof` and binds it to
    /// `starting_digest`. When both envelope bounds are declared the proof
    /// length is additionally capped before anything is parsed.
    pub fn new(
        starting_digest: &ADDigest,
        proof: &Bytes,
        key_length: usize,
        value_length: usize,
        max_inserts: Option<usize>,
        max_deletes: Option<usize>,
    ) -> Result<Self> {
        let (expected_label, height) = hash::split_digest(starting_digest)?;
        if let (Some(inserts), Some(deletes)) = (max_inserts, max_deletes) {
            let bound = proof::length_bound(height, inserts, deletes, key_length, value_length);
            if proof.len() > bound {
                return Err(malformed("proof exceeds the declared envelope"));
            }
        }
        let (root, directions_start) = proof::unpack_tree(proof, key_length, value_length)?;
        let label = label_of(&root);
        ensure!(label == expected_label, VerificationError::DigestMismatch);
        Ok(BatchAVLVerifier {
            tree: AVLTree::new_with_root(root, height, key_length, value_length),
            proof: proof.clone(),
            directions_start,
            directions_index: 0,
            replay_index: 0,
            last_right_step: 0,
            valid: true,
            max_inserts,
            max_deletes,
            inserts_performed: 0,
            deletes_performed: 0,
        })
    }

    /// Replays one modification against the reconstructed tree. Failures are
    /// sticky; replaying past a failure keeps failing.
    pub fn perform_one_modification(
        &mut self,
        modification: &Modification,
    ) -> Result<Option<ADValue>> {
        ensure!(self.valid, "verifier is in failed state");
        let found = match self.return_result_of_one_modification(modification) {
            Ok(found) => found,
            Err(e) => {
                self.valid = false;
                return Err(e);
            }
        };
        match modification {
            Modification::Insert(_) => self.inserts_performed += 1,
            Modification::InsertOrUpdate(_) | Modification::UpdateLongBy { .. }
                if found.is_none() =>
            {
                self.inserts_performed += 1
            }
            Modification::Remove(_) => self.deletes_performed += 1,
            Modification::RemoveIfExists(_) if found.is_some() => self.deletes_performed += 1,
            _ => {}
        }
        if self.max_inserts.is_some_and(|max| self.inserts_performed > max)
            || self.max_deletes.is_some_and(|max| self.deletes_performed > max)
        {
            self.valid = false;
            bail!(VerificationError::EnvelopeMismatch);
        }
        Ok(found)
    }

    /// The digest the replay has reached, or `None` once any check failed or
    /// while the replayed insert/delete counts differ from a declared
    /// envelope.
    pub fn digest(&self) -> Option<ADDigest> {
        if !self.valid {
            return None;
        }
        if self.max_inserts.is_some_and(|max| self.inserts_performed != max)
            || self.max_deletes.is_some_and(|max| self.deletes_performed != max)
        {
            return None;
        }
        Some(hash::digest_of(&label_of(&self.tree.root), self.tree.height))
    }

    fn direction_bit(&self, index: usize) -> Result<u8> {
        let byte = self
            .proof
            .get(self.directions_start + (index >> 3))
            .copied()
            .ok_or_else(|| malformed("direction stream exhausted"))?;
        Ok((byte >> (index & 7)) & 1)
    }
}

impl AuthenticatedTreeOps for BatchAVLVerifier {
    fn tree(&self) -> &AVLTree {
        &self.tree
    }

    fn tree_mut(&mut self) -> &mut AVLTree {
        &mut self.tree
    }

    fn begin_modification(&mut self) {
        self.replay_index = self.directions_index;
    }

    fn next_direction_is_left(&mut self, _key: &ADKey, node: &NodeRef) -> Result<bool> {
        // the node is only consulted for its kind; routing decisions come
        // from the recorded stream
        internal_parts(node)?;
        let bit = self.direction_bit(self.directions_index)?;
        if bit == 0 {
            self.last_right_step = self.directions_index;
        }
        self.directions_index += 1;
        Ok(bit != 0)
    }

    fn key_matches_leaf(&mut self, key: &ADKey, leaf: &NodeRef) -> Result<bool> {
        let (leaf_key, _, next) = leaf_parts(leaf)?;
        if *key == leaf_key {
            return Ok(true);
        }
        ensure!(
            leaf_key < *key && *key < next,
            VerificationError::ModificationInapplicable
        );
        Ok(false)
    }

    fn replay_comparison(&mut self) -> Result<i32> {
        if self.replay_index >= self.directions_index {
            return Err(malformed("removal replay ran past the recorded directions"));
        }
        let bit = self.direction_bit(self.replay_index)?;
        let ret = if self.replay_index == self.last_right_step {
            0
        } else if bit == 0 && self.replay_index < self.last_right_step {
            1
        } else {
            -1
        };
        self.replay_index += 1;
        Ok(ret)
    }

    fn on_node_visit(&mut self, _node: &NodeRef) {}
}
