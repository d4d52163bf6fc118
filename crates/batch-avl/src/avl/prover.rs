// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! The mutable side of the dictionary: applies modifications to the live
//! tree, records every descent decision, and packages the touched part of
//! the pre-batch tree into a proof.

use anyhow::{Result, ensure};
use bytes::Bytes;
use tracing::debug;

use super::hash;
use super::node_type::{
    Node, NodeRef, clear_visited, internal_parts, is_visited, label_of, leaf_parts, mark_visited,
    reset_new,
};
use super::proof;
use super::{AVLTree, AuthenticatedTreeOps};
use crate::operation::Modification;
use crate::{ADDigest, ADKey, ADValue};

/// Prover over a batched authenticated AVL dictionary.
///
/// A batch is the sequence of successful modifications between two
/// [`generate_proof`](Self::generate_proof) calls. During a batch the touched
/// spine is rebuilt out of fresh nodes while the pre-batch tree stays intact;
/// the proof serializes the pre-batch shape of everything the batch touched,
/// so a verifier can reconstruct it, check it against the pre-batch digest,
/// and replay the batch.
pub struct BatchAVLProver {
    tree: AVLTree,
    /// Root of the tree as of the last generated proof.
    old_root: NodeRef,
    directions: Vec<u8>,
    directions_bit_length: usize,
    replay_index: usize,
    last_right_step: usize,
}

impl BatchAVLProver {
    /// A prover over the initial tree: the single sentinel leaf.
    pub fn new(key_length: usize, value_length: usize) -> Self {
        let tree = AVLTree::new_empty(key_length, value_length);
        let old_root = tree.root.clone();
        BatchAVLProver {
            tree,
            old_root,
            directions: Vec::new(),
            directions_bit_length: 0,
            replay_index: 0,
            last_right_step: 0,
        }
    }

    /// Applies one modification. On failure the tree and the recorded proof
    /// stream are exactly what they were before the call; the batch may
    /// continue.
    pub fn perform_one_modification(
        &mut self,
        modification: &Modification,
    ) -> Result<Option<ADValue>> {
        let checkpoint = self.directions_bit_length;
        match self.return_result_of_one_modification(modification) {
            Ok(found) => Ok(found),
            Err(e) => {
                self.truncate_directions(checkpoint);
                Err(e)
            }
        }
    }

    /// Current digest: root label followed by the root height.
    pub fn digest(&self) -> ADDigest {
        hash::digest_of(&label_of(&self.tree.root), self.tree.height)
    }

    /// Current root height.
    pub fn height(&self) -> usize {
        self.tree.height
    }

    /// Reads a value without touching any proof state.
    pub fn unauthenticated_lookup(&self, key: &ADKey) -> Option<ADValue> {
        let mut current = self.tree.root.clone();
        loop {
            let next = {
                match &*current.borrow() {
                    Node::Internal(internal) => {
                        if *key < internal.key {
                            internal.left.clone()
                        } else {
                            internal.right.clone()
                        }
                    }
                    Node::Leaf(leaf) => {
                        return (leaf.key == *key).then(|| leaf.value.clone());
                    }
                    Node::LabelOnly(_) => return None,
                }
            };
            current = next;
        }
    }

    /// Freezes the batch: serializes the pre-batch skeleton of every visited
    /// node plus the direction bitstream, clears the batch flags, and makes
    /// the current tree the new pre-batch tree. The returned bytes are a
    /// fresh owned buffer.
    pub fn generate_proof(&mut self) -> Bytes {
        let mut pack = Vec::new();
        let mut previous_leaf_next = None;
        pack_subtree(&self.old_root, &mut pack, &mut previous_leaf_next);
        pack.push(proof::END_OF_TREE);
        pack.extend_from_slice(&self.directions);
        debug!(
            skeleton_bytes = pack.len() - self.directions.len() - 1,
            direction_bits = self.directions_bit_length,
            "generated batch proof"
        );
        self.directions.clear();
        self.directions_bit_length = 0;
        self.replay_index = 0;
        self.last_right_step = 0;
        reset_new(&self.tree.root);
        self.old_root = self.tree.root.clone();
        Bytes::from(pack)
    }

    /// Walks the whole tree checking every maintained invariant: per-node
    /// balances against real heights, the sorted leaf chain between the two
    /// sentinels, routing keys against right-subtree minima, and (after a
    /// proof) flag hygiene.
    pub fn check_tree(&self, post_proof: bool) -> Result<()> {
        let mut leaves = Vec::new();
        let height = check_subtree(&self.tree.root, post_proof, &mut leaves)?;
        ensure!(
            height == self.tree.height,
            "tracked height {} does not match real height {}",
            self.tree.height,
            height
        );
        ensure!(!leaves.is_empty(), "tree must keep its sentinel leaf");
        ensure!(
            leaves[0].0 == self.tree.negative_infinity,
            "leftmost leaf must be the negative-infinity sentinel"
        );
        for window in leaves.windows(2) {
            ensure!(
                window[0].0 < window[1].0,
                "leaf keys must be strictly increasing"
            );
            ensure!(
                window[0].1 == window[1].0,
                "leaf chain is broken between {} and {}",
                hex::encode(&window[0].0),
                hex::encode(&window[1].0)
            );
        }
        let last = &leaves[leaves.len() - 1];
        ensure!(
            last.1 == self.tree.positive_infinity,
            "rightmost leaf must link to the positive-infinity sentinel"
        );
        Ok(())
    }

    pub(crate) fn top_node(&self) -> NodeRef {
        self.tree.root.clone()
    }

    /// Re-seeds the prover with a restored tree, discarding any batch in
    /// progress.
    pub(crate) fn reset_to(&mut self, root: NodeRef, height: usize) {
        self.tree.root = root.clone();
        self.tree.height = height;
        self.old_root = root;
        self.directions.clear();
        self.directions_bit_length = 0;
        self.replay_index = 0;
        self.last_right_step = 0;
    }

    fn record_direction(&mut self, is_left: bool) {
        if self.directions_bit_length % 8 == 0 {
            self.directions.push(0);
        }
        if is_left {
            let index = self.directions.len() - 1;
            self.directions[index] |= 1 << (self.directions_bit_length % 8);
        } else {
            self.last_right_step = self.directions_bit_length;
        }
        self.directions_bit_length += 1;
    }

    /// Drops the direction bits a failed modification recorded.
    fn truncate_directions(&mut self, bit_length: usize) {
        self.directions_bit_length = bit_length;
        self.directions.truncate(bit_length.div_ceil(8));
        if bit_length % 8 != 0 {
            if let Some(last) = self.directions.last_mut() {
                *last &= (1 << (bit_length % 8)) - 1;
            }
        }
    }
}

impl AuthenticatedTreeOps for BatchAVLProver {
    fn tree(&self) -> &AVLTree {
        &self.tree
    }

    fn tree_mut(&mut self) -> &mut AVLTree {
        &mut self.tree
    }

    fn begin_modification(&mut self) {
        self.replay_index = self.directions_bit_length;
    }

    fn next_direction_is_left(&mut self, key: &ADKey, node: &NodeRef) -> Result<bool> {
        let (node_key, _, _, _) = internal_parts(node)?;
        let is_left = *key < node_key;
        self.record_direction(is_left);
        Ok(is_left)
    }

    fn key_matches_leaf(&mut self, key: &ADKey, leaf: &NodeRef) -> Result<bool> {
        let (leaf_key, _, next) = leaf_parts(leaf)?;
        if *key == leaf_key {
            return Ok(true);
        }
        ensure!(
            leaf_key < *key && *key < next,
            "descent ended on a leaf that does not cover key {}",
            hex::encode(key)
        );
        Ok(false)
    }

    fn replay_comparison(&mut self) -> Result<i32> {
        ensure!(
            self.replay_index < self.directions_bit_length,
            "removal replay ran past the recorded directions"
        );
        let bit = self.directions[self.replay_index >> 3] & (1 << (self.replay_index & 7));
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

    fn on_node_visit(&mut self, node: &NodeRef) {
        mark_visited(node);
    }
}

/// Post-order serialization of the visited part of the pre-batch tree,
/// clearing the visited marks on the way out. An unvisited node can contain
/// no visited descendants, so it packs as its label alone.
fn pack_subtree(node: &NodeRef, pack: &mut Vec<u8>, previous_leaf_next: &mut Option<ADKey>) {
    if !is_visited(node) {
        pack.push(proof::LABEL_ONLY);
        pack.extend_from_slice(label_of(node).as_bytes());
        return;
    }
    enum Shape {
        Leaf(ADKey, crate::ADValue, ADKey),
        Internal(i8, NodeRef, NodeRef),
    }
    let shape = {
        match &*node.borrow() {
            Node::Leaf(leaf) => Shape::Leaf(
                leaf.key.clone(),
                leaf.value.clone(),
                leaf.next_leaf_key.clone(),
            ),
            Node::Internal(internal) => Shape::Internal(
                internal.balance,
                internal.left.clone(),
                internal.right.clone(),
            ),
            Node::LabelOnly(_) => {
                // a prover tree is fully materialized; nothing to do here
                return;
            }
        }
    };
    match shape {
        Shape::Leaf(key, value, next) => {
            if previous_leaf_next.as_ref() == Some(&key) {
                pack.push(proof::LEAF_IMPLIED_KEY);
            } else {
                pack.push(proof::LEAF_WITH_KEY);
                pack.extend_from_slice(&key);
            }
            pack.extend_from_slice(&next);
            pack.extend_from_slice(&value);
            *previous_leaf_next = Some(next);
        }
        Shape::Internal(balance, left, right) => {
            pack_subtree(&left, pack, previous_leaf_next);
            pack_subtree(&right, pack, previous_leaf_next);
            pack.push(balance as u8);
        }
    }
    clear_visited(node);
}

/// Returns the height of `node`, checking balances, routing keys and flags on
/// the way. Leaves are collected as `(key, next_leaf_key)` in order.
fn check_subtree(
    node: &NodeRef,
    post_proof: bool,
    leaves: &mut Vec<(ADKey, ADKey)>,
) -> Result<usize> {
    enum Shape {
        Leaf(ADKey, ADKey),
        Internal(ADKey, i8, NodeRef, NodeRef),
    }
    let (shape, visited, is_new) = {
        match &*node.borrow() {
            Node::Leaf(leaf) => (
                Shape::Leaf(leaf.key.clone(), leaf.next_leaf_key.clone()),
                leaf.flags.visited,
                leaf.flags.is_new,
            ),
            Node::Internal(internal) => (
                Shape::Internal(
                    internal.key.clone(),
                    internal.balance,
                    internal.left.clone(),
                    internal.right.clone(),
                ),
                internal.flags.visited,
                internal.flags.is_new,
            ),
            Node::LabelOnly(_) => {
                anyhow::bail!("a prover tree must not contain label-only nodes")
            }
        }
    };
    if post_proof {
        ensure!(!visited && !is_new, "batch flags must be cleared by a proof");
    }
    match shape {
        Shape::Leaf(key, next) => {
            leaves.push((key, next));
            Ok(0)
        }
        Shape::Internal(key, balance, left, right) => {
            ensure!(balance.abs() <= 1, "balance {} out of range", balance);
            let left_height = check_subtree(&left, post_proof, leaves)?;
            let split = leaves.len();
            let right_height = check_subtree(&right, post_proof, leaves)?;
            ensure!(
                right_height as i64 - left_height as i64 == balance as i64,
                "stored balance {} does not match heights {}/{}",
                balance,
                left_height,
                right_height
            );
            ensure!(
                leaves[split].0 == key,
                "routing key {} is not the minimum of the right subtree",
                hex::encode(&key)
            );
            Ok(left_height.max(right_height) + 1)
        }
    }
}
