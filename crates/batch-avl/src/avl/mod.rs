// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::type_complexity)]
//! This module implements the batched authenticated AVL dictionary shared by
//! [`prover::BatchAVLProver`] and [`verifier::BatchAVLVerifier`]. The tree is
//! an AVL tree over leaves that form a sorted chain: every leaf links to the
//! key of the next leaf, the chain starts at the all-zero sentinel and ends
//! at the all-`0xFF` sentinel, and every internal node carries the smallest
//! key of its right subtree. A tree digest is the root label plus the root
//! height, so a constant-size commitment pins both content and shape.
//!
//! Both sides run the same modification algorithm, parameterized over four
//! capabilities ([`AuthenticatedTreeOps`]): deciding the descent direction at
//! an internal node, recognizing the target leaf, replaying the comparisons
//! of a finished descent (used by removals), and building the two-leaf
//! subtree of an insertion. The prover answers from the live tree and records
//! each decision as one bit of the proof's direction stream; the verifier
//! answers by consuming those bits against the partial tree it reconstructed
//! from the proof skeleton. Because the decisions and the node contents are
//! byte-identical on both sides, the verifier's replay arrives at the
//! prover's post-batch digest exactly when the prover was honest.
//!
//! Modifications rebuild the touched spine out of fresh nodes instead of
//! mutating in place. The pre-batch root therefore stays intact until the
//! proof is generated, which is what proof serialization walks and what a
//! versioned store rolls back to.

pub(crate) mod hash;
pub(crate) mod node_type;
pub(crate) mod proof;
pub mod prover;
pub mod storage;
#[cfg(test)]
mod avl_test;
#[cfg(test)]
pub(crate) mod test_helper;
pub mod verifier;

use anyhow::{Result, bail, ensure};
use bytes::Bytes;

use crate::operation::{Modification, ModificationError, Resolution};
use crate::{ADKey, ADValue};
use self::node_type::{Node, NodeRef, internal_parts, is_leaf, leaf_parts};

/// Tree state shared by the prover and the verifier: the root handle, the
/// root height, and the fixed key/value widths.
pub(crate) struct AVLTree {
    pub root: NodeRef,
    pub height: usize,
    pub key_length: usize,
    pub value_length: usize,
    pub negative_infinity: ADKey,
    pub positive_infinity: ADKey,
}

impl AVLTree {
    /// A tree holding nothing but the sentinel leaf
    /// `(NegativeInfinity, 0^VL, PositiveInfinity)`.
    pub fn new_empty(key_length: usize, value_length: usize) -> Self {
        let negative_infinity: ADKey = Bytes::from(vec![0u8; key_length]);
        let positive_infinity: ADKey = Bytes::from(vec![0xFFu8; key_length]);
        let root = Node::new_leaf(
            negative_infinity.clone(),
            Bytes::from(vec![0u8; value_length]),
            positive_infinity.clone(),
            true,
        );
        AVLTree {
            root,
            height: 0,
            key_length,
            value_length,
            negative_infinity,
            positive_infinity,
        }
    }

    /// A tree seeded with an existing root, as restored from a store or
    /// reconstructed from a proof.
    pub fn new_with_root(
        root: NodeRef,
        height: usize,
        key_length: usize,
        value_length: usize,
    ) -> Self {
        AVLTree {
            root,
            height,
            key_length,
            value_length,
            negative_infinity: Bytes::from(vec![0u8; key_length]),
            positive_infinity: Bytes::from(vec![0xFFu8; key_length]),
        }
    }
}

/// The capability record of the shared modification algorithm, plus the
/// algorithm itself as provided methods.
pub(crate) trait AuthenticatedTreeOps {
    fn tree(&self) -> &AVLTree;

    fn tree_mut(&mut self) -> &mut AVLTree;

    /// Called once per modification before the descent starts; positions the
    /// replay cursor of this side.
    fn begin_modification(&mut self);

    /// Decides whether the descent leaves `node` through its left child.
    /// The prover compares keys and records the decision; the verifier
    /// consumes one recorded bit.
    fn next_direction_is_left(&mut self, key: &ADKey, node: &NodeRef) -> Result<bool>;

    /// Decides whether the leaf the descent ended on holds `key`. A leaf that
    /// covers neither the key nor the gap around it fails the modification.
    fn key_matches_leaf(&mut self, key: &ADKey, leaf: &NodeRef) -> Result<bool>;

    /// Replays one comparison of the descent that just finished: negative for
    /// a recorded left turn, zero at the recorded equality step, positive for
    /// a right turn made above it.
    fn replay_comparison(&mut self) -> Result<i32>;

    /// Marks a node as touched by the current batch. Only the prover keeps
    /// the marks; they delimit the proof skeleton.
    fn on_node_visit(&mut self, node: &NodeRef);

    /// Builds the subtree replacing `leaf` after inserting `key`: the old
    /// leaf re-links its chain pointer through the new key, and a new
    /// internal node keyed by the inserted key takes both leaves.
    fn add_node(&mut self, leaf: &NodeRef, key: &ADKey, value: &ADValue) -> Result<NodeRef> {
        let (leaf_key, leaf_value, leaf_next) = leaf_parts(leaf)?;
        let new_leaf = Node::new_leaf(key.clone(), value.clone(), leaf_next, true);
        let relinked = Node::new_leaf(leaf_key, leaf_value, key.clone(), true);
        Ok(Node::new_internal(key.clone(), relinked, new_leaf, 0, true))
    }

    /// Applies one modification to the tree and returns the value the key
    /// held before the modification, if any. On failure the tree is left
    /// untouched.
    fn return_result_of_one_modification(
        &mut self,
        modification: &Modification,
    ) -> Result<Option<ADValue>> {
        let key = modification.key().clone();
        {
            let tree = self.tree();
            ensure!(
                key.len() == tree.key_length,
                ModificationError::KeyLength {
                    got: key.len(),
                    expected: tree.key_length,
                }
            );
            ensure!(
                key != tree.negative_infinity && key != tree.positive_infinity,
                ModificationError::ReservedKey
            );
        }
        self.begin_modification();
        let root = self.tree().root.clone();
        let mut found = None;
        let (new_root, _change, height_increased, to_delete) =
            self.modify_helper(&root, &key, modification, &mut found)?;
        if to_delete {
            let mut deleted_next = None;
            let (post_root, height_decreased) = self.delete_helper(&new_root, &mut deleted_next)?;
            let tree = self.tree_mut();
            tree.root = post_root;
            if height_decreased {
                tree.height -= 1;
            }
        } else {
            let tree = self.tree_mut();
            tree.root = new_root;
            if height_increased {
                tree.height += 1;
            }
        }
        Ok(found)
    }

    /// The unified descent. Returns the replacement subtree, whether anything
    /// changed, whether the subtree height grew, and whether the resolved
    /// outcome was a removal (performed afterwards by [`Self::delete_helper`]).
    fn modify_helper(
        &mut self,
        node: &NodeRef,
        key: &ADKey,
        modification: &Modification,
        found: &mut Option<ADValue>,
    ) -> Result<(NodeRef, bool, bool, bool)> {
        self.on_node_visit(node);
        if node.borrow().is_internal() {
            let go_left = self.next_direction_is_left(key, node)?;
            let (r_key, r_balance, r_left, r_right) = internal_parts(node)?;
            let child = if go_left { r_left.clone() } else { r_right.clone() };
            let (new_child, change, child_grew, to_delete) =
                self.modify_helper(&child, key, modification, found)?;
            if !change {
                return Ok((node.clone(), false, false, to_delete));
            }
            if go_left {
                if child_grew && r_balance < 0 {
                    let rebuilt = self.rebalance_grown_left(r_key, new_child, r_right)?;
                    Ok((rebuilt, true, false, false))
                } else {
                    let grew = child_grew && r_balance == 0;
                    let new_balance = if child_grew { r_balance - 1 } else { r_balance };
                    let rebuilt = Node::new_internal(r_key, new_child, r_right, new_balance, true);
                    Ok((rebuilt, true, grew, false))
                }
            } else if child_grew && r_balance > 0 {
                let rebuilt = self.rebalance_grown_right(r_key, r_left, new_child)?;
                Ok((rebuilt, true, false, false))
            } else {
                let grew = child_grew && r_balance == 0;
                let new_balance = if child_grew { r_balance + 1 } else { r_balance };
                let rebuilt = Node::new_internal(r_key, r_left, new_child, new_balance, true);
                Ok((rebuilt, true, grew, false))
            }
        } else {
            let matched = self.key_matches_leaf(key, node)?;
            let old_value = if matched {
                let (_, value, _) = leaf_parts(node)?;
                Some(value)
            } else {
                None
            };
            *found = old_value.clone();
            match modification.resolve(old_value.as_ref())? {
                Resolution::Unchanged => Ok((node.clone(), false, false, false)),
                Resolution::Delete => Ok((node.clone(), false, false, true)),
                Resolution::Write(value) => {
                    ensure!(
                        value.len() == self.tree().value_length,
                        ModificationError::ValueLength {
                            got: value.len(),
                            expected: self.tree().value_length,
                        }
                    );
                    if matched {
                        let (_, _, next) = leaf_parts(node)?;
                        let rebuilt = Node::new_leaf(key.clone(), value, next, true);
                        Ok((rebuilt, true, false, false))
                    } else {
                        Ok((self.add_node(node, key, &value)?, true, true, false))
                    }
                }
            }
        }
    }

    /// Restores the AVL invariant after the left subtree outgrew the right by
    /// two; the rebuilt subtree has the height it had before the growth.
    fn rebalance_grown_left(
        &mut self,
        r_key: ADKey,
        new_left: NodeRef,
        r_right: NodeRef,
    ) -> Result<NodeRef> {
        let (l_key, l_balance, l_left, l_right) = internal_parts(&new_left)?;
        if l_balance < 0 {
            // single right rotation
            let lower = Node::new_internal(r_key, l_right, r_right, 0, true);
            Ok(Node::new_internal(l_key, l_left, lower, 0, true))
        } else {
            ensure!(l_balance > 0, "a grown subtree cannot be balanced");
            // double rotation: the grandchild becomes the subtree root
            let (g_key, g_balance, g_left, g_right) = internal_parts(&l_right)?;
            let (new_l_balance, new_r_balance) = grandchild_balances(g_balance);
            let new_l = Node::new_internal(l_key, l_left, g_left, new_l_balance, true);
            let new_r = Node::new_internal(r_key, g_right, r_right, new_r_balance, true);
            Ok(Node::new_internal(g_key, new_l, new_r, 0, true))
        }
    }

    /// Mirror of [`Self::rebalance_grown_left`].
    fn rebalance_grown_right(
        &mut self,
        r_key: ADKey,
        r_left: NodeRef,
        new_right: NodeRef,
    ) -> Result<NodeRef> {
        let (c_key, c_balance, c_left, c_right) = internal_parts(&new_right)?;
        if c_balance > 0 {
            // single left rotation
            let lower = Node::new_internal(r_key, r_left, c_left, 0, true);
            Ok(Node::new_internal(c_key, lower, c_right, 0, true))
        } else {
            ensure!(c_balance < 0, "a grown subtree cannot be balanced");
            let (g_key, g_balance, g_left, g_right) = internal_parts(&c_left)?;
            let (new_l_balance, new_r_balance) = grandchild_balances(g_balance);
            let new_l = Node::new_internal(r_key, r_left, g_left, new_l_balance, true);
            let new_r = Node::new_internal(c_key, g_right, c_right, new_r_balance, true);
            Ok(Node::new_internal(g_key, new_l, new_r, 0, true))
        }
    }

    /// Second walk of a removal. Retraces the comparisons of the finished
    /// descent via [`Self::replay_comparison`], detaches the found leaf and
    /// its parent, re-keys the equality node, relinks the in-order
    /// predecessor leaf, and rebalances on unwind. `deleted_next` carries the
    /// detached leaf's chain link up to the equality frame. Returns the
    /// replacement subtree and whether its height shrank.
    fn delete_helper(
        &mut self,
        node: &NodeRef,
        deleted_next: &mut Option<ADKey>,
    ) -> Result<(NodeRef, bool)> {
        self.on_node_visit(node);
        let (r_key, r_balance, r_left, r_right) = internal_parts(node)?;
        let cmp = self.replay_comparison()?;
        if cmp == 0 {
            if is_leaf(&r_right) {
                // the right child is the found leaf: it goes together with
                // this node, and the predecessor inherits its chain link
                self.on_node_visit(&r_right);
                let (_, _, next) = leaf_parts(&r_right)?;
                *deleted_next = Some(next.clone());
                let new_left = self.relink_rightmost_leaf(&r_left, &next)?;
                Ok((new_left, true))
            } else {
                // the found leaf is the leftmost leaf of the right subtree;
                // once it is gone this node routes by the successor key
                let (new_right, right_shrunk) = self.delete_helper(&r_right, deleted_next)?;
                let next = match deleted_next {
                    Some(next) => next.clone(),
                    None => bail!("removal did not surface the detached leaf's chain link"),
                };
                let new_left = self.relink_rightmost_leaf(&r_left, &next)?;
                self.balance_after_right_shrink(next, new_left, new_right, r_balance, right_shrunk)
            }
        } else if cmp > 0 {
            let (new_right, right_shrunk) = self.delete_helper(&r_right, deleted_next)?;
            self.balance_after_right_shrink(r_key, r_left, new_right, r_balance, right_shrunk)
        } else if is_leaf(&r_left) {
            // the left child is the found leaf; this node goes with it and
            // the right subtree moves up one level
            self.on_node_visit(&r_left);
            let (_, _, next) = leaf_parts(&r_left)?;
            *deleted_next = Some(next);
            Ok((r_right, true))
        } else {
            let (new_left, left_shrunk) = self.delete_helper(&r_left, deleted_next)?;
            self.balance_after_left_shrink(r_key, new_left, r_right, r_balance, left_shrunk)
        }
    }

    /// Rewrites the rightmost leaf under `node` (the in-order predecessor of
    /// a detached leaf) to point at `next_leaf_key`. Shape and heights do not
    /// change.
    fn relink_rightmost_leaf(&mut self, node: &NodeRef, next_leaf_key: &ADKey) -> Result<NodeRef> {
        self.on_node_visit(node);
        if node.borrow().is_internal() {
            let (key, balance, left, right) = internal_parts(node)?;
            let new_right = self.relink_rightmost_leaf(&right, next_leaf_key)?;
            Ok(Node::new_internal(key, left, new_right, balance, true))
        } else {
            let (key, value, _) = leaf_parts(node)?;
            Ok(Node::new_leaf(key, value, next_leaf_key.clone(), true))
        }
    }

    /// Rebuilds a node whose right subtree may have shrunk by one, rotating
    /// if the left side is now two levels taller. Returns the rebuilt subtree
    /// and whether its overall height shrank.
    fn balance_after_right_shrink(
        &mut self,
        r_key: ADKey,
        new_left: NodeRef,
        new_right: NodeRef,
        r_balance: i8,
        right_shrunk: bool,
    ) -> Result<(NodeRef, bool)> {
        if !right_shrunk {
            return Ok((
                Node::new_internal(r_key, new_left, new_right, r_balance, true),
                false,
            ));
        }
        match r_balance - 1 {
            0 => Ok((Node::new_internal(r_key, new_left, new_right, 0, true), true)),
            -1 => Ok((
                Node::new_internal(r_key, new_left, new_right, -1, true),
                false,
            )),
            _ => {
                let (l_key, l_balance, l_left, l_right) = internal_parts(&new_left)?;
                if l_balance <= 0 {
                    // single right rotation; height shrinks unless the donor
                    // child was evenly balanced
                    let (root_balance, lower_balance, shrunk) =
                        if l_balance == 0 { (1, -1, false) } else { (0, 0, true) };
                    let lower = Node::new_internal(r_key, l_right, new_right, lower_balance, true);
                    Ok((
                        Node::new_internal(l_key, l_left, lower, root_balance, true),
                        shrunk,
                    ))
                } else {
                    let (g_key, g_balance, g_left, g_right) = internal_parts(&l_right)?;
                    let (new_l_balance, new_r_balance) = grandchild_balances(g_balance);
                    let new_l = Node::new_internal(l_key, l_left, g_left, new_l_balance, true);
                    let new_r = Node::new_internal(r_key, g_right, new_right, new_r_balance, true);
                    Ok((Node::new_internal(g_key, new_l, new_r, 0, true), true))
                }
            }
        }
    }

    /// Mirror of [`Self::balance_after_right_shrink`].
    fn balance_after_left_shrink(
        &mut self,
        r_key: ADKey,
        new_left: NodeRef,
        new_right: NodeRef,
        r_balance: i8,
        left_shrunk: bool,
    ) -> Result<(NodeRef, bool)> {
        if !left_shrunk {
            return Ok((
                Node::new_internal(r_key, new_left, new_right, r_balance, true),
                false,
            ));
        }
        match r_balance + 1 {
            0 => Ok((Node::new_internal(r_key, new_left, new_right, 0, true), true)),
            1 => Ok((
                Node::new_internal(r_key, new_left, new_right, 1, true),
                false,
            )),
            _ => {
                let (c_key, c_balance, c_left, c_right) = internal_parts(&new_right)?;
                if c_balance >= 0 {
                    // single left rotation
                    let (root_balance, lower_balance, shrunk) =
                        if c_balance == 0 { (-1, 1, false) } else { (0, 0, true) };
                    let lower = Node::new_internal(r_key, new_left, c_left, lower_balance, true);
                    Ok((
                        Node::new_internal(c_key, lower, c_right, root_balance, true),
                        shrunk,
                    ))
                } else {
                    let (g_key, g_balance, g_left, g_right) = internal_parts(&c_left)?;
                    let (new_l_balance, new_r_balance) = grandchild_balances(g_balance);
                    let new_l = Node::new_internal(r_key, new_left, g_left, new_l_balance, true);
                    let new_r = Node::new_internal(c_key, g_right, c_right, new_r_balance, true);
                    Ok((Node::new_internal(g_key, new_l, new_r, 0, true), true))
                }
            }
        }
    }
}

/// Balances the two lifted parents take in a double rotation, keyed by the
/// grandchild's balance before the rotation. The grandchild itself always
/// ends up at 0.
fn grandchild_balances(g_balance: i8) -> (i8, i8) {
    match g_balance {
        0 => (0, 0),
        -1 => (0, 1),
        _ => (-1, 0),
    }
}
