// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Wire format of a batch proof.
//!
//! A proof is one byte string: the packed skeleton of every node the batch
//! touched, a terminator byte, and the direction bitstream. The skeleton is a
//! post-order token stream consumed by a stack machine. Leaves and label-only
//! tokens push one node, an internal token pops its two children and pushes
//! their parent, and on the terminator the stack must hold exactly the root.
//! Directions are packed LSB-first, one bit per internal node visited during
//! a descent, `1` for left.
//!
//! Internal nodes are encoded as their raw balance byte, so the remaining
//! token values avoid `0xFF`, `0x00` and `0x01`. A leaf that directly follows
//! its in-order predecessor in the stream omits its key: the predecessor's
//! chain link already names it.

use anyhow::Result;
use bytes::Bytes;

use super::hash::{LABEL_LENGTH, NodeLabel};
use super::node_type::{Node, NodeRef};
use super::verifier::VerificationError;
use crate::ADKey;

/// Leaf token carrying `key ‖ next_leaf_key ‖ value`.
pub(crate) const LEAF_WITH_KEY: u8 = 0x02;

/// Terminator between the skeleton and the direction bitstream.
pub(crate) const END_OF_TREE: u8 = 0x03;

/// Opaque-subtree token carrying a 32-byte label.
pub(crate) const LABEL_ONLY: u8 = 0x04;

/// Leaf token carrying `next_leaf_key ‖ value`; the key is the previous
/// leaf's chain link.
pub(crate) const LEAF_IMPLIED_KEY: u8 = 0x05;

pub(crate) fn malformed(reason: &str) -> anyhow::Error {
    VerificationError::ProofMalformed(reason.to_string()).into()
}

/// Rebuilds the partial tree out of the skeleton part of `proof`. Returns the
/// root and the byte offset where the direction bitstream starts. Every
/// deviation from the format is an error; nothing is ever guessed.
pub(crate) fn unpack_tree(
    proof: &[u8],
    key_length: usize,
    value_length: usize,
) -> Result<(NodeRef, usize)> {
    let mut stack: Vec<NodeRef> = Vec::new();
    let mut position = 0usize;
    let mut previous_leaf_next: Option<ADKey> = None;
    loop {
        let token = *proof
            .get(position)
            .ok_or_else(|| malformed("proof ended before the end-of-tree marker"))?;
        position += 1;
        match token {
            END_OF_TREE => break,
            LABEL_ONLY => {
                let raw = take(proof, &mut position, LABEL_LENGTH)?;
                stack.push(Node::new_label_only(NodeLabel::from_slice(raw)));
            }
            LEAF_WITH_KEY | LEAF_IMPLIED_KEY => {
                let key = if token == LEAF_IMPLIED_KEY {
                    previous_leaf_next
                        .clone()
                        .ok_or_else(|| malformed("implied leaf key without a preceding leaf"))?
                } else {
                    Bytes::copy_from_slice(take(proof, &mut position, key_length)?)
                };
                let next = Bytes::copy_from_slice(take(proof, &mut position, key_length)?);
                let value = Bytes::copy_from_slice(take(proof, &mut position, value_length)?);
                previous_leaf_next = Some(next.clone());
                stack.push(Node::new_leaf(key, value, next, false));
            }
            0x00 | 0x01 | 0xFF => {
                let right = stack
                    .pop()
                    .ok_or_else(|| malformed("internal token popped an empty stack"))?;
                let left = stack
                    .pop()
                    .ok_or_else(|| malformed("internal token popped an empty stack"))?;
                // reconstructed routing keys are never consulted; replays
                // that build or re-key nodes set real keys
                stack.push(Node::new_internal(
                    Bytes::new(),
                    left,
                    right,
                    token as i8,
                    false,
                ));
            }
            _ => return Err(malformed("unknown skeleton token")),
        }
    }
    let root = stack
        .pop()
        .ok_or_else(|| malformed("skeleton holds no nodes"))?;
    if !stack.is_empty() {
        return Err(malformed("skeleton did not reduce to a single root"));
    }
    Ok((root, position))
}

fn take<'a>(proof: &'a [u8], position: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = position
        .checked_add(len)
        .filter(|end| *end <= proof.len())
        .ok_or_else(|| malformed("skeleton token payload is truncated"))?;
    let slice = &proof[*position..end];
    *position = end;
    Ok(slice)
}

/// Upper bound on the byte length of a proof for a batch of at most
/// `max_inserts + max_deletes` tree-changing modifications against a tree of
/// root height `height`. Every modification touches one root-to-leaf path;
/// removals additionally walk the successor and predecessor spines. Each
/// touched internal node contributes its own token plus at most one
/// label-only sibling.
pub(crate) fn length_bound(
    height: usize,
    max_inserts: usize,
    max_deletes: usize,
    key_length: usize,
    value_length: usize,
) -> usize {
    let ops = max_inserts + max_deletes;
    let height_bound = height + max_inserts + 1;
    let nodes = ops * (6 * height_bound + 4) + 1;
    let node_bytes = (1 + 2 * key_length + value_length).max(1 + LABEL_LENGTH);
    let direction_bytes = ops * height_bound / 8 + 1;
    nodes * node_bytes + 1 + direction_bytes
}
