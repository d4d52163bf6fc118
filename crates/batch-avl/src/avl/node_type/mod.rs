// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Node types of the batched AVL dictionary.
//!
//! The tree is built from two materialized node kinds plus one opaque kind.
//! [`LeafNode`] holds a key, its value, and the key of the next leaf of the
//! sorted chain, so that the leaves form a linked list terminated by the
//! all-`0xFF` sentinel. [`InternalNode`] routes by key (its key equals the
//! smallest key in its right subtree) and tracks the AVL balance of its two
//! children. [`LabelOnlyNode`] stands in for a subtree known only by its
//! label; it appears while a verifier reconstructs the touched part of a tree
//! out of a proof.
//!
//! Nodes are shared through [`NodeRef`] handles: a batch rebuilds the touched
//! spine out of fresh nodes (flagged `is_new`) while the pre-batch root keeps
//! the old spine alive for proof serialization and rollback. The dictionary
//! is single-threaded by design, which is why plain `Rc`/`RefCell` sharing is
//! the right ownership model here.


use std::cell::RefCell;
use std::io::{Cursor, Read};
use std::rc::Rc;

use anyhow::{Result, bail};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hash::{self, LABEL_LENGTH, NodeLabel};
use crate::{ADKey, ADValue};

/// Shared handle to a node.
pub type NodeRef = Rc<RefCell<Node>>;

/// Book-keeping shared by materialized nodes.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeFlags {
    /// Lazily computed label; cleared only by rebuilding the node.
    pub label: Option<NodeLabel>,
    /// Set on every node a descent touched since the last proof.
    pub visited: bool,
    /// Set on nodes created during the current batch.
    pub is_new: bool,
}

impl NodeFlags {
    fn fresh(is_new: bool) -> Self {
        NodeFlags {
            label: None,
            visited: false,
            is_new,
        }
    }
}

/// Terminal node holding the value for `key` and the chain link to the next
/// leaf (`PositiveInfinity` for the rightmost leaf).
#[derive(Clone, Debug)]
pub struct LeafNode {
    pub(crate) key: ADKey,
    pub(crate) value: ADValue,
    pub(crate) next_leaf_key: ADKey,
    pub(crate) flags: NodeFlags,
}

/// Routing node; `balance` is height(right) − height(left), kept in
/// {−1, 0, +1}.
#[derive(Clone, Debug)]
pub struct InternalNode {
    pub(crate) key: ADKey,
    pub(crate) balance: i8,
    pub(crate) left: NodeRef,
    pub(crate) right: NodeRef,
    pub(crate) flags: NodeFlags,
}

/// Subtree known only by its label.
#[derive(Clone, Debug)]
pub struct LabelOnlyNode {
    pub(crate) label: NodeLabel,
}

/// The concrete node type of the authenticated AVL tree.
#[derive(Clone, Debug)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
    LabelOnly(LabelOnlyNode),
}

impl Node {
    pub(crate) fn new_leaf(key: ADKey, value: ADValue, next_leaf_key: ADKey, is_new: bool) -> NodeRef {
        Rc::new(RefCell::new(Node::Leaf(LeafNode {
            key,
            value,
            next_leaf_key,
            flags: NodeFlags::fresh(is_new),
        })))
    }

    pub(crate) fn new_internal(
        key: ADKey,
        left: NodeRef,
        right: NodeRef,
        balance: i8,
        is_new: bool,
    ) -> NodeRef {
        Rc::new(RefCell::new(Node::Internal(InternalNode {
            key,
            balance,
            left,
            right,
            flags: NodeFlags::fresh(is_new),
        })))
    }

    pub(crate) fn new_label_only(label: NodeLabel) -> NodeRef {
        Rc::new(RefCell::new(Node::LabelOnly(LabelOnlyNode { label })))
    }

    pub(crate) fn is_internal(&self) -> bool {
        matches!(self, Node::Internal(_))
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    fn flags(&self) -> Option<&NodeFlags> {
        match self {
            Node::Internal(internal) => Some(&internal.flags),
            Node::Leaf(leaf) => Some(&leaf.flags),
            Node::LabelOnly(_) => None,
        }
    }

    fn flags_mut(&mut self) -> Option<&mut NodeFlags> {
        match self {
            Node::Internal(internal) => Some(&mut internal.flags),
            Node::Leaf(leaf) => Some(&mut leaf.flags),
            Node::LabelOnly(_) => None,
        }
    }

    /// Serializes to bytes for physical storage. Internal nodes reference
    /// their children by label; leaves carry their full payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        match self {
            Node::Internal(internal) => {
                out.push(NodeTag::Internal as u8);
                out.write_i8(internal.balance)?;
                out.write_u16::<LittleEndian>(internal.key.len() as u16)?;
                out.extend_from_slice(&internal.key);
                out.extend_from_slice(label_of(&internal.left).as_bytes());
                out.extend_from_slice(label_of(&internal.right).as_bytes());
            }
            Node::Leaf(leaf) => {
                out.push(NodeTag::Leaf as u8);
                out.extend(bcs::to_bytes(&RawLeaf {
                    key: leaf.key.to_vec(),
                    value: leaf.value.to_vec(),
                    next_leaf_key: leaf.next_leaf_key.to_vec(),
                })?);
            }
            Node::LabelOnly(_) => bail!("label-only nodes are never persisted"),
        }
        Ok(out)
    }
}

/// Leaf payload as stored in the versioned store.
#[derive(Serialize, Deserialize)]
struct RawLeaf {
    key: Vec<u8>,
    value: Vec<u8>,
    next_leaf_key: Vec<u8>,
}

#[repr(u8)]
#[derive(FromPrimitive, ToPrimitive)]
enum NodeTag {
    Internal = 1,
    Leaf = 2,
}

/// A node as read back from storage: internal children are still labels and
/// get resolved against the store by the caller.
#[derive(Debug)]
pub(crate) enum DecodedNode {
    Leaf(LeafNode),
    Internal {
        key: ADKey,
        balance: i8,
        left: NodeLabel,
        right: NodeLabel,
    },
}

impl DecodedNode {
    /// Recovers a node from its storage encoding.
    pub fn decode(val: &[u8]) -> Result<DecodedNode> {
        if val.is_empty() {
            return Err(NodeDecodeError::EmptyInput.into());
        }
        let tag = val[0];
        match NodeTag::from_u8(tag) {
            Some(NodeTag::Internal) => {
                let mut reader = Cursor::new(&val[1..]);
                let balance = reader.read_i8()?;
                if !(-1..=1).contains(&balance) {
                    return Err(NodeDecodeError::BalanceOutOfRange(balance).into());
                }
                let key_len = reader.read_u16::<LittleEndian>()? as usize;
                let mut key = vec![0u8; key_len];
                reader.read_exact(&mut key)?;
                let mut left = [0u8; LABEL_LENGTH];
                reader.read_exact(&mut left)?;
                let mut right = [0u8; LABEL_LENGTH];
                reader.read_exact(&mut right)?;
                Ok(DecodedNode::Internal {
                    key: Bytes::from(key),
                    balance,
                    left: NodeLabel::from(left),
                    right: NodeLabel::from(right),
                })
            }
            Some(NodeTag::Leaf) => {
                let raw: RawLeaf = bcs::from_bytes(&val[1..])?;
                Ok(DecodedNode::Leaf(LeafNode {
                    key: Bytes::from(raw.key),
                    value: Bytes::from(raw.value),
                    next_leaf_key: Bytes::from(raw.next_leaf_key),
                    flags: NodeFlags::fresh(false),
                }))
            }
            None => Err(NodeDecodeError::UnknownTag { unknown_tag: tag }.into()),
        }
    }
}

/// Error thrown when a node fails to deserialize out of a byte sequence held
/// in physical storage.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum NodeDecodeError {
    /// Input is empty.
    #[error("missing tag due to empty input")]
    EmptyInput,

    /// The first byte of the input is not a known tag.
    #[error("lead tag byte is unknown: {}", unknown_tag)]
    UnknownTag { unknown_tag: u8 },

    /// The balance byte is outside {−1, 0, +1}.
    #[error("balance byte out of range: {0}")]
    BalanceOutOfRange(i8),
}

/// Computes (and caches) the label of a node, descending only into children
/// whose labels are not cached yet.
pub(crate) fn label_of(node: &NodeRef) -> NodeLabel {
    let label = match &*node.borrow() {
        Node::LabelOnly(label_only) => return label_only.label,
        Node::Leaf(leaf) => match leaf.flags.label {
            Some(label) => return label,
            None => hash::leaf_label(&leaf.key, &leaf.value, &leaf.next_leaf_key),
        },
        Node::Internal(internal) => match internal.flags.label {
            Some(label) => return label,
            None => {
                let left = label_of(&internal.left);
                let right = label_of(&internal.right);
                hash::internal_label(internal.balance, &left, &right)
            }
        },
    };
    if let Some(flags) = node.borrow_mut().flags_mut() {
        flags.label = Some(label);
    }
    label
}

/// Copies out `(key, balance, left, right)` of an internal node. A
/// label-only node here means the proof did not convey a subtree the replay
/// needs.
pub(crate) fn internal_parts(node: &NodeRef) -> Result<(ADKey, i8, NodeRef, NodeRef)> {
    match &*node.borrow() {
        Node::Internal(internal) => Ok((
            internal.key.clone(),
            internal.balance,
            internal.left.clone(),
            internal.right.clone(),
        )),
        Node::Leaf(_) => bail!("expected an internal node, found a leaf"),
        Node::LabelOnly(_) => Err(super::verifier::VerificationError::ModificationInapplicable.into()),
    }
}

/// Copies out `(key, value, next_leaf_key)` of a leaf node.
pub(crate) fn leaf_parts(node: &NodeRef) -> Result<(ADKey, ADValue, ADKey)> {
    match &*node.borrow() {
        Node::Leaf(leaf) => Ok((
            leaf.key.clone(),
            leaf.value.clone(),
            leaf.next_leaf_key.clone(),
        )),
        Node::Internal(_) => bail!("expected a leaf node, found an internal node"),
        Node::LabelOnly(_) => Err(super::verifier::VerificationError::ModificationInapplicable.into()),
    }
}

pub(crate) fn is_leaf(node: &NodeRef) -> bool {
    node.borrow().is_leaf()
}

pub(crate) fn is_visited(node: &NodeRef) -> bool {
    node.borrow().flags().map(|f| f.visited).unwrap_or(false)
}

pub(crate) fn is_new(node: &NodeRef) -> bool {
    node.borrow().flags().map(|f| f.is_new).unwrap_or(false)
}

/// Seeds the label cache of a node restored from storage, where the label is
/// the key it was stored under.
pub(crate) fn set_cached_label(node: &NodeRef, label: NodeLabel) {
    if let Some(flags) = node.borrow_mut().flags_mut() {
        flags.label = Some(label);
    }
}

pub(crate) fn mark_visited(node: &NodeRef) {
    if let Some(flags) = node.borrow_mut().flags_mut() {
        flags.visited = true;
    }
}

pub(crate) fn clear_visited(node: &NodeRef) {
    if let Some(flags) = node.borrow_mut().flags_mut() {
        flags.visited = false;
    }
}

/// Clears the batch flags of the freshly built spine, stopping at nodes that
/// predate the batch (their flags were cleared when their own batch ended).
pub(crate) fn reset_new(node: &NodeRef) {
    let children = {
        let mut n = node.borrow_mut();
        match &mut *n {
            Node::Internal(internal) => {
                if !internal.flags.is_new && !internal.flags.visited {
                    None
                } else {
                    internal.flags.is_new = false;
                    internal.flags.visited = false;
                    Some((internal.left.clone(), internal.right.clone()))
                }
            }
            Node::Leaf(leaf) => {
                leaf.flags.is_new = false;
                leaf.flags.visited = false;
                None
            }
            Node::LabelOnly(_) => None,
        }
    };
    if let Some((left, right)) = children {
        reset_new(&left);
        reset_new(&right);
    }
}
