// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Versioned persistence for the prover tree.
//!
//! A store keeps the encoded nodes of every committed batch, keyed by label,
//! plus a register of committed versions. A version label is the digest the
//! tree had when the batch was committed, so rolling back to a digest needs
//! nothing beyond the digest itself: its label names the root node and its
//! height byte seeds the restored tree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, ensure, format_err};
use backtrace::Backtrace;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use super::hash::{self, NodeLabel};
use super::node_type::{DecodedNode, Node, NodeRef, is_new, label_of, set_cached_label};
use super::prover::BatchAVLProver;
use crate::operation::Modification;
use crate::{ADDigest, ADValue};

/// Versioned snapshot store for prover trees.
pub trait VersionedAVLStore {
    /// Snapshots every node the batch in progress created, reachable from the
    /// prover's current root, under a version equal to the current digest.
    fn update(&mut self, prover: &BatchAVLProver) -> Result<()>;

    /// Restores the tree as of `version` and makes it the current version.
    /// Returns the restored root and its height.
    fn rollback(&mut self, version: &ADDigest) -> Result<(NodeRef, usize)>;

    /// The version the store currently points at.
    fn version(&self) -> Option<ADDigest>;

    /// Whether any snapshot has been committed.
    fn non_empty(&self) -> bool {
        self.version().is_some()
    }
}

#[derive(Default)]
struct StoreInner {
    nodes: HashMap<NodeLabel, Vec<u8>>,
    versions: HashSet<ADDigest>,
    current: Option<ADDigest>,
}

/// A [`VersionedAVLStore`] holding encoded nodes in memory. Clones share the
/// same underlying storage, so a fresh prover can be opened over the store a
/// previous prover committed to.
#[derive(Clone, Default)]
pub struct InMemoryVersionedStore(Arc<RwLock<StoreInner>>);

impl InMemoryVersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct nodes held across all versions.
    pub fn num_nodes(&self) -> usize {
        self.0.read().nodes.len()
    }

    fn store_new_nodes(nodes: &mut HashMap<NodeLabel, Vec<u8>>, node: &NodeRef) -> Result<()> {
        if !is_new(node) {
            return Ok(());
        }
        let label = label_of(node);
        let encoded = node.borrow().encode()?;
        nodes.insert(label, encoded);
        let children = {
            match &*node.borrow() {
                Node::Internal(internal) => Some((internal.left.clone(), internal.right.clone())),
                _ => None,
            }
        };
        if let Some((left, right)) = children {
            Self::store_new_nodes(nodes, &left)?;
            Self::store_new_nodes(nodes, &right)?;
        }
        Ok(())
    }

    fn load_node(nodes: &HashMap<NodeLabel, Vec<u8>>, label: &NodeLabel) -> Result<NodeRef> {
        let encoded = nodes.get(label).ok_or_else(|| {
            let backtrace = format!("{:#?}", Backtrace::new());
            debug!("backtrace: {}", backtrace);
            format_err!("missing node {} in versioned store", hex::encode(label))
        })?;
        let node = match DecodedNode::decode(encoded)? {
            DecodedNode::Leaf(leaf) => {
                Node::new_leaf(leaf.key, leaf.value, leaf.next_leaf_key, false)
            }
            DecodedNode::Internal {
                key,
                balance,
                left,
                right,
            } => {
                let left = Self::load_node(nodes, &left)?;
                let right = Self::load_node(nodes, &right)?;
                Node::new_internal(key, left, right, balance, false)
            }
        };
        set_cached_label(&node, *label);
        Ok(node)
    }
}

impl VersionedAVLStore for InMemoryVersionedStore {
    fn update(&mut self, prover: &BatchAVLProver) -> Result<()> {
        let version = prover.digest();
        let mut inner = self.0.write();
        Self::store_new_nodes(&mut inner.nodes, &prover.top_node())?;
        inner.versions.insert(version.clone());
        inner.current = Some(version);
        Ok(())
    }

    fn rollback(&mut self, version: &ADDigest) -> Result<(NodeRef, usize)> {
        let (label, height) = hash::split_digest(version)?;
        let mut inner = self.0.write();
        ensure!(
            inner.versions.contains(version),
            "unknown version {}",
            hex::encode(version)
        );
        let root = Self::load_node(&inner.nodes, &label)?;
        inner.current = Some(version.clone());
        debug!(version = %hex::encode(version), height, "rolled back versioned store");
        Ok((root, height))
    }

    fn version(&self) -> Option<ADDigest> {
        self.0.read().current.clone()
    }
}

/// A prover whose committed batches are durable in a [`VersionedAVLStore`].
///
/// Exactly one version becomes durable per successful
/// [`generate_proof`](Self::generate_proof); an abandoned batch is discarded
/// by rolling back to any committed digest.
pub struct PersistentBatchAVLProver<S: VersionedAVLStore> {
    prover: BatchAVLProver,
    store: S,
}

impl<S: VersionedAVLStore> PersistentBatchAVLProver<S> {
    /// Opens the dictionary over `store`. A non-empty store wins: the
    /// in-memory tree is rolled back to the stored version.
    pub fn new(mut prover: BatchAVLProver, mut store: S) -> Result<Self> {
        if let Some(version) = store.version() {
            let (root, height) = store.rollback(&version)?;
            prover.reset_to(root, height);
            ensure!(
                prover.digest() == version,
                "restored tree does not hash to its version"
            );
        }
        Ok(PersistentBatchAVLProver { prover, store })
    }

    pub fn perform_one_modification(
        &mut self,
        modification: &Modification,
    ) -> Result<Option<ADValue>> {
        self.prover.perform_one_modification(modification)
    }

    /// Flushes the batch to the store, then freezes it into a proof.
    pub fn generate_proof(&mut self) -> Result<Bytes> {
        self.store.update(&self.prover)?;
        Ok(self.prover.generate_proof())
    }

    pub fn digest(&self) -> ADDigest {
        self.prover.digest()
    }

    /// Restores the dictionary to a previously committed digest, discarding
    /// any batch in progress.
    pub fn rollback(&mut self, version: &ADDigest) -> Result<()> {
        let (root, height) = self.store.rollback(version)?;
        self.prover.reset_to(root, height);
        Ok(())
    }

    pub fn prover(&self) -> &BatchAVLProver {
        &self.prover
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
