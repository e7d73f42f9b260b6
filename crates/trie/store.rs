//! The node-manager contract (§6) and an in-memory reference implementation.
//!
//! The core engine never owns nodes directly; it asks a [`NodeStore`] to
//! resolve, create, update and release them by [`NodeId`]. A real deployment
//! plugs a disk-backed store behind this trait. [`MemoryNodeStore`] is the
//! in-process reference: a [`slab::Slab`] of node slots keyed by the same
//! index-plus-tag shape as [`NodeId`] itself.
//!
//! Access levels are modeled by Rust's own borrow rules rather than scoped
//! handle objects: `&self` stands in for read/view/hash access, `&mut self`
//! for write access. A caller embedding this in a concurrent host wraps a
//! `MemoryNodeStore` (or a disk-backed equivalent) behind whatever locking
//! discipline its deployment needs; the trait itself only requires
//! `Send + Sync` so it can be shared across worker threads.

use ethereum_types::{Address, H256};
use sha3::{Digest, Keccak256};
use slab::Slab;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::TrieError;
use crate::node::{
    AccountInfo, AccountNode, BranchNode, ExtensionNode, Node, NodeId, NodeKind, ValueNode,
};

/// The external collaborator the engine navigates, mutates and hashes through.
pub trait NodeStore: Send + Sync {
    fn get_config(&self) -> EngineConfig;

    /// Typically Keccak256; used to derive storage-key nibble paths when
    /// `UseHashedPaths` is set.
    fn hash_key(&self, key: &H256) -> H256;

    /// Typically Keccak256; used to derive address nibble paths when
    /// `UseHashedPaths` is set.
    fn hash_address(&self, address: &Address) -> H256;

    /// Shared, immutable view of a node. Returns `Node::Empty` for `NodeId::EMPTY`.
    fn read(&self, id: NodeId) -> Result<Node, TrieError>;

    /// Transient read, equivalent to `read` for an in-process store.
    fn view(&self, id: NodeId) -> Result<Node, TrieError> {
        self.read(id)
    }

    /// Exclusive access for structural mutation; returns the current content
    /// for the caller to modify and hand back via `update`.
    fn write(&mut self, id: NodeId) -> Result<Node, TrieError>;

    /// Allocates a fresh node and returns its new id.
    fn create(&mut self, node: Node) -> NodeId;

    /// Persists `node` back under `id`, which must have been obtained from
    /// `write` or `create`. Marks the node persistent-dirty at the storage layer.
    fn update(&mut self, id: NodeId, node: Node) -> Result<(), TrieError>;

    /// Persists a hash-only update (clears `hashDirty`/child-dirty bits
    /// without otherwise restructuring the node).
    fn update_hash(&mut self, id: NodeId, node: Node) -> Result<(), TrieError> {
        self.update(id, node)
    }

    /// Caller asserts `id` is unreferenced by any remaining root.
    fn release(&mut self, id: NodeId) -> Result<(), TrieError>;

    fn create_branch(&mut self, branch: BranchNode) -> NodeId {
        self.create(Node::Branch(Box::new(branch)))
    }

    fn create_extension(&mut self, extension: ExtensionNode) -> NodeId {
        self.create(Node::Extension(extension))
    }

    fn create_account(&mut self, account: AccountNode) -> NodeId {
        self.create(Node::Account(account))
    }

    fn create_value(&mut self, value: ValueNode) -> NodeId {
        self.create(Node::Value(value))
    }
}

/// Slab-allocated, single-process [`NodeStore`]. Usable directly for testing
/// and embedding, and as the model a disk-backed store's node-id scheme follows.
#[derive(Debug)]
pub struct MemoryNodeStore {
    slab: Slab<Node>,
    config: EngineConfig,
}

impl MemoryNodeStore {
    pub fn new(config: EngineConfig) -> Self {
        MemoryNodeStore {
            slab: Slab::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        MemoryNodeStore::new(EngineConfig::default())
    }
}

impl NodeStore for MemoryNodeStore {
    fn get_config(&self) -> EngineConfig {
        self.config
    }

    fn hash_key(&self, key: &H256) -> H256 {
        H256::from_slice(&Keccak256::digest(key.as_bytes()))
    }

    fn hash_address(&self, address: &Address) -> H256 {
        H256::from_slice(&Keccak256::digest(address.as_bytes()))
    }

    fn read(&self, id: NodeId) -> Result<Node, TrieError> {
        if id.is_empty() {
            return Ok(Node::Empty);
        }
        self.slab.get(id.index()).cloned().ok_or_else(|| {
            warn!(node_id = ?id, "node manager could not resolve node");
            TrieError::NodeNotFound(id)
        })
    }

    fn write(&mut self, id: NodeId) -> Result<Node, TrieError> {
        self.read(id)
    }

    fn create(&mut self, node: Node) -> NodeId {
        let kind = node.kind();
        if matches!(kind, NodeKind::Empty) {
            return NodeId::EMPTY;
        }
        let index = self.slab.insert(node);
        NodeId::new(index, kind)
    }

    fn update(&mut self, id: NodeId, node: Node) -> Result<(), TrieError> {
        if id.is_empty() {
            return Ok(());
        }
        let slot = self.slab.get_mut(id.index()).ok_or_else(|| {
            warn!(node_id = ?id, "node manager could not resolve node for update");
            TrieError::NodeNotFound(id)
        })?;
        *slot = node;
        Ok(())
    }

    fn release(&mut self, id: NodeId) -> Result<(), TrieError> {
        if id.is_empty() {
            return Ok(());
        }
        if self.slab.try_remove(id.index()).is_none() {
            warn!(node_id = ?id, "node manager asked to release an unknown node");
            return Err(TrieError::NodeNotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_then_read_round_trips() {
        let mut store = MemoryNodeStore::default();
        let value = ValueNode::new(H256::repeat_byte(1), H256::repeat_byte(2), None);
        let id = store.create_value(value.clone());
        let read_back = store.read(id).unwrap();
        assert_eq!(read_back.as_value().unwrap().key, value.key);
    }

    #[test]
    fn reading_empty_id_never_touches_the_slab() {
        let store = MemoryNodeStore::default();
        assert!(matches!(store.read(NodeId::EMPTY).unwrap(), Node::Empty));
    }

    #[test]
    fn release_then_read_fails() {
        let mut store = MemoryNodeStore::default();
        let account = AccountNode::new(Address::zero(), AccountInfo::default(), None);
        let id = store.create_account(account);
        store.release(id).unwrap();
        assert!(matches!(store.read(id), Err(TrieError::NodeNotFound(_))));
    }

    #[test]
    fn hash_address_and_hash_key_use_keccak256() {
        let store = MemoryNodeStore::default();
        let expected = H256::from_slice(&Keccak256::digest(Address::zero().as_bytes()));
        assert_eq!(store.hash_address(&Address::zero()), expected);
    }
}
