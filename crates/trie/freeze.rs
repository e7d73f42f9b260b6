//! Freeze and copy-on-write discipline (§4.4): the mechanism that lets many
//! roots in a forest share structure safely.
//!
//! [`freeze`] recursively marks a subtree immutable. [`writable`] is the
//! single choke point every write operation in [`crate::ops`] goes through
//! to get exclusive, mutable access to a node: if the node is frozen it is
//! cloned first (with the clone unfrozen), otherwise the original is reused
//! in place. [`release`] is the forest-aware counterpart to
//! [`crate::store::NodeStore::release`]: releasing a frozen subtree is a
//! no-op, since some other root may still reference it.

use crate::error::TrieError;
use crate::node::{Node, NodeId};
use crate::store::NodeStore;

/// Exclusive, mutable access to the node at `id`: clones it first if frozen.
/// Callers mutate the returned [`Node`] and persist it with
/// `store.update(new_id, node)`.
pub(crate) fn writable(store: &mut dyn NodeStore, id: NodeId) -> Result<(NodeId, Node), TrieError> {
    let node = store.write(id)?;
    if node.is_frozen() {
        let mut clone = node.clone();
        clone.set_frozen(false);
        let new_id = store.create(clone.clone());
        Ok((new_id, clone))
    } else {
        Ok((id, node))
    }
}

/// Recursively marks every non-frozen node in the subtree at `root` frozen.
/// Already-frozen nodes are skipped without recursing further: the frozen
/// invariant guarantees their descendants are frozen too.
///
/// The transient `frozenChildren` bitmask on [`crate::node::BranchNode`] is
/// populated here as the recursion returns, giving a later `Freeze` call on
/// an overlapping root a cheap skip hint; it is never relied on for
/// correctness, only checked here to avoid redundant descent.
pub fn freeze(store: &mut dyn NodeStore, root: NodeId) -> Result<(), TrieError> {
    if root.is_empty() {
        return Ok(());
    }
    let mut node = store.write(root)?;
    if node.is_frozen() {
        return Ok(());
    }
    match &mut node {
        Node::Empty => {}
        Node::Branch(b) => {
            for nibble in 0u8..16 {
                let child = b.children[nibble as usize];
                if child.is_empty() {
                    continue;
                }
                if !b.is_child_frozen(nibble) {
                    freeze(store, child.id)?;
                    b.set_child_frozen(nibble, true);
                }
            }
        }
        Node::Extension(e) => freeze(store, e.next.id)?,
        Node::Account(a) => freeze(store, a.storage_root.id)?,
        Node::Value(_) => {}
    }
    node.set_frozen(true);
    store.update(root, node)
}

/// Recursively releases a subtree, skipping any node (and therefore its
/// descendants) still marked frozen: some other root may still reach it.
/// Used both for whole-subtree teardown (storage clears, account deletion)
/// and for the public `Release(root)` operation.
pub fn release(store: &mut dyn NodeStore, id: NodeId) -> Result<(), TrieError> {
    if id.is_empty() {
        return Ok(());
    }
    let node = store.read(id)?;
    if node.is_frozen() {
        return Ok(());
    }
    match &node {
        Node::Empty => {}
        Node::Branch(b) => {
            for child in b.children.iter() {
                if !child.is_empty() {
                    release(store, child.id)?;
                }
            }
        }
        Node::Extension(e) => release(store, e.next.id)?,
        Node::Account(a) => release(store, a.storage_root.id)?,
        Node::Value(_) => {}
    }
    store.release(id)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{AccountInfo, AccountNode, ValueNode};
    use crate::store::MemoryNodeStore;
    use ethereum_types::{Address, H256};

    fn sample_account() -> AccountNode {
        AccountNode::new(
            Address::zero(),
            AccountInfo {
                nonce: 1,
                ..Default::default()
            },
            None,
        )
    }

    #[test]
    fn freeze_marks_the_node() {
        let mut store = MemoryNodeStore::default();
        let leaf = store.create_value(ValueNode::new(H256::repeat_byte(1), H256::repeat_byte(2), None));
        freeze(&mut store, leaf).unwrap();
        assert!(store.read(leaf).unwrap().is_frozen());
    }

    #[test]
    fn writable_clones_a_frozen_node_and_leaves_the_original_untouched() {
        let mut store = MemoryNodeStore::default();
        let id = store.create_account(sample_account());
        freeze(&mut store, id).unwrap();
        let (new_id, _node) = writable(&mut store, id).unwrap();
        assert_ne!(new_id, id);
        assert!(store.read(id).unwrap().is_frozen());
        assert!(!store.read(new_id).unwrap().is_frozen());
    }

    #[test]
    fn writable_reuses_the_id_when_not_frozen() {
        let mut store = MemoryNodeStore::default();
        let id = store.create_account(sample_account());
        let (same_id, _node) = writable(&mut store, id).unwrap();
        assert_eq!(same_id, id);
    }

    #[test]
    fn release_of_a_frozen_node_is_a_no_op() {
        let mut store = MemoryNodeStore::default();
        let id = store.create_value(ValueNode::new(H256::repeat_byte(3), H256::repeat_byte(4), None));
        freeze(&mut store, id).unwrap();
        release(&mut store, id).unwrap();
        assert!(store.read(id).is_ok());
    }

    #[test]
    fn release_of_a_non_frozen_node_removes_it() {
        let mut store = MemoryNodeStore::default();
        let id = store.create_value(ValueNode::new(H256::repeat_byte(5), H256::repeat_byte(6), None));
        release(&mut store, id).unwrap();
        assert!(store.read(id).is_err());
    }
}
