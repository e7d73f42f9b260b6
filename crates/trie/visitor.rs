//! Debug traversal: cycle detection, invariant enforcement (§8), and the
//! generic visitor pattern exposed as `Visit` (§6).
//!
//! A cycle on a root-to-node path is a programmer error, not a reportable
//! invariant violation: [`check`] surfaces it immediately as
//! [`TrieError::Cycle`] rather than folding it into the accumulated
//! [`TrieError::Check`] list, matching the fatal/non-fatal split in §7.

use std::collections::HashSet;
use std::fmt::Write as _;

use crate::hasher;
use crate::nibbles::{self, Nibbles};
use crate::node::{AccountNode, BranchNode, ExtensionNode, Node, NodeId, ValueNode};
use crate::store::NodeStore;
use crate::error::TrieError;

/// Pre-order callbacks for [`visit`]. Default bodies are no-ops so a caller
/// only overrides the variants it cares about.
pub trait Visitor {
    fn visit_branch(&mut self, _id: NodeId, _depth: usize, _node: &BranchNode) {}
    fn visit_extension(&mut self, _id: NodeId, _depth: usize, _node: &ExtensionNode) {}
    fn visit_account(&mut self, _id: NodeId, _depth: usize, _node: &AccountNode) {}
    fn visit_value(&mut self, _id: NodeId, _depth: usize, _node: &ValueNode) {}
}

pub fn visit(store: &dyn NodeStore, root: NodeId, visitor: &mut dyn Visitor) -> Result<(), TrieError> {
    visit_rec(store, root, 0, visitor)
}

fn visit_rec(store: &dyn NodeStore, id: NodeId, depth: usize, visitor: &mut dyn Visitor) -> Result<(), TrieError> {
    if id.is_empty() {
        return Ok(());
    }
    match store.view(id)? {
        Node::Empty => {}
        Node::Branch(b) => {
            visitor.visit_branch(id, depth, &b);
            for child in b.children.iter() {
                if !child.is_empty() {
                    visit_rec(store, child.id, depth + 1, visitor)?;
                }
            }
        }
        Node::Extension(e) => {
            visitor.visit_extension(id, depth, &e);
            visit_rec(store, e.next.id, depth + e.path.len(), visitor)?;
        }
        Node::Account(a) => {
            visitor.visit_account(id, depth, &a);
            visit_rec(store, a.storage_root.id, 0, visitor)?;
        }
        Node::Value(v) => visitor.visit_value(id, depth, &v),
    }
    Ok(())
}

/// Walks the subtree at `root` and returns every invariant breach found
/// (§8's quantified invariants), or an immediate `Err` if a cycle is found
/// on a root-to-node path.
pub fn check(store: &dyn NodeStore, root: NodeId) -> Result<(), TrieError> {
    let config = store.get_config();
    let mut violations = Vec::new();
    let mut on_path = HashSet::new();
    check_rec(store, root, &Nibbles::from_nibbles(vec![]), &mut on_path, &mut violations, &config)?;
    if violations.is_empty() {
        Ok(())
    } else {
        Err(TrieError::Check(violations))
    }
}

fn check_rec(
    store: &dyn NodeStore,
    id: NodeId,
    path: &Nibbles,
    on_path: &mut HashSet<NodeId>,
    violations: &mut Vec<String>,
    config: &crate::config::EngineConfig,
) -> Result<(), TrieError> {
    if id.is_empty() {
        return Ok(());
    }
    if !on_path.insert(id) {
        return Err(TrieError::Cycle(id));
    }

    let result = (|| -> Result<(), TrieError> {
        match store.view(id)? {
            Node::Empty => {}
            Node::Branch(b) => {
                if b.non_empty_count() < 2 {
                    violations.push(format!("{id:?}: branch has fewer than 2 non-empty children"));
                }
                for (nibble, child) in b.children.iter().enumerate() {
                    if child.is_empty() {
                        continue;
                    }
                    if !b.is_child_dirty(nibble as u8) {
                        let fresh = hasher::get_hash(store, child.id)?;
                        if fresh != b.child_hashes[nibble] {
                            violations.push(format!(
                                "{id:?}: cached hash for child [{nibble:x}] does not match a fresh recompute"
                            ));
                        }
                    }
                    let child_path = path.prepended(nibble as u8);
                    check_rec(store, child.id, &child_path, on_path, violations, config)?;
                }
            }
            Node::Extension(e) => {
                if e.path.is_empty() {
                    violations.push(format!("{id:?}: extension path length is 0"));
                }
                if e.next.is_empty() {
                    violations.push(format!("{id:?}: extension next is empty"));
                } else if !matches!(store.view(e.next.id)?, Node::Branch(_)) {
                    violations.push(format!("{id:?}: extension next does not resolve to a branch"));
                }
                if !e.next.is_empty() && !e.next_hash_dirty {
                    let fresh = hasher::get_hash(store, e.next.id)?;
                    if fresh != e.next_hash {
                        violations.push(format!("{id:?}: cached next hash does not match a fresh recompute"));
                    }
                }
                let child_path = path.concat(&e.path);
                check_rec(store, e.next.id, &child_path, on_path, violations, config)?;
            }
            Node::Account(a) => {
                if a.info.is_empty() {
                    violations.push(format!("{id:?}: account info is empty"));
                }
                let full_path = nibbles::address_path(&a.address, config);
                if !path.is_prefix_of(&full_path) {
                    violations.push(format!("{id:?}: account address path does not match navigation path"));
                }
                if let Some(len) = a.path_length {
                    let expected = (full_path.len() - path.len()) as u8;
                    if len != expected {
                        violations.push(format!(
                            "{id:?}: account pathLength {len} does not match expected {expected}"
                        ));
                    }
                }
                check_rec(store, a.storage_root.id, &Nibbles::from_nibbles(vec![]), on_path, violations, config)?;
            }
            Node::Value(v) => {
                if v.value.is_zero() {
                    violations.push(format!("{id:?}: value is zero"));
                }
                let full_path = nibbles::key_path(&v.key, config);
                if !path.is_prefix_of(&full_path) {
                    violations.push(format!("{id:?}: value key path does not match navigation path"));
                }
                if let Some(len) = v.path_length {
                    let expected = (full_path.len() - path.len()) as u8;
                    if len != expected {
                        violations.push(format!(
                            "{id:?}: value pathLength {len} does not match expected {expected}"
                        ));
                    }
                }
            }
        }
        Ok(())
    })();

    on_path.remove(&id);
    result
}

/// A textual, indented pre-order rendering of the subtree at `root`. Purely
/// diagnostic; its format is not a stable contract.
pub fn dump(store: &dyn NodeStore, root: NodeId) -> Result<String, TrieError> {
    let mut out = String::new();
    dump_rec(store, root, 0, &mut out)?;
    Ok(out)
}

fn dump_rec(store: &dyn NodeStore, id: NodeId, depth: usize, out: &mut String) -> Result<(), TrieError> {
    let indent = "  ".repeat(depth);
    if id.is_empty() {
        let _ = writeln!(out, "{indent}Empty");
        return Ok(());
    }
    match store.view(id)? {
        Node::Empty => {
            let _ = writeln!(out, "{indent}Empty");
        }
        Node::Branch(b) => {
            let _ = writeln!(out, "{indent}Branch {id:?} (hash_dirty={})", b.hash_dirty);
            for (nibble, child) in b.children.iter().enumerate() {
                if !child.is_empty() {
                    let _ = writeln!(out, "{indent}  [{nibble:x}]");
                    dump_rec(store, child.id, depth + 2, out)?;
                }
            }
        }
        Node::Extension(e) => {
            let _ = writeln!(out, "{indent}Extension {id:?} path_len={} (hash_dirty={})", e.path.len(), e.hash_dirty);
            dump_rec(store, e.next.id, depth + 1, out)?;
        }
        Node::Account(a) => {
            let _ = writeln!(
                out,
                "{indent}Account {id:?} addr={:?} nonce={} path_length={:?}",
                a.address, a.info.nonce, a.path_length
            );
            if !a.storage_root.is_empty() {
                dump_rec(store, a.storage_root.id, depth + 1, out)?;
            }
        }
        Node::Value(v) => {
            let _ = writeln!(out, "{indent}Value {id:?} key={:?} path_length={:?}", v.key, v.path_length);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{EngineConfig, HashAlgorithm};
    use crate::node::{AccountInfo, NodeKind};
    use crate::ops;
    use crate::store::MemoryNodeStore;
    use ethereum_types::Address;

    fn store() -> MemoryNodeStore {
        MemoryNodeStore::new(EngineConfig {
            use_hashed_paths: false,
            track_suffix_lengths_in_leaf_nodes: true,
            hash_algorithm: HashAlgorithm::Ethereum,
        })
    }

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::from(bytes)
    }

    #[test]
    fn check_passes_on_a_well_formed_two_account_trie() {
        let mut s = store();
        let info1 = AccountInfo { nonce: 1, ..Default::default() };
        let info2 = AccountInfo { nonce: 2, ..Default::default() };
        let (root, _) = ops::set_account(&mut s, NodeId::EMPTY, &addr(1), info1).unwrap();
        let (root, _) = ops::set_account(&mut s, root, &addr(2), info2).unwrap();
        check(&s, root).unwrap();
    }

    #[test]
    fn check_passes_on_a_clean_hashed_trie_and_flags_a_tampered_cached_hash() {
        let mut s = store();
        let info1 = AccountInfo { nonce: 1, ..Default::default() };
        let info2 = AccountInfo { nonce: 2, ..Default::default() };
        let (root, _) = ops::set_account(&mut s, NodeId::EMPTY, &addr(1), info1).unwrap();
        let (root, _) = ops::set_account(&mut s, root, &addr(2), info2).unwrap();
        hasher::update_hashes(&mut s, root).unwrap();
        check(&s, root).unwrap();

        let mut node = s.read(root).unwrap();
        let branch = node.as_branch_mut().unwrap();
        let nibble = branch
            .children
            .iter()
            .position(|c| !c.is_empty())
            .expect("branch has at least one child");
        branch.child_hashes[nibble] = ethereum_types::H256::repeat_byte(0xee);
        s.update(root, node).unwrap();

        let err = check(&s, root).unwrap_err();
        match err {
            TrieError::Check(violations) => {
                assert!(violations.iter().any(|v| v.contains("does not match a fresh recompute")));
            }
            other => panic!("expected TrieError::Check, got {other:?}"),
        }
    }

    #[test]
    fn check_flags_a_branch_with_a_single_child() {
        let mut s = store();
        let mut branch = BranchNode::empty();
        let leaf = s.create_value(crate::node::ValueNode::new(
            ethereum_types::H256::repeat_byte(1),
            ethereum_types::H256::repeat_byte(2),
            None,
        ));
        branch.children[3] = leaf.into();
        let branch_id = s.create_branch(branch);
        let err = check(&s, branch_id).unwrap_err();
        assert!(matches!(err, TrieError::Check(_)));
    }

    #[test]
    fn check_detects_a_self_referential_extension_as_a_cycle() {
        let mut s = store();
        let ext_id = s.create_extension(ExtensionNode::new(Nibbles::from_nibbles(vec![1]), NodeId::EMPTY.into()));
        // Force a cycle: point the extension's `next` back at itself.
        let mut node = s.read(ext_id).unwrap();
        node.as_extension_mut().unwrap().next = NodeId::new(ext_id.index(), NodeKind::Extension).into();
        s.update(ext_id, node).unwrap();
        let err = check(&s, ext_id).unwrap_err();
        assert!(matches!(err, TrieError::Cycle(_)));
    }

    #[test]
    fn visit_reaches_every_reachable_node() {
        let mut s = store();
        let info1 = AccountInfo { nonce: 1, ..Default::default() };
        let info2 = AccountInfo { nonce: 2, ..Default::default() };
        let (root, _) = ops::set_account(&mut s, NodeId::EMPTY, &addr(1), info1).unwrap();
        let (root, _) = ops::set_account(&mut s, root, &addr(2), info2).unwrap();

        struct Counter {
            accounts: usize,
        }
        impl Visitor for Counter {
            fn visit_account(&mut self, _id: NodeId, _depth: usize, _node: &AccountNode) {
                self.accounts += 1;
            }
        }
        let mut counter = Counter { accounts: 0 };
        visit(&s, root, &mut counter).unwrap();
        assert_eq!(counter.accounts, 2);
    }

    #[test]
    fn dump_renders_without_error() {
        let mut s = store();
        let info = AccountInfo { nonce: 1, ..Default::default() };
        let (root, _) = ops::set_account(&mut s, NodeId::EMPTY, &addr(1), info).unwrap();
        let text = dump(&s, root).unwrap();
        assert!(text.contains("Account"));
    }
}
