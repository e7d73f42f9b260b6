//! Recursive get/set/clear operations over node variants (§4.2–§4.3).
//!
//! Writes return `(new_root, changed)`. `changed = false` is reserved for
//! true no-ops — setting the value already stored, clearing storage that is
//! already empty, deleting a key that was never present — and is how the
//! engine implements idempotence without a parent ever re-hashing work it
//! didn't need to. Any other outcome (including a copy-on-write clone with
//! mutated content) reports `changed = true`, since the parent must update
//! its child slot and mark its own hash dirty either way; this crate treats
//! "the id changed" and "the parent owes a dirty-bit update" as the same
//! signal rather than threading a third state through every call site.
//!
//! Every write recurses through [`crate::freeze::writable`] the moment it
//! needs to mutate a node, so frozen subtrees are cloned lazily exactly
//! where they are touched and never anywhere else.

use ethereum_types::{Address, H256};
use tracing::trace;

use crate::config::EngineConfig;
use crate::error::TrieError;
use crate::freeze::{release, writable};
use crate::nibbles::{self, Nibbles};
use crate::node::{
    AccountInfo, AccountNode, BranchNode, ExtensionNode, LeafPathLength, Node, NodeId,
    NodeReference, ValueNode,
};
use crate::store::NodeStore;

// ---------------------------------------------------------------------
// Reads (§4.2)
// ---------------------------------------------------------------------

/// Follows `root` down to the `Account` leaf for `address`, if any.
fn find_account_node(
    store: &dyn NodeStore,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    depth: usize,
) -> Result<Option<AccountNode>, TrieError> {
    match store.view(id)? {
        Node::Empty => Ok(None),
        Node::Branch(b) => {
            let child = b.children[path.at(depth) as usize];
            if child.is_empty() {
                Ok(None)
            } else {
                find_account_node(store, child.id, address, path, depth + 1)
            }
        }
        Node::Extension(e) => {
            let remaining = path.skip(depth);
            if e.path.is_prefix_of(&remaining) {
                find_account_node(store, e.next.id, address, path, depth + e.path.len())
            } else {
                Ok(None)
            }
        }
        Node::Account(a) => Ok(if &a.address == address { Some(a) } else { None }),
        Node::Value(_) => Err(TrieError::WrongVariant {
            expected: "Account",
            found: id,
        }),
    }
}

/// Follows `root` down to the `Value` leaf for `key`, if any. Never crosses
/// an `Account` node: a storage trie is rooted independently per account.
fn find_value(
    store: &dyn NodeStore,
    id: NodeId,
    key: &H256,
    path: &Nibbles,
    depth: usize,
) -> Result<Option<H256>, TrieError> {
    match store.view(id)? {
        Node::Empty => Ok(None),
        Node::Branch(b) => {
            let child = b.children[path.at(depth) as usize];
            if child.is_empty() {
                Ok(None)
            } else {
                find_value(store, child.id, key, path, depth + 1)
            }
        }
        Node::Extension(e) => {
            let remaining = path.skip(depth);
            if e.path.is_prefix_of(&remaining) {
                find_value(store, e.next.id, key, path, depth + e.path.len())
            } else {
                Ok(None)
            }
        }
        Node::Value(v) => Ok(if &v.key == key { Some(v.value) } else { None }),
        Node::Account(_) => Err(TrieError::WrongVariant {
            expected: "Value",
            found: id,
        }),
    }
}

pub fn get_account(
    store: &dyn NodeStore,
    root: NodeId,
    address: &Address,
) -> Result<(AccountInfo, bool), TrieError> {
    let config = store.get_config();
    let path = nibbles::address_path(address, &config);
    match find_account_node(store, root, address, &path, 0)? {
        Some(a) => Ok((a.info, true)),
        None => Ok((AccountInfo::default(), false)),
    }
}

pub fn get_value(store: &dyn NodeStore, root: NodeId, key: &H256) -> Result<(H256, bool), TrieError> {
    let config = store.get_config();
    let path = nibbles::key_path(key, &config);
    match find_value(store, root, key, &path, 0)? {
        Some(v) => Ok((v, true)),
        None => Ok((H256::zero(), false)),
    }
}

pub fn get_slot(
    store: &dyn NodeStore,
    root: NodeId,
    address: &Address,
    key: &H256,
) -> Result<(H256, bool), TrieError> {
    let config = store.get_config();
    let path = nibbles::address_path(address, &config);
    match find_account_node(store, root, address, &path, 0)? {
        Some(a) => get_value(store, a.storage_root.id, key),
        None => Ok((H256::zero(), false)),
    }
}

// ---------------------------------------------------------------------
// Shared write helpers
// ---------------------------------------------------------------------

fn leaf_path_length(config: &EngineConfig, path: &Nibbles, depth: usize) -> Option<u8> {
    if config.track_suffix_lengths_in_leaf_nodes {
        Some((path.len() - depth) as u8)
    } else {
        None
    }
}

fn set_leaf_path_length(node: &mut Node, len: Option<u8>) {
    match node {
        Node::Account(a) => a.set_path_length(len),
        Node::Value(v) => v.set_path_length(len),
        _ => {}
    }
}

fn set_hash_dirty(node: &mut Node) {
    match node {
        Node::Branch(b) => b.hash_dirty = true,
        Node::Extension(e) => e.hash_dirty = true,
        Node::Account(a) => a.hash_dirty = true,
        Node::Value(v) => v.hash_dirty = true,
        Node::Empty => {}
    }
}

/// Releases a single structural node (not its children) unless it is
/// frozen, in which case some other root may still reach it.
fn release_if_unfrozen(store: &mut dyn NodeStore, id: NodeId) -> Result<(), TrieError> {
    if id.is_empty() {
        return Ok(());
    }
    if store.view(id)?.is_frozen() {
        return Ok(());
    }
    store.release(id)
}

/// After a child slot became empty, decide the branch's fate: stay a Branch
/// with ≥2 children, or collapse into the sole survivor ("Insert into
/// Branch", §4.3). Shared between the address trie and every storage trie,
/// since collapse is driven entirely by occupancy, never by leaf kind.
fn collapse_or_update_branch(
    store: &mut dyn NodeStore,
    branch_id: NodeId,
    nibble: u8,
    new_child: NodeId,
    depth: usize,
    path_len: usize,
) -> Result<(NodeId, bool), TrieError> {
    let (writable_id, mut node) = writable(store, branch_id)?;
    {
        let branch = node.as_branch_mut()?;
        branch.children[nibble as usize] = new_child.into();
        if new_child.is_empty() {
            branch.child_hashes[nibble as usize] = crate::node::Hash::zero();
            branch.set_embedded(nibble, false);
            branch.set_child_dirty(nibble, false);
            branch.set_child_frozen(nibble, false);
        } else {
            branch.set_child_dirty(nibble, true);
            branch.set_child_frozen(nibble, false);
        }
        branch.hash_dirty = true;
    }

    match node.as_branch()?.only_child() {
        None => {
            store.update(writable_id, node)?;
            Ok((writable_id, true))
        }
        Some((survivor_nibble, survivor_ref)) => {
            trace!(branch = ?branch_id, survivor = ?survivor_ref.id, "collapsing branch to sole survivor");
            store.release(writable_id)?;
            match store.view(survivor_ref.id)? {
                Node::Branch(_) => {
                    let ext = ExtensionNode::new(Nibbles::from_nibbles(vec![survivor_nibble]), survivor_ref);
                    Ok((store.create_extension(ext), true))
                }
                Node::Extension(mut child_ext) => {
                    child_ext.path = child_ext.path.prepended(survivor_nibble);
                    child_ext.hash_dirty = true;
                    let new_id = if child_ext.frozen {
                        child_ext.frozen = false;
                        store.create(Node::Extension(child_ext))
                    } else {
                        let id = survivor_ref.id;
                        store.update(id, Node::Extension(child_ext))?;
                        id
                    };
                    Ok((new_id, true))
                }
                Node::Account(_) | Node::Value(_) => {
                    let new_suffix = (path_len - depth) as u8;
                    let adjusted = adjust_leaf_suffix_on_collapse(store, survivor_ref.id, new_suffix)?;
                    Ok((adjusted, true))
                }
                Node::Empty => unreachable!("a branch child reference is never Empty"),
            }
        }
    }
}

fn adjust_leaf_suffix_on_collapse(
    store: &mut dyn NodeStore,
    leaf_id: NodeId,
    new_suffix_len: u8,
) -> Result<NodeId, TrieError> {
    let tracked = match store.view(leaf_id)? {
        Node::Account(a) => a.path_length.is_some(),
        Node::Value(v) => v.path_length.is_some(),
        _ => {
            return Err(TrieError::InvalidInvariant(
                "branch collapse survivor must be a leaf".into(),
            ));
        }
    };
    if !tracked {
        return Ok(leaf_id);
    }
    let (new_id, mut node) = writable(store, leaf_id)?;
    set_leaf_path_length(&mut node, Some(new_suffix_len));
    set_hash_dirty(&mut node);
    store.update(new_id, node)?;
    Ok(new_id)
}

/// After recursing through an Extension's `next`, react to what came back:
/// still a Branch (update the reference), collapsed to another Extension
/// (merge the two paths), or collapsed straight to a leaf (this Extension
/// dissolves and the leaf absorbs its path as extra suffix).
fn handle_extension_child_result(
    store: &mut dyn NodeStore,
    ext_id: NodeId,
    ext_path: Nibbles,
    new_next: NodeId,
) -> Result<(NodeId, bool), TrieError> {
    if new_next.is_empty() {
        release_if_unfrozen(store, ext_id)?;
        return Ok((NodeId::EMPTY, true));
    }
    match store.view(new_next)? {
        Node::Branch(_) => {
            let (new_id, mut node) = writable(store, ext_id)?;
            let e = node.as_extension_mut()?;
            e.next = new_next.into();
            e.next_hash_dirty = true;
            e.hash_dirty = true;
            store.update(new_id, node)?;
            Ok((new_id, true))
        }
        Node::Extension(child_ext) => {
            trace!(parent = ?ext_id, child = ?new_next, "merging adjacent extensions");
            let merged = ExtensionNode::new(ext_path.concat(&child_ext.path), child_ext.next);
            store.release(new_next)?;
            release_if_unfrozen(store, ext_id)?;
            Ok((store.create_extension(merged), true))
        }
        Node::Account(_) | Node::Value(_) => {
            let adjusted = extend_leaf_suffix(store, new_next, ext_path.len() as u8)?;
            release_if_unfrozen(store, ext_id)?;
            Ok((adjusted, true))
        }
        Node::Empty => unreachable!(),
    }
}

fn extend_leaf_suffix(store: &mut dyn NodeStore, leaf_id: NodeId, extra: u8) -> Result<NodeId, TrieError> {
    let tracked_len = match store.view(leaf_id)? {
        Node::Account(a) => a.path_length,
        Node::Value(v) => v.path_length,
        _ => {
            return Err(TrieError::InvalidInvariant(
                "extension child collapse expects a leaf".into(),
            ));
        }
    };
    let Some(len) = tracked_len else {
        return Ok(leaf_id);
    };
    let (new_id, mut node) = writable(store, leaf_id)?;
    set_leaf_path_length(&mut node, Some(len + extra));
    set_hash_dirty(&mut node);
    store.update(new_id, node)?;
    Ok(new_id)
}

/// Splits an Extension at a nibble inside its own path: an optional leading
/// Extension for the shared prefix, a fresh Branch at the divergence point,
/// and the original `next` (trimmed or reused whole) as one of its two
/// occupants. `new_leaf` must already carry its final `pathLength`.
fn split_extension(
    store: &mut dyn NodeStore,
    ext_id: NodeId,
    ext: &ExtensionNode,
    remaining: &Nibbles,
    common: usize,
    new_leaf: Node,
) -> Result<(NodeId, bool), TrieError> {
    trace!(extension = ?ext_id, common, "splitting extension on internal mismatch");
    let ext_remainder = ext.path.skip(common);
    let divergence_old = ext_remainder.at(0);
    let remainder_after = ext_remainder.skip(1);

    let remainder_ref: NodeReference = if remainder_after.is_empty() {
        ext.next
    } else {
        store.create_extension(ExtensionNode::new(remainder_after, ext.next)).into()
    };
    let remainder_frozen = store.view(remainder_ref.id)?.is_frozen();

    let new_leaf_id = store.create(new_leaf);
    let divergence_new = remaining.at(common);

    let mut branch = BranchNode::empty();
    branch.children[divergence_old as usize] = remainder_ref;
    branch.children[divergence_new as usize] = new_leaf_id.into();
    branch.set_child_dirty(divergence_old, true);
    branch.set_child_dirty(divergence_new, true);
    branch.set_child_frozen(divergence_old, remainder_frozen);
    let branch_id = store.create_branch(branch);

    let result_id = if common > 0 {
        store.create_extension(ExtensionNode::new(ext.path.take(common), branch_id.into()))
    } else {
        branch_id
    };

    release_if_unfrozen(store, ext_id)?;
    Ok((result_id, true))
}

/// `splitLeafNode`: two leaves of the same kind now disagree past `common`
/// nibbles of their remaining suffixes. Builds a Branch (optionally wrapped
/// in a leading Extension for the shared prefix) with the existing leaf and
/// `new_node` as its two occupants.
fn split_leaf_node(
    store: &mut dyn NodeStore,
    existing_id: NodeId,
    existing_suffix: &Nibbles,
    mut new_node: Node,
    new_suffix: &Nibbles,
    track: bool,
) -> Result<(NodeId, bool), TrieError> {
    trace!(existing = ?existing_id, "splitting leaf into a branch over two entries");
    let common = existing_suffix.common_prefix_len(new_suffix);
    let new_len = track.then(|| (new_suffix.len() - common - 1) as u8);
    let existing_len = track.then(|| (existing_suffix.len() - common - 1) as u8);

    set_leaf_path_length(&mut new_node, new_len);
    let new_id = store.create(new_node);

    let (existing_final_id, mut existing_node) = writable(store, existing_id)?;
    set_leaf_path_length(&mut existing_node, existing_len);
    set_hash_dirty(&mut existing_node);
    store.update(existing_final_id, existing_node)?;

    let existing_divergence = existing_suffix.at(common);
    let new_divergence = new_suffix.at(common);
    let mut branch = BranchNode::empty();
    branch.children[existing_divergence as usize] = existing_final_id.into();
    branch.children[new_divergence as usize] = new_id.into();
    branch.set_child_dirty(existing_divergence, true);
    branch.set_child_dirty(new_divergence, true);
    let branch_id = store.create_branch(branch);

    let result_id = if common > 0 {
        store.create_extension(ExtensionNode::new(existing_suffix.take(common), branch_id.into()))
    } else {
        branch_id
    };
    Ok((result_id, true))
}

// ---------------------------------------------------------------------
// Address-trie writes: SetAccount
// ---------------------------------------------------------------------

pub fn set_account(
    store: &mut dyn NodeStore,
    root: NodeId,
    address: &Address,
    info: AccountInfo,
) -> Result<(NodeId, bool), TrieError> {
    let config = store.get_config();
    let path = nibbles::address_path(address, &config);
    insert_account(store, root, address, info, &path, 0)
}

fn insert_account(
    store: &mut dyn NodeStore,
    id: NodeId,
    address: &Address,
    info: AccountInfo,
    path: &Nibbles,
    depth: usize,
) -> Result<(NodeId, bool), TrieError> {
    match store.view(id)? {
        Node::Empty => {
            if info.is_empty() {
                return Ok((NodeId::EMPTY, false));
            }
            let config = store.get_config();
            let path_length = leaf_path_length(&config, path, depth);
            Ok((store.create_account(AccountNode::new(*address, info, path_length)), true))
        }
        Node::Branch(b) => {
            let nibble = path.at(depth);
            let child = b.children[nibble as usize];
            let (new_child, changed) = insert_account(store, child.id, address, info, path, depth + 1)?;
            if !changed {
                return Ok((id, false));
            }
            collapse_or_update_branch(store, id, nibble, new_child, depth, path.len())
        }
        Node::Extension(e) => {
            let remaining = path.skip(depth);
            let common = e.path.common_prefix_len(&remaining);
            if common == e.path.len() {
                let (new_next, changed) =
                    insert_account(store, e.next.id, address, info, path, depth + e.path.len())?;
                if !changed {
                    return Ok((id, false));
                }
                handle_extension_child_result(store, id, e.path, new_next)
            } else {
                if info.is_empty() {
                    return Ok((id, false));
                }
                let config = store.get_config();
                let new_path_length = leaf_path_length(&config, path, depth + common + 1);
                let new_leaf = Node::Account(AccountNode::new(*address, info, new_path_length));
                split_extension(store, id, &e, &remaining, common, new_leaf)
            }
        }
        Node::Account(existing) => insert_account_leaf(store, id, existing, address, info, path, depth),
        Node::Value(_) => Err(TrieError::WrongVariant {
            expected: "Account",
            found: id,
        }),
    }
}

fn insert_account_leaf(
    store: &mut dyn NodeStore,
    id: NodeId,
    existing: AccountNode,
    address: &Address,
    info: AccountInfo,
    path: &Nibbles,
    depth: usize,
) -> Result<(NodeId, bool), TrieError> {
    if &existing.address == address {
        if existing.info == info {
            return Ok((id, false));
        }
        if info.is_empty() {
            release(store, existing.storage_root.id)?;
            release_if_unfrozen(store, id)?;
            return Ok((NodeId::EMPTY, true));
        }
        let (new_id, mut node) = writable(store, id)?;
        let a = node.as_account_mut()?;
        a.info = info;
        a.hash_dirty = true;
        store.update(new_id, node)?;
        return Ok((new_id, true));
    }

    if info.is_empty() {
        return Ok((id, false));
    }

    let config = store.get_config();
    let full_len = path.len();
    let existing_suffix_len = existing
        .path_length
        .map(|l| l as usize)
        .unwrap_or(full_len - depth);
    let existing_full_path = nibbles::address_path(&existing.address, &config);
    let existing_suffix = existing_full_path.suffix(existing_suffix_len);
    let new_suffix = path.suffix(full_len - depth);
    let new_leaf = Node::Account(AccountNode::new(*address, info, None));
    split_leaf_node(
        store,
        id,
        &existing_suffix,
        new_leaf,
        &new_suffix,
        config.track_suffix_lengths_in_leaf_nodes,
    )
}

// ---------------------------------------------------------------------
// Storage-trie writes: SetSlot, ClearStorage, and the Value-keyed insert
// they both eventually reach through (shared with nothing above it: a
// storage trie is structurally identical to the address trie but rooted at
// an account and leafed with Value instead of Account).
// ---------------------------------------------------------------------

pub fn set_slot(
    store: &mut dyn NodeStore,
    root: NodeId,
    address: &Address,
    key: &H256,
    value: H256,
) -> Result<(NodeId, bool), TrieError> {
    let config = store.get_config();
    let path = nibbles::address_path(address, &config);
    set_slot_rec(store, root, address, key, value, &path, 0)
}

fn set_slot_rec(
    store: &mut dyn NodeStore,
    id: NodeId,
    address: &Address,
    key: &H256,
    value: H256,
    path: &Nibbles,
    depth: usize,
) -> Result<(NodeId, bool), TrieError> {
    match store.view(id)? {
        Node::Empty => Ok((id, false)),
        Node::Branch(b) => {
            let nibble = path.at(depth);
            let child = b.children[nibble as usize];
            if child.is_empty() {
                return Ok((id, false));
            }
            let (new_child, changed) = set_slot_rec(store, child.id, address, key, value, path, depth + 1)?;
            if !changed {
                return Ok((id, false));
            }
            let (writable_id, mut node) = writable(store, id)?;
            let branch = node.as_branch_mut()?;
            branch.children[nibble as usize] = new_child.into();
            branch.set_child_dirty(nibble, true);
            branch.set_child_frozen(nibble, false);
            branch.hash_dirty = true;
            store.update(writable_id, node)?;
            Ok((writable_id, true))
        }
        Node::Extension(e) => {
            let remaining = path.skip(depth);
            if !e.path.is_prefix_of(&remaining) {
                return Ok((id, false));
            }
            let (new_next, changed) =
                set_slot_rec(store, e.next.id, address, key, value, path, depth + e.path.len())?;
            if !changed {
                return Ok((id, false));
            }
            let (writable_id, mut node) = writable(store, id)?;
            let ext = node.as_extension_mut()?;
            ext.next = new_next.into();
            ext.next_hash_dirty = true;
            ext.hash_dirty = true;
            store.update(writable_id, node)?;
            Ok((writable_id, true))
        }
        Node::Account(a) => {
            if &a.address != address {
                return Ok((id, false));
            }
            let config = store.get_config();
            let key_path = nibbles::key_path(key, &config);
            let (new_storage_root, changed) = insert_value(store, a.storage_root.id, key, value, &key_path, 0)?;
            if !changed {
                return Ok((id, false));
            }
            let (writable_id, mut node) = writable(store, id)?;
            let acc = node.as_account_mut()?;
            acc.storage_root = new_storage_root.into();
            acc.storage_hash_dirty = true;
            acc.hash_dirty = true;
            store.update(writable_id, node)?;
            Ok((writable_id, true))
        }
        Node::Value(_) => Err(TrieError::WrongVariant {
            expected: "Account",
            found: id,
        }),
    }
}

pub fn clear_storage(store: &mut dyn NodeStore, root: NodeId, address: &Address) -> Result<(NodeId, bool), TrieError> {
    let config = store.get_config();
    let path = nibbles::address_path(address, &config);
    clear_storage_rec(store, root, address, &path, 0)
}

fn clear_storage_rec(
    store: &mut dyn NodeStore,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    depth: usize,
) -> Result<(NodeId, bool), TrieError> {
    match store.view(id)? {
        Node::Empty => Ok((id, false)),
        Node::Branch(b) => {
            let nibble = path.at(depth);
            let child = b.children[nibble as usize];
            if child.is_empty() {
                return Ok((id, false));
            }
            let (new_child, changed) = clear_storage_rec(store, child.id, address, path, depth + 1)?;
            if !changed {
                return Ok((id, false));
            }
            let (writable_id, mut node) = writable(store, id)?;
            let branch = node.as_branch_mut()?;
            branch.children[nibble as usize] = new_child.into();
            branch.set_child_dirty(nibble, true);
            branch.set_child_frozen(nibble, false);
            branch.hash_dirty = true;
            store.update(writable_id, node)?;
            Ok((writable_id, true))
        }
        Node::Extension(e) => {
            let remaining = path.skip(depth);
            if !e.path.is_prefix_of(&remaining) {
                return Ok((id, false));
            }
            let (new_next, changed) = clear_storage_rec(store, e.next.id, address, path, depth + e.path.len())?;
            if !changed {
                return Ok((id, false));
            }
            let (writable_id, mut node) = writable(store, id)?;
            let ext = node.as_extension_mut()?;
            ext.next = new_next.into();
            ext.next_hash_dirty = true;
            ext.hash_dirty = true;
            store.update(writable_id, node)?;
            Ok((writable_id, true))
        }
        Node::Account(a) => {
            if &a.address != address || a.storage_root.is_empty() {
                return Ok((id, false));
            }
            release(store, a.storage_root.id)?;
            let (writable_id, mut node) = writable(store, id)?;
            let acc = node.as_account_mut()?;
            acc.storage_root = NodeReference::EMPTY;
            acc.storage_hash = crate::node::Hash::zero();
            acc.storage_hash_dirty = true;
            acc.hash_dirty = true;
            store.update(writable_id, node)?;
            Ok((writable_id, true))
        }
        Node::Value(_) => Err(TrieError::WrongVariant {
            expected: "Account",
            found: id,
        }),
    }
}

fn insert_value(
    store: &mut dyn NodeStore,
    id: NodeId,
    key: &H256,
    value: H256,
    path: &Nibbles,
    depth: usize,
) -> Result<(NodeId, bool), TrieError> {
    match store.view(id)? {
        Node::Empty => {
            if value.is_zero() {
                return Ok((NodeId::EMPTY, false));
            }
            let config = store.get_config();
            let path_length = leaf_path_length(&config, path, depth);
            Ok((store.create_value(ValueNode::new(*key, value, path_length)), true))
        }
        Node::Branch(b) => {
            let nibble = path.at(depth);
            let child = b.children[nibble as usize];
            let (new_child, changed) = insert_value(store, child.id, key, value, path, depth + 1)?;
            if !changed {
                return Ok((id, false));
            }
            collapse_or_update_branch(store, id, nibble, new_child, depth, path.len())
        }
        Node::Extension(e) => {
            let remaining = path.skip(depth);
            let common = e.path.common_prefix_len(&remaining);
            if common == e.path.len() {
                let (new_next, changed) = insert_value(store, e.next.id, key, value, path, depth + e.path.len())?;
                if !changed {
                    return Ok((id, false));
                }
                handle_extension_child_result(store, id, e.path, new_next)
            } else {
                if value.is_zero() {
                    return Ok((id, false));
                }
                let config = store.get_config();
                let new_path_length = leaf_path_length(&config, path, depth + common + 1);
                let new_leaf = Node::Value(ValueNode::new(*key, value, new_path_length));
                split_extension(store, id, &e, &remaining, common, new_leaf)
            }
        }
        Node::Value(existing) => insert_value_leaf(store, id, existing, key, value, path, depth),
        Node::Account(_) => Err(TrieError::WrongVariant {
            expected: "Value",
            found: id,
        }),
    }
}

fn insert_value_leaf(
    store: &mut dyn NodeStore,
    id: NodeId,
    existing: ValueNode,
    key: &H256,
    value: H256,
    path: &Nibbles,
    depth: usize,
) -> Result<(NodeId, bool), TrieError> {
    if &existing.key == key {
        if existing.value == value {
            return Ok((id, false));
        }
        if value.is_zero() {
            release_if_unfrozen(store, id)?;
            return Ok((NodeId::EMPTY, true));
        }
        let (new_id, mut node) = writable(store, id)?;
        let v = node.as_value_mut()?;
        v.value = value;
        v.hash_dirty = true;
        store.update(new_id, node)?;
        return Ok((new_id, true));
    }

    if value.is_zero() {
        return Ok((id, false));
    }

    let config = store.get_config();
    let full_len = path.len();
    let existing_suffix_len = existing
        .path_length
        .map(|l| l as usize)
        .unwrap_or(full_len - depth);
    let existing_full_path = nibbles::key_path(&existing.key, &config);
    let existing_suffix = existing_full_path.suffix(existing_suffix_len);
    let new_suffix = path.suffix(full_len - depth);
    let new_leaf = Node::Value(ValueNode::new(*key, value, None));
    split_leaf_node(
        store,
        id,
        &existing_suffix,
        new_leaf,
        &new_suffix,
        config.track_suffix_lengths_in_leaf_nodes,
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::HashAlgorithm;
    use crate::store::MemoryNodeStore;

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
    fn set_then_get_round_trips() {
        let mut s = store();
        let info = AccountInfo {
            nonce: 7,
            ..Default::default()
        };
        let (root, changed) = set_account(&mut s, NodeId::EMPTY, &addr(1), info).unwrap();
        assert!(changed);
        let (got, exists) = get_account(&s, root, &addr(1)).unwrap();
        assert!(exists);
        assert_eq!(got, info);
    }

    #[test]
    fn setting_the_same_info_is_a_no_op() {
        let mut s = store();
        let info = AccountInfo {
            nonce: 1,
            ..Default::default()
        };
        let (root, _) = set_account(&mut s, NodeId::EMPTY, &addr(1), info).unwrap();
        let (root2, changed) = set_account(&mut s, root, &addr(1), info).unwrap();
        assert!(!changed);
        assert_eq!(root, root2);
    }

    #[test]
    fn second_account_splits_into_branch_with_extension() {
        let mut s = store();
        let info1 = AccountInfo {
            nonce: 1,
            ..Default::default()
        };
        let info2 = AccountInfo {
            nonce: 2,
            ..Default::default()
        };
        let (root, _) = set_account(&mut s, NodeId::EMPTY, &addr(1), info1).unwrap();
        let (root, _) = set_account(&mut s, root, &addr(2), info2).unwrap();

        let (got1, exists1) = get_account(&s, root, &addr(1)).unwrap();
        let (got2, exists2) = get_account(&s, root, &addr(2)).unwrap();
        assert!(exists1 && exists2);
        assert_eq!(got1, info1);
        assert_eq!(got2, info2);
        assert!(matches!(s.read(root).unwrap(), Node::Extension(_)));
    }

    #[test]
    fn deleting_back_to_one_account_collapses_the_branch() {
        let mut s = store();
        let info1 = AccountInfo {
            nonce: 1,
            ..Default::default()
        };
        let info2 = AccountInfo {
            nonce: 2,
            ..Default::default()
        };
        let (root, _) = set_account(&mut s, NodeId::EMPTY, &addr(1), info1).unwrap();
        let (root, _) = set_account(&mut s, root, &addr(2), info2).unwrap();
        let (root, changed) = set_account(&mut s, root, &addr(1), AccountInfo::default()).unwrap();
        assert!(changed);
        assert!(matches!(s.read(root).unwrap(), Node::Account(_)));
        let (got2, exists2) = get_account(&s, root, &addr(2)).unwrap();
        assert!(exists2);
        assert_eq!(got2, info2);
        let (_, exists1) = get_account(&s, root, &addr(1)).unwrap();
        assert!(!exists1);
    }

    #[test]
    fn set_slot_then_get_slot_round_trips() {
        let mut s = store();
        let info = AccountInfo {
            nonce: 1,
            ..Default::default()
        };
        let (root, _) = set_account(&mut s, NodeId::EMPTY, &addr(1), info).unwrap();
        let key = H256::repeat_byte(9);
        let value = H256::repeat_byte(3);
        let (root, changed) = set_slot(&mut s, root, &addr(1), &key, value).unwrap();
        assert!(changed);
        let (got, exists) = get_slot(&s, root, &addr(1), &key).unwrap();
        assert!(exists);
        assert_eq!(got, value);
    }

    #[test]
    fn set_slot_on_missing_account_is_a_no_op() {
        let mut s = store();
        let (root, changed) = set_slot(
            &mut s,
            NodeId::EMPTY,
            &addr(1),
            &H256::repeat_byte(1),
            H256::repeat_byte(2),
        )
        .unwrap();
        assert!(!changed);
        assert_eq!(root, NodeId::EMPTY);
    }

    #[test]
    fn clear_storage_releases_the_subtree() {
        let mut s = store();
        let info = AccountInfo {
            nonce: 1,
            ..Default::default()
        };
        let (root, _) = set_account(&mut s, NodeId::EMPTY, &addr(1), info).unwrap();
        let (root, _) = set_slot(&mut s, root, &addr(1), &H256::repeat_byte(9), H256::repeat_byte(3)).unwrap();
        let before = s.len();
        let (root, changed) = clear_storage(&mut s, root, &addr(1)).unwrap();
        assert!(changed);
        assert!(s.len() < before);
        let (_, exists) = get_slot(&s, root, &addr(1), &H256::repeat_byte(9)).unwrap();
        assert!(!exists);
    }

    #[test]
    fn freezing_then_writing_leaves_the_old_root_readable() {
        let mut s = store();
        let info1 = AccountInfo {
            nonce: 1,
            ..Default::default()
        };
        let (root1, _) = set_account(&mut s, NodeId::EMPTY, &addr(1), info1).unwrap();
        crate::freeze::freeze(&mut s, root1).unwrap();

        let info2 = AccountInfo {
            nonce: 2,
            ..Default::default()
        };
        let (root2, _) = set_account(&mut s, root1, &addr(2), info2).unwrap();
        assert_ne!(root1, root2);

        let (got1_old, exists1_old) = get_account(&s, root1, &addr(1)).unwrap();
        assert!(exists1_old);
        assert_eq!(got1_old, info1);

        let (got1_new, exists1_new) = get_account(&s, root2, &addr(1)).unwrap();
        assert!(exists1_new);
        assert_eq!(got1_new, info1);
        let (got2_new, exists2_new) = get_account(&s, root2, &addr(2)).unwrap();
        assert!(exists2_new);
        assert_eq!(got2_new, info2);
    }

    proptest::proptest! {
        /// Random sequences of account sets/deletes over a small address
        /// space, checked against a `BTreeMap` oracle: whatever the oracle
        /// thinks is live after the sequence is exactly what `get_account`
        /// reports, regardless of how many splits/collapses happened along
        /// the way.
        #[test]
        fn random_account_sets_match_a_btreemap_oracle(
            updates in proptest::collection::vec((0u8..6, 0u64..1000), 1..40)
        ) {
            let mut s = store();
            let mut oracle = std::collections::BTreeMap::new();
            let mut root = NodeId::EMPTY;
            for (addr_last, nonce) in updates {
                let info = AccountInfo { nonce, ..Default::default() };
                let (new_root, _) = set_account(&mut s, root, &addr(addr_last), info).unwrap();
                root = new_root;
                if nonce == 0 {
                    oracle.remove(&addr_last);
                } else {
                    oracle.insert(addr_last, nonce);
                }
            }
            for addr_last in 0u8..6 {
                let (got, exists) = get_account(&s, root, &addr(addr_last)).unwrap();
                match oracle.get(&addr_last) {
                    Some(nonce) => {
                        proptest::prop_assert!(exists);
                        proptest::prop_assert_eq!(got.nonce, *nonce);
                    }
                    None => proptest::prop_assert!(!exists),
                }
            }
        }
    }
}
