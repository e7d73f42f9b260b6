//! Fixed-size on-disk layouts for each node variant (§4.7).
//!
//! Every variant has two encodings: *with node hash* (the node's own hash is
//! stored; every child-hash-dirty bit comes back set on load, since child
//! hashes were not persisted) and *with child hash* (child hashes and
//! embedding flags are stored; the node's own `hashDirty` comes back set,
//! since its hash was not persisted). A storage layer picks whichever suits
//! its access pattern — the core engine (§4.3–§4.6) never calls into this
//! module itself, it is here purely as the encode/decode contract a
//! disk-backed [`crate::store::NodeStore`] would implement against.
//!
//! Encoding a node whose relevant cache is dirty is a precondition
//! violation, not a recoverable error path: every encoder here refuses with
//! [`TrieError::DirtyHash`] rather than silently persisting stale bytes.
//! `frozen` is never encoded — it is a forest-membership fact the storage
//! layer tracks itself, not a property of the node's content.

use bytes::{Buf, BufMut};
use ethereum_types::{Address, H256, U256};

use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node::{AccountInfo, AccountNode, BranchNode, ExtensionNode, Hash, NodeId, NodeKind, ValueNode};

const ID_LEN: usize = 9;
const HASH_LEN: usize = 32;
const ACCOUNT_INFO_LEN: usize = 8 + 32 + 32;

fn encode_id(id: NodeId, out: &mut Vec<u8>) {
    if id.is_empty() {
        out.put_u64(u64::MAX);
        out.put_u8(0);
    } else {
        out.put_u64(id.index() as u64);
        out.put_u8(match id.kind() {
            NodeKind::Empty => 0,
            NodeKind::Branch => 1,
            NodeKind::Extension => 2,
            NodeKind::Account => 3,
            NodeKind::Value => 4,
        });
    }
}

fn decode_id(buf: &mut &[u8]) -> NodeId {
    let index = buf.get_u64() as usize;
    let tag = buf.get_u8();
    match tag {
        1 => NodeId::new(index, NodeKind::Branch),
        2 => NodeId::new(index, NodeKind::Extension),
        3 => NodeId::new(index, NodeKind::Account),
        4 => NodeId::new(index, NodeKind::Value),
        _ => NodeId::EMPTY,
    }
}

fn encode_account_info(info: &AccountInfo, out: &mut Vec<u8>) {
    out.put_u64(info.nonce);
    out.extend_from_slice(&info.balance.to_big_endian());
    out.extend_from_slice(info.code_hash.as_bytes());
}

fn decode_account_info(buf: &mut &[u8]) -> AccountInfo {
    let nonce = buf.get_u64();
    let mut balance_bytes = [0u8; 32];
    buf.copy_to_slice(&mut balance_bytes);
    let mut code_hash_bytes = [0u8; 32];
    buf.copy_to_slice(&mut code_hash_bytes);
    AccountInfo {
        nonce,
        balance: U256::from_big_endian(&balance_bytes),
        code_hash: H256::from(code_hash_bytes),
    }
}

/// A compact-encoded path, length-prefixed so its byte count is recoverable
/// without re-deriving the nibble count from context.
fn encode_path(path: &Nibbles, is_leaf: bool, out: &mut Vec<u8>) {
    out.put_u16(path.len() as u16);
    out.extend_from_slice(&path.encode_compact(is_leaf));
}

fn decode_path(buf: &mut &[u8]) -> Nibbles {
    let nibble_len = buf.get_u16() as usize;
    let byte_len = nibble_len / 2 + 1;
    let mut bytes = vec![0u8; byte_len];
    buf.copy_to_slice(&mut bytes);
    Nibbles::decode_compact(&bytes).0
}

// --- Branch -------------------------------------------------------------

pub fn encode_branch_with_node_hash(id: NodeId, branch: &BranchNode) -> Result<Vec<u8>, TrieError> {
    if branch.hash_dirty {
        return Err(TrieError::DirtyHash(id));
    }
    let mut out = Vec::with_capacity(16 * ID_LEN + HASH_LEN);
    for child in &branch.children {
        encode_id(child.id, &mut out);
    }
    out.extend_from_slice(branch.hash.as_bytes());
    Ok(out)
}

pub fn decode_branch_with_node_hash(mut buf: &[u8]) -> BranchNode {
    let mut branch = BranchNode::empty();
    for slot in branch.children.iter_mut() {
        slot.id = decode_id(&mut buf);
    }
    let mut hash_bytes = [0u8; 32];
    buf.copy_to_slice(&mut hash_bytes);
    branch.hash = Hash::from(hash_bytes);
    branch.hash_dirty = false;
    for (nibble, child) in branch.children.iter().enumerate() {
        if !child.is_empty() {
            branch.set_child_dirty(nibble as u8, true);
        }
    }
    branch
}

pub fn encode_branch_with_child_hashes(id: NodeId, branch: &BranchNode) -> Result<Vec<u8>, TrieError> {
    if branch.dirty_hashes != 0 {
        return Err(TrieError::DirtyHash(id));
    }
    let mut out = Vec::with_capacity(16 * ID_LEN + 16 * HASH_LEN + 2);
    for child in &branch.children {
        encode_id(child.id, &mut out);
    }
    for hash in &branch.child_hashes {
        out.extend_from_slice(hash.as_bytes());
    }
    out.put_u16(branch.embedded_children);
    Ok(out)
}

pub fn decode_branch_with_child_hashes(mut buf: &[u8]) -> BranchNode {
    let mut branch = BranchNode::empty();
    for slot in branch.children.iter_mut() {
        slot.id = decode_id(&mut buf);
    }
    for hash in branch.child_hashes.iter_mut() {
        let mut bytes = [0u8; 32];
        buf.copy_to_slice(&mut bytes);
        *hash = Hash::from(bytes);
    }
    branch.embedded_children = buf.get_u16();
    branch.hash_dirty = true;
    branch
}

// --- Extension ------------------------------------------------------------

pub fn encode_extension_with_node_hash(id: NodeId, ext: &ExtensionNode) -> Result<Vec<u8>, TrieError> {
    if ext.hash_dirty {
        return Err(TrieError::DirtyHash(id));
    }
    let mut out = Vec::new();
    encode_path(&ext.path, false, &mut out);
    encode_id(ext.next.id, &mut out);
    out.extend_from_slice(ext.hash.as_bytes());
    Ok(out)
}

pub fn decode_extension_with_node_hash(mut buf: &[u8]) -> ExtensionNode {
    let path = decode_path(&mut buf);
    let next = decode_id(&mut buf);
    let mut hash_bytes = [0u8; 32];
    buf.copy_to_slice(&mut hash_bytes);
    let mut ext = ExtensionNode::new(path, next.into());
    ext.hash = Hash::from(hash_bytes);
    ext.hash_dirty = false;
    ext.next_hash_dirty = true;
    ext
}

pub fn encode_extension_with_child_hash(id: NodeId, ext: &ExtensionNode) -> Result<Vec<u8>, TrieError> {
    if ext.next_hash_dirty {
        return Err(TrieError::DirtyHash(id));
    }
    let mut out = Vec::new();
    encode_path(&ext.path, false, &mut out);
    encode_id(ext.next.id, &mut out);
    out.extend_from_slice(ext.next_hash.as_bytes());
    out.put_u8(ext.next_is_embedded as u8);
    Ok(out)
}

pub fn decode_extension_with_child_hash(mut buf: &[u8]) -> ExtensionNode {
    let path = decode_path(&mut buf);
    let next = decode_id(&mut buf);
    let mut hash_bytes = [0u8; 32];
    buf.copy_to_slice(&mut hash_bytes);
    let embedded = buf.get_u8() != 0;
    let mut ext = ExtensionNode::new(path, next.into());
    ext.next_hash = Hash::from(hash_bytes);
    ext.next_is_embedded = embedded;
    ext.next_hash_dirty = false;
    ext
}

// --- Account --------------------------------------------------------------

fn encode_account_common(account: &AccountNode, out: &mut Vec<u8>) {
    out.extend_from_slice(account.address.as_bytes());
    encode_account_info(&account.info, out);
    encode_id(account.storage_root.id, out);
    match account.path_length {
        Some(len) => {
            out.put_u8(1);
            out.put_u8(len);
        }
        None => out.put_u8(0),
    }
}

fn decode_account_common(buf: &mut &[u8]) -> (Address, AccountInfo, NodeId, Option<u8>) {
    let mut addr_bytes = [0u8; 20];
    buf.copy_to_slice(&mut addr_bytes);
    let info = decode_account_info(buf);
    let storage_root = decode_id(buf);
    let has_len = buf.get_u8() != 0;
    let path_length = if has_len { Some(buf.get_u8()) } else { None };
    (Address::from(addr_bytes), info, storage_root, path_length)
}

pub fn encode_account_with_node_hash(id: NodeId, account: &AccountNode) -> Result<Vec<u8>, TrieError> {
    if account.hash_dirty {
        return Err(TrieError::DirtyHash(id));
    }
    let mut out = Vec::with_capacity(20 + ACCOUNT_INFO_LEN + ID_LEN + 2 + HASH_LEN);
    encode_account_common(account, &mut out);
    out.extend_from_slice(account.hash.as_bytes());
    Ok(out)
}

pub fn decode_account_with_node_hash(mut buf: &[u8]) -> AccountNode {
    let (address, info, storage_root, path_length) = decode_account_common(&mut buf);
    let mut hash_bytes = [0u8; 32];
    buf.copy_to_slice(&mut hash_bytes);
    let mut account = AccountNode::new(address, info, path_length);
    account.storage_root = storage_root.into();
    account.hash = Hash::from(hash_bytes);
    account.hash_dirty = false;
    account.storage_hash_dirty = true;
    account
}

pub fn encode_account_with_storage_hash(id: NodeId, account: &AccountNode) -> Result<Vec<u8>, TrieError> {
    if account.storage_hash_dirty {
        return Err(TrieError::DirtyHash(id));
    }
    let mut out = Vec::with_capacity(20 + ACCOUNT_INFO_LEN + ID_LEN + 2 + HASH_LEN);
    encode_account_common(account, &mut out);
    out.extend_from_slice(account.storage_hash.as_bytes());
    Ok(out)
}

pub fn decode_account_with_storage_hash(mut buf: &[u8]) -> AccountNode {
    let (address, info, storage_root, path_length) = decode_account_common(&mut buf);
    let mut hash_bytes = [0u8; 32];
    buf.copy_to_slice(&mut hash_bytes);
    let mut account = AccountNode::new(address, info, path_length);
    account.storage_root = storage_root.into();
    account.storage_hash = Hash::from(hash_bytes);
    account.storage_hash_dirty = false;
    account
}

// --- Value ------------------------------------------------------------

fn encode_value_common(value: &ValueNode, out: &mut Vec<u8>) {
    out.extend_from_slice(value.key.as_bytes());
    out.extend_from_slice(value.value.as_bytes());
    match value.path_length {
        Some(len) => {
            out.put_u8(1);
            out.put_u8(len);
        }
        None => out.put_u8(0),
    }
}

fn decode_value_common(buf: &mut &[u8]) -> (H256, H256, Option<u8>) {
    let mut key_bytes = [0u8; 32];
    buf.copy_to_slice(&mut key_bytes);
    let mut value_bytes = [0u8; 32];
    buf.copy_to_slice(&mut value_bytes);
    let has_len = buf.get_u8() != 0;
    let path_length = if has_len { Some(buf.get_u8()) } else { None };
    (H256::from(key_bytes), H256::from(value_bytes), path_length)
}

pub fn encode_value_with_node_hash(id: NodeId, value: &ValueNode) -> Result<Vec<u8>, TrieError> {
    if value.hash_dirty {
        return Err(TrieError::DirtyHash(id));
    }
    let mut out = Vec::with_capacity(64 + 2 + HASH_LEN);
    encode_value_common(value, &mut out);
    out.extend_from_slice(value.hash.as_bytes());
    Ok(out)
}

pub fn decode_value_with_node_hash(mut buf: &[u8]) -> ValueNode {
    let (key, val, path_length) = decode_value_common(&mut buf);
    let mut hash_bytes = [0u8; 32];
    buf.copy_to_slice(&mut hash_bytes);
    let mut node = ValueNode::new(key, val, path_length);
    node.hash = Hash::from(hash_bytes);
    node.hash_dirty = false;
    node
}

/// A `Value` leaf has no children, so "with child hash" degenerates to just
/// the key/value/pathLength payload without any node hash at all.
pub fn encode_value_bare(value: &ValueNode) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + 2);
    encode_value_common(value, &mut out);
    out
}

pub fn decode_value_bare(mut buf: &[u8]) -> ValueNode {
    let (key, val, path_length) = decode_value_common(&mut buf);
    ValueNode::new(key, val, path_length)
}
