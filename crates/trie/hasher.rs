//! The two pluggable hashing schemes (§4.6) and the dirty-hash protocol
//! that drives them.
//!
//! [`update_hashes`] is the sole clearer of `hashDirty`/child-dirty bits: it
//! walks dirty sub-trees bottom-up, refreshes child hashes and embedding
//! flags, then hashes the node itself. [`get_hash`] is read-only — it trusts
//! whatever is currently cached, dirty or not, and never mutates the store.

use bytes::BufMut;
use ethereum_types::U256;
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest as Sha3Digest, Keccak256};
use trie_rlp::encode::{RLPEncode, encode_length};

use crate::config::HashAlgorithm;
use crate::error::TrieError;
use crate::nibbles::{self, Nibbles};
use crate::node::{AccountNode, BranchNode, ExtensionNode, Hash, Node, NodeReference, ValueNode};
use crate::store::NodeStore;

pub fn update_hashes(store: &mut dyn NodeStore, root: crate::node::NodeId) -> Result<Hash, TrieError> {
    match store.get_config().hash_algorithm {
        HashAlgorithm::Direct => direct::update_hashes(store, root),
        HashAlgorithm::Ethereum => ethereum::update_hashes(store, root),
    }
}

pub fn get_hash(store: &dyn NodeStore, root: crate::node::NodeId) -> Result<Hash, TrieError> {
    match store.get_config().hash_algorithm {
        HashAlgorithm::Direct => direct::get_hash(store, root),
        HashAlgorithm::Ethereum => ethereum::get_hash(store, root),
    }
}

/// The hash of an empty storage/state sub-trie under the Ethereum scheme:
/// `Keccak256(RLP(""))`. Used as `storage_hash` for accounts with no storage.
pub fn empty_root_hash() -> Hash {
    ethereum::empty_hash()
}

fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(payload_len + 9);
    encode_length(payload_len, &mut out as &mut dyn BufMut);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

fn leaf_suffix(depth: usize, tracked: Option<u8>, full_path: &Nibbles) -> Nibbles {
    let len = tracked
        .map(|l| l as usize)
        .unwrap_or_else(|| full_path.len().saturating_sub(depth));
    full_path.suffix(len)
}

mod ethereum {
    use super::*;

    pub fn empty_hash() -> Hash {
        Hash::from_slice(&Keccak256::digest([0x80u8]))
    }

    fn keccak(bytes: &[u8]) -> Hash {
        Hash::from_slice(&Keccak256::digest(bytes))
    }

    /// This node's own RLP encoding, trusting whatever is currently cached
    /// on its children (dirty or not) — the read-only half of the protocol.
    /// Only recurses through embedded children, since those have no
    /// independently cached raw encoding to reuse.
    fn raw_encode(store: &dyn NodeStore, node: &Node, depth: usize) -> Result<Vec<u8>, TrieError> {
        match node {
            Node::Empty => Ok(vec![0x80]),
            Node::Branch(b) => encode_branch(store, b, depth),
            Node::Extension(e) => encode_extension(store, e, depth),
            Node::Account(a) => encode_account(store, a, depth),
            Node::Value(v) => Ok(encode_value(v, depth)),
        }
    }

    fn child_item(
        store: &dyn NodeStore,
        child: NodeReference,
        cached_hash: Hash,
        embedded: bool,
        depth: usize,
    ) -> Result<Vec<u8>, TrieError> {
        if child.is_empty() {
            return Ok(vec![0x80]);
        }
        if embedded {
            let node = store.read(child.id)?;
            raw_encode(store, &node, depth)
        } else {
            Ok(cached_hash.as_bytes().encode_to_vec())
        }
    }

    fn encode_branch(store: &dyn NodeStore, b: &BranchNode, depth: usize) -> Result<Vec<u8>, TrieError> {
        let mut items = Vec::with_capacity(17);
        for nibble in 0u8..16 {
            let child = b.children[nibble as usize];
            items.push(child_item(
                store,
                child,
                b.child_hashes[nibble as usize],
                b.is_embedded(nibble),
                depth + 1,
            )?);
        }
        // The 17th slot is the terminator "value" item, unused for
        // state/storage tries (only relevant to the receipt/tx tries).
        items.push(vec![0x80]);
        Ok(rlp_list(&items))
    }

    fn encode_extension(store: &dyn NodeStore, e: &ExtensionNode, depth: usize) -> Result<Vec<u8>, TrieError> {
        let path_item = e.path.encode_compact(false).encode_to_vec();
        let next_item = child_item(store, e.next, e.next_hash, e.next_is_embedded, depth + e.path.len())?;
        Ok(rlp_list(&[path_item, next_item]))
    }

    fn encode_account(store: &dyn NodeStore, a: &AccountNode, depth: usize) -> Result<Vec<u8>, TrieError> {
        let storage_hash = if a.storage_root.is_empty() {
            empty_hash()
        } else {
            a.storage_hash
        };
        let account_value = rlp_list(&[
            a.info.nonce.encode_to_vec(),
            a.info.balance.encode_to_vec(),
            storage_hash.as_bytes().encode_to_vec(),
            a.info.code_hash.as_bytes().encode_to_vec(),
        ]);
        // State-trie leaves store the account record as a nested byte
        // string: the leaf's value item is RLP(account_value), i.e. the
        // already-RLP-encoded account bytes wrapped again as a string.
        let value_item = account_value.as_slice().encode_to_vec();

        let full_path = nibbles::address_path(&a.address, &store.get_config());
        let suffix = leaf_suffix(depth, a.path_length, &full_path);
        let path_item = suffix.encode_compact(true).encode_to_vec();
        Ok(rlp_list(&[path_item, value_item]))
    }

    fn encode_value(v: &ValueNode, depth: usize) -> Vec<u8> {
        let full_path = Nibbles::from_bytes(v.key.as_bytes());
        let suffix = leaf_suffix(depth, v.path_length, &full_path);
        let path_item = suffix.encode_compact(true).encode_to_vec();
        // Storage-trie values are the minimal big-endian encoding of the
        // 32-byte word, i.e. exactly what U256's own RLPEncode produces.
        let value_item = U256::from_big_endian(v.value.as_bytes()).encode_to_vec();
        rlp_list(&[path_item, value_item])
    }

    pub fn get_hash(store: &dyn NodeStore, root: crate::node::NodeId) -> Result<Hash, TrieError> {
        if root.is_empty() {
            return Ok(empty_hash());
        }
        let node = store.read(root)?;
        let raw = raw_encode(store, &node, 0)?;
        Ok(keccak(&raw))
    }

    pub fn update_hashes(store: &mut dyn NodeStore, root: crate::node::NodeId) -> Result<Hash, TrieError> {
        update_hashes_rec(store, root, 0)
    }

    fn update_hashes_rec(store: &mut dyn NodeStore, id: crate::node::NodeId, depth: usize) -> Result<Hash, TrieError> {
        if id.is_empty() {
            return Ok(empty_hash());
        }
        let mut node = store.write(id)?;
        match &mut node {
            Node::Empty => {}
            Node::Branch(b) => {
                if b.hash_dirty {
                    for nibble in 0u8..16 {
                        if !b.is_child_dirty(nibble) {
                            continue;
                        }
                        let child = b.children[nibble as usize];
                        if child.is_empty() {
                            b.child_hashes[nibble as usize] = Hash::zero();
                            b.set_embedded(nibble, false);
                        } else {
                            let child_hash = update_hashes_rec(store, child.id, depth + 1)?;
                            b.child_hashes[nibble as usize] = child_hash;
                            let child_node = store.read(child.id)?;
                            let raw = raw_encode(store, &child_node, depth + 1)?;
                            b.set_embedded(nibble, raw.len() < 32);
                        }
                        b.set_child_dirty(nibble, false);
                    }
                    let raw = encode_branch(store, b, depth)?;
                    b.hash = keccak(&raw);
                    b.hash_dirty = false;
                }
            }
            Node::Extension(e) => {
                if e.hash_dirty {
                    if e.next_hash_dirty {
                        let child_depth = depth + e.path.len();
                        let child_hash = update_hashes_rec(store, e.next.id, child_depth)?;
                        e.next_hash = child_hash;
                        let child_node = store.read(e.next.id)?;
                        let raw = raw_encode(store, &child_node, child_depth)?;
                        e.next_is_embedded = raw.len() < 32;
                        e.next_hash_dirty = false;
                    }
                    let raw = encode_extension(store, e, depth)?;
                    e.hash = keccak(&raw);
                    e.hash_dirty = false;
                }
            }
            Node::Account(a) => {
                if a.hash_dirty {
                    if a.storage_hash_dirty {
                        a.storage_hash = if a.storage_root.is_empty() {
                            empty_hash()
                        } else {
                            update_hashes_rec(store, a.storage_root.id, 0)?
                        };
                        a.storage_hash_dirty = false;
                    }
                    let raw = encode_account(store, a, depth)?;
                    a.hash = keccak(&raw);
                    a.hash_dirty = false;
                }
            }
            Node::Value(v) => {
                if v.hash_dirty {
                    let raw = encode_value(v, depth);
                    v.hash = keccak(&raw);
                    v.hash_dirty = false;
                }
            }
        }
        let hash = node.hash();
        store.update_hash(id, node)?;
        Ok(hash)
    }
}

mod direct {
    use super::*;

    /// A fixed tagged encoding over a node's own fields and its children's
    /// *cached* hashes — no recursion, no embedding: direct mode always
    /// references children by hash.
    fn digest(node: &Node) -> Hash {
        if matches!(node, Node::Empty) {
            return Hash::zero();
        }
        let mut hasher = Sha256::new();
        match node {
            Node::Empty => unreachable!(),
            Node::Branch(b) => {
                hasher.update(b"branch");
                for h in &b.child_hashes {
                    hasher.update(h.as_bytes());
                }
            }
            Node::Extension(e) => {
                hasher.update(b"extension");
                hasher.update([e.path.len() as u8]);
                hasher.update(e.path.as_slice());
                hasher.update(e.next_hash.as_bytes());
            }
            Node::Account(a) => {
                hasher.update(b"account");
                hasher.update(a.address.as_bytes());
                hasher.update(a.info.nonce.to_be_bytes());
                hasher.update(a.info.balance.to_big_endian());
                hasher.update(a.info.code_hash.as_bytes());
                hasher.update(a.storage_hash.as_bytes());
            }
            Node::Value(v) => {
                hasher.update(b"value");
                hasher.update(v.key.as_bytes());
                hasher.update(v.value.as_bytes());
            }
        }
        Hash::from_slice(&hasher.finalize())
    }

    pub fn get_hash(store: &dyn NodeStore, root: crate::node::NodeId) -> Result<Hash, TrieError> {
        if root.is_empty() {
            return Ok(Hash::zero());
        }
        Ok(digest(&store.read(root)?))
    }

    pub fn update_hashes(store: &mut dyn NodeStore, root: crate::node::NodeId) -> Result<Hash, TrieError> {
        update_hashes_rec(store, root)
    }

    fn update_hashes_rec(store: &mut dyn NodeStore, id: crate::node::NodeId) -> Result<Hash, TrieError> {
        if id.is_empty() {
            return Ok(Hash::zero());
        }
        let mut node = store.write(id)?;
        match &mut node {
            Node::Empty => {}
            Node::Branch(b) => {
                if b.hash_dirty {
                    for nibble in 0u8..16 {
                        if !b.is_child_dirty(nibble) {
                            continue;
                        }
                        let child = b.children[nibble as usize];
                        b.child_hashes[nibble as usize] = if child.is_empty() {
                            Hash::zero()
                        } else {
                            update_hashes_rec(store, child.id)?
                        };
                        b.set_child_dirty(nibble, false);
                    }
                }
            }
            Node::Extension(e) => {
                if e.hash_dirty && e.next_hash_dirty {
                    e.next_hash = if e.next.is_empty() {
                        Hash::zero()
                    } else {
                        update_hashes_rec(store, e.next.id)?
                    };
                    e.next_hash_dirty = false;
                }
            }
            Node::Account(a) => {
                if a.hash_dirty && a.storage_hash_dirty {
                    a.storage_hash = if a.storage_root.is_empty() {
                        Hash::zero()
                    } else {
                        update_hashes_rec(store, a.storage_root.id)?
                    };
                    a.storage_hash_dirty = false;
                }
            }
            Node::Value(_) => {}
        }
        if node.is_hash_dirty() {
            let new_hash = digest(&node);
            match &mut node {
                Node::Branch(b) => {
                    b.hash = new_hash;
                    b.hash_dirty = false;
                }
                Node::Extension(e) => {
                    e.hash = new_hash;
                    e.hash_dirty = false;
                }
                Node::Account(a) => {
                    a.hash = new_hash;
                    a.hash_dirty = false;
                }
                Node::Value(v) => {
                    v.hash = new_hash;
                    v.hash_dirty = false;
                }
                Node::Empty => {}
            }
        }
        let hash = node.hash();
        store.update_hash(id, node)?;
        Ok(hash)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::EngineConfig;
    use crate::node::{AccountInfo, NodeId};
    use crate::store::MemoryNodeStore;
    use ethereum_types::{Address, H256};
    use hex_literal::hex;

    fn ethereum_store() -> MemoryNodeStore {
        MemoryNodeStore::new(EngineConfig {
            use_hashed_paths: false,
            track_suffix_lengths_in_leaf_nodes: true,
            hash_algorithm: HashAlgorithm::Ethereum,
        })
    }

    #[test]
    fn empty_trie_hash_matches_keccak_of_rlp_empty_string() {
        let store = ethereum_store();
        let hash = get_hash(&store, NodeId::EMPTY).unwrap();
        assert_eq!(
            hash,
            H256(hex!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421")),
        );
    }

    /// End-to-end scenario 1: a single account at `0x00..01` is the whole
    /// trie. Root hash independently computed against the yellow paper.
    #[test]
    fn single_account_leaf_matches_known_ethereum_root_hash() {
        let mut store = ethereum_store();
        let mut address_bytes = [0u8; 20];
        address_bytes[19] = 1;
        let address = Address::from(address_bytes);
        let info = AccountInfo {
            nonce: 1,
            balance: U256::zero(),
            code_hash: H256::zero(),
        };
        let path = nibbles::address_path(&address, &store.get_config());
        assert_eq!(path.len(), 40);
        let account = AccountNode::new(address, info, Some(path.len() as u8));
        let id = store.create_account(account);

        let hash = update_hashes(&mut store, id).unwrap();

        assert_eq!(
            hash,
            H256(hex!("f723c887da32a764e4f7a9c6f6a79f09841e8302a811a46e24d498ac58969d7b")),
        );
    }

    #[test]
    fn get_hash_does_not_mutate_dirty_bits() {
        let mut store = ethereum_store();
        let value = ValueNode::new(H256::repeat_byte(3), H256::repeat_byte(4), Some(64));
        let id = store.create_value(value);
        let before = store.read(id).unwrap();
        assert!(before.is_hash_dirty());
        let _ = get_hash(&store, id).unwrap();
        let after = store.read(id).unwrap();
        assert!(after.is_hash_dirty());
    }

    #[test]
    fn direct_hasher_never_embeds_and_hashes_empty_to_zero() {
        let mut store = MemoryNodeStore::new(EngineConfig {
            use_hashed_paths: false,
            track_suffix_lengths_in_leaf_nodes: true,
            hash_algorithm: HashAlgorithm::Direct,
        });
        assert_eq!(get_hash(&store, NodeId::EMPTY).unwrap(), Hash::zero());
        let value = ValueNode::new(H256::repeat_byte(1), H256::repeat_byte(2), Some(64));
        let id = store.create_value(value);
        let hash = update_hashes(&mut store, id).unwrap();
        assert_ne!(hash, Hash::zero());
    }
}
